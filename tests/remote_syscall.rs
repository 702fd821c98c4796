//! End-to-end injection tests against a forked child.
//!
//! The child is a fork of the test process, so static addresses are valid
//! in both and the parent can verify target memory through ptrace.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use libc::pid_t;

use graft::compel::ptrace::{peek_area, peek_word, poke_area};
use graft::compel::{
    swap_area, wait_task, FpuFlags, ParasiteSession, ProcStatusProbe, TargetArch, TaskState,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fork a child that spins in short sleeps until killed.
fn spawn_spinner() -> pid_t {
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            loop {
                libc::usleep(1000);
            }
        }
        pid
    }
}

fn kill_spinner(pid: pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        let mut status = 0;
        libc::waitpid(pid, &mut status, 0);
    }
}

// Lives at the same address in the forked child.
static SPIN_DATA: [u64; 3] = [0x1111_1111_1111_1111, 0x2222_2222_2222_2222, 0x3333_3333_3333_3333];

fn as_bytes(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_ne_bytes()).collect()
}

#[test]
fn swap_area_round_trip() {
    init_log();
    let pid = spawn_spinner();
    let mut probe = ProcStatusProbe;
    let session = ParasiteSession::attach(pid, TargetArch::host().unwrap(), &mut probe).unwrap();

    let addr = SPIN_DATA.as_ptr() as u64;
    let orig = as_bytes(&SPIN_DATA);

    // any word multiple is accepted
    for len in [8usize, 16, 24] {
        let mut buf = vec![0u8; len];
        peek_area(pid, &mut buf, addr).unwrap();
        assert_eq!(buf, orig[..len]);
    }

    let mut buf = vec![0xAAu8; 16];
    swap_area(pid, addr, &mut buf).unwrap();
    assert_eq!(buf, orig[..16], "swap returns the displaced bytes");

    let mut cur = [0u8; 16];
    peek_area(pid, &mut cur, addr).unwrap();
    assert_eq!(cur, [0xAAu8; 16]);

    // second swap with the returned buffer undoes the first
    swap_area(pid, addr, &mut buf).unwrap();
    assert_eq!(buf, vec![0xAAu8; 16]);
    let mut fin = [0u8; 24];
    peek_area(pid, &mut fin, addr).unwrap();
    assert_eq!(fin[..], orig[..]);

    session.release().unwrap();
    kill_spinner(pid);
}

#[test]
fn remote_getpid_leaves_no_trace() {
    init_log();
    let pid = spawn_spinner();
    let mut probe = ProcStatusProbe;
    let mut session = ParasiteSession::attach(pid, TargetArch::host().unwrap(), &mut probe).unwrap();

    let (ctx, fpu) = session.capture().unwrap();
    assert!(fpu.flags().contains(FpuFlags::FP));

    let slot = session.syscall_ip();
    assert_eq!(slot % 8, 0);
    assert!(slot <= ctx.regs.ip());

    let mut before = [0u8; 8];
    peek_area(pid, &mut before, slot).unwrap();

    let ret = session.execute_syscall(libc::SYS_getpid as u64, &[]).unwrap();
    assert_eq!(ret, pid as i64);

    // a second call through the already-restored context
    let ret = session.execute_syscall(libc::SYS_getpid as u64, &[]).unwrap();
    assert_eq!(ret, pid as i64);

    let mut after = [0u8; 8];
    peek_area(pid, &mut after, slot).unwrap();
    assert_eq!(before, after, "injected code was not cleaned up");

    session.release().unwrap();
    kill_spinner(pid);
}

#[test]
fn remote_mmap_and_munmap() {
    init_log();
    let pid = spawn_spinner();
    let mut probe = ProcStatusProbe;
    let mut session = ParasiteSession::attach(pid, TargetArch::host().unwrap(), &mut probe).unwrap();
    session.capture().unwrap();

    let addr = session
        .remote_mmap(
            0,
            4096,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
        .unwrap();
    assert_ne!(addr, 0);
    assert_eq!(addr % 4096, 0);

    let word = 0xdead_beef_cafe_f00du64.to_ne_bytes();
    poke_area(pid, &word, addr).unwrap();
    let mut back = [0u8; 8];
    peek_area(pid, &mut back, addr).unwrap();
    assert_eq!(back, word);

    session.remote_munmap(addr, 4096).unwrap();
    assert!(
        peek_word(pid, addr).is_err(),
        "mapping still readable after munmap"
    );

    session.release().unwrap();
    kill_spinner(pid);
}

#[test]
fn failed_remote_syscall_reports_errno() {
    init_log();
    let pid = spawn_spinner();
    let mut probe = ProcStatusProbe;
    let mut session = ParasiteSession::attach(pid, TargetArch::host().unwrap(), &mut probe).unwrap();
    session.capture().unwrap();

    // munmap with an unaligned address fails with EINVAL inside the target
    let err = session.remote_munmap(0x123, 4096).unwrap_err();
    match err {
        graft::InfectError::SyscallFailed(e) => assert_eq!(e, libc::EINVAL),
        other => panic!("expected SyscallFailed, got {:?}", other),
    }

    // the session survives a failed call
    let ret = session.execute_syscall(libc::SYS_getpid as u64, &[]).unwrap();
    assert_eq!(ret, pid as i64);

    session.release().unwrap();
    kill_spinner(pid);
}

#[test]
fn zombie_child_is_classified_not_infected() {
    init_log();
    let pid = unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            libc::_exit(0);
        }
        pid
    };

    // unreaped child settles into Z
    let mut probe = ProcStatusProbe;
    let mut state = TaskState::Alive;
    for _ in 0..100 {
        state = wait_task(pid, -1, &mut probe).unwrap();
        if state == TaskState::Zombie {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(state, TaskState::Zombie);

    match ParasiteSession::attach(pid, TargetArch::host().unwrap(), &mut probe) {
        Err(graft::InfectError::AttachFailed { pid: p, .. }) => assert_eq!(p, pid),
        Ok(_) => panic!("attached to a zombie"),
        Err(other) => panic!("unexpected error {:?}", other),
    }

    unsafe {
        let mut status = 0;
        libc::waitpid(pid, &mut status, 0);
    }
}
