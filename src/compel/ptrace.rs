//! Raw ptrace wrappers: word-granular memory access, regset and sigmask I/O.

use std::io;
use std::mem;
use std::ptr;

use libc::{c_long, c_uint, c_void, iovec, pid_t};

use super::arch::KRtSigset;
use crate::error::{InfectError, Result};

pub const PTRACE_SETOPTIONS: c_uint = 0x4200;
pub const PTRACE_GETREGSET: c_uint = 0x4204;
pub const PTRACE_SETREGSET: c_uint = 0x4205;
pub const PTRACE_SEIZE: c_uint = 0x4206;
pub const PTRACE_INTERRUPT: c_uint = 0x4207;
pub const PTRACE_GETSIGMASK: c_uint = 0x420a;
pub const PTRACE_SETSIGMASK: c_uint = 0x420b;

pub const PTRACE_CONT: c_uint = 7;
pub const PTRACE_DETACH: c_uint = 17;

/// PTRACE_O_SUSPEND_SECCOMP option
pub const PTRACE_O_SUSPEND_SECCOMP: c_uint = 1 << 21;

/// PTRACE_O_TRACESYSGOOD option - set bit 7 in signal number on syscall stops
pub const PTRACE_O_TRACESYSGOOD: c_uint = 1;

/// Machine word size of the control interface.
pub const WORD_SIZE: usize = mem::size_of::<c_long>();

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn clear_errno() {
    unsafe { *libc::__errno_location() = 0 };
}

/// Read one word from the target.
///
/// `Ok(-1)` is a legitimate all-ones word; a failed read always comes back
/// as `Err`, never as a sentinel value colliding with data.
pub fn peek_word(pid: pid_t, addr: u64) -> Result<c_long> {
    clear_errno();
    let val = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKDATA,
            pid,
            addr as *mut c_void,
            ptr::null_mut::<c_void>(),
        )
    };
    let err = errno();
    if val == -1 && err != 0 {
        return Err(InfectError::PtraceFault(io::Error::from_raw_os_error(err)));
    }
    Ok(val)
}

/// Write one word into the target.
pub fn poke_word(pid: pid_t, addr: u64, word: c_long) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEDATA,
            pid,
            addr as *mut c_void,
            word as *mut c_void,
        )
    };
    if ret != 0 {
        return Err(InfectError::PtraceFault(io::Error::last_os_error()));
    }
    Ok(())
}

/// Word-granular read of `dst.len()` bytes at `addr` in the target.
///
/// The length must be a multiple of the word size; short reads are never
/// silently truncated.
pub fn peek_area(pid: pid_t, dst: &mut [u8], addr: u64) -> Result<()> {
    if dst.len() % WORD_SIZE != 0 {
        return Err(InfectError::InvalidLength(dst.len()));
    }
    for (w, chunk) in dst.chunks_exact_mut(WORD_SIZE).enumerate() {
        let val = peek_word(pid, addr + (w * WORD_SIZE) as u64)?;
        chunk.copy_from_slice(&val.to_ne_bytes());
    }
    Ok(())
}

/// Word-granular write of `src` at `addr` in the target.
///
/// Stops at the first failing word.
pub fn poke_area(pid: pid_t, src: &[u8], addr: u64) -> Result<()> {
    if src.len() % WORD_SIZE != 0 {
        return Err(InfectError::InvalidLength(src.len()));
    }
    for (w, chunk) in src.chunks_exact(WORD_SIZE).enumerate() {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(chunk);
        poke_word(pid, addr + (w * WORD_SIZE) as u64, c_long::from_ne_bytes(word))?;
    }
    Ok(())
}

/// PTRACE_GETREGSET; returns the length the kernel actually filled in,
/// which is how x86 native and compat register sets are told apart.
pub fn get_regset(pid: pid_t, nt: u32, buf: &mut [u8]) -> io::Result<usize> {
    let mut iov = iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GETREGSET,
            pid,
            nt as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(iov.iov_len)
}

/// PTRACE_SETREGSET from a raw register image.
pub fn set_regset(pid: pid_t, nt: u32, buf: &[u8]) -> io::Result<()> {
    let iov = iovec {
        iov_base: buf.as_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            PTRACE_SETREGSET,
            pid,
            nt as *mut c_void,
            &iov as *const _ as *mut c_void,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read the target's blocked-signal mask.
pub fn get_sigmask(pid: pid_t) -> io::Result<KRtSigset> {
    let mut set = KRtSigset::new();
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GETSIGMASK,
            pid,
            mem::size_of::<KRtSigset>() as *mut c_void,
            &mut set as *mut _ as *mut c_void,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(set)
}

/// Replace the target's blocked-signal mask.
pub fn set_sigmask(pid: pid_t, set: &KRtSigset) -> io::Result<()> {
    let ret = unsafe {
        libc::ptrace(
            PTRACE_SETSIGMASK,
            pid,
            mem::size_of::<KRtSigset>() as *mut c_void,
            set as *const _ as *mut c_void,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn suspend_seccomp(pid: pid_t) -> io::Result<()> {
    let ret = unsafe {
        libc::ptrace(
            PTRACE_SETOPTIONS,
            pid,
            ptr::null_mut::<c_void>(),
            (PTRACE_O_SUSPEND_SECCOMP | PTRACE_O_TRACESYSGOOD) as *mut c_void,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resume the stopped target until its next signal stop.
pub fn cont(pid: pid_t) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(
            PTRACE_CONT,
            pid,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    if ret != 0 {
        return Err(InfectError::PtraceFault(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_requests_reject_unaligned_lengths() {
        for len in [1usize, 3, 7] {
            let mut buf = vec![0u8; len];
            match peek_area(1, &mut buf, 0x1000) {
                Err(InfectError::InvalidLength(l)) => assert_eq!(l, len),
                other => panic!("expected InvalidLength, got {:?}", other),
            }
            match poke_area(1, &buf, 0x1000) {
                Err(InfectError::InvalidLength(l)) => assert_eq!(l, len),
                other => panic!("expected InvalidLength, got {:?}", other),
            }
        }
    }

    #[test]
    fn aligned_request_without_tracee_reports_fault() {
        // Aligned lengths pass the contract check and fail on the actual
        // ptrace call, since we trace nobody here.
        let mut buf = [0u8; 8];
        match peek_area(std::process::id() as pid_t, &mut buf, 0x1000) {
            Err(InfectError::PtraceFault(_)) => {}
            other => panic!("expected PtraceFault, got {:?}", other),
        }
    }
}
