//! Parasite session: capture a seized thread's context and run syscalls
//! inside its address space.

use libc::{pid_t, SIGTRAP, __WALL};

use super::arch::{
    variant, ExtendedFpuState, KRtSigset, PtraceRegsetSource, RegisterSet, TargetArch, ThreadCtx,
};
use super::patch::MemoryPatch;
use super::ptrace::{self, WORD_SIZE};
use super::seize::{detach, seize, wait_task, wifstopped, wstopsig, StatusProbe, TaskState};
use crate::error::{InfectError, Result};

/// Largest negative value the kernel uses as an in-band errno.
const MAX_ERRNO: i64 = 4095;

/// One seized thread. Detaches on drop unless told to leave the task
/// stopped.
#[derive(Debug)]
pub struct TracedThread {
    pid: pid_t,
    state: TaskState,
    detach_on_drop: bool,
}

impl TracedThread {
    /// Seize `pid` and wait for it to settle.
    ///
    /// Succeeds for any classified state, including `Zombie` and `Dead`;
    /// the caller decides whether that state is usable.
    pub fn attach(pid: pid_t, probe: &mut dyn StatusProbe) -> Result<Self> {
        seize(pid)?;
        let state = match wait_task(pid, -1, probe) {
            Ok(s) => s,
            Err(e) => {
                detach(pid);
                return Err(e);
            }
        };
        Ok(Self {
            pid,
            state,
            detach_on_drop: !matches!(state, TaskState::Dead),
        })
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Skip the detach on drop, leaving the task in its ptrace stop.
    pub fn leave_stopped(&mut self) {
        self.detach_on_drop = false;
    }

    fn detach_now(&mut self) {
        if self.detach_on_drop {
            self.detach_on_drop = false;
            detach(self.pid);
        }
    }
}

impl Drop for TracedThread {
    fn drop(&mut self) {
        self.detach_now();
    }
}

/// Control session over one seized thread.
///
/// Captures the thread context once, then injects syscalls at the current
/// instruction pointer, restoring registers, signal mask and patched text
/// after every call. A session that could not restore the target is
/// poisoned: every later operation fails and the task is left stopped.
pub struct ParasiteSession {
    thread: TracedThread,
    arch: TargetArch,
    orig: Option<ThreadCtx>,
    syscall_ip: u64,
    poisoned: bool,
}

impl ParasiteSession {
    /// Seize `pid` for syscall injection.
    ///
    /// A task found dead or zombie cannot host a parasite; the attach is
    /// rolled back and the state named in the error. Seccomp-filtered
    /// targets get their filters suspended for the session lifetime.
    pub fn attach(pid: pid_t, arch: TargetArch, probe: &mut dyn StatusProbe) -> Result<Self> {
        let thread = TracedThread::attach(pid, probe)?;
        if matches!(thread.state(), TaskState::Dead | TaskState::Zombie) {
            return Err(InfectError::AttachFailed {
                pid,
                reason: format!("task is {:?}, nothing to infect", thread.state()),
            });
        }

        let st = probe.status(pid).map_err(|e| InfectError::AttachFailed {
            pid,
            reason: format!("status probe: {}", e),
        })?;
        if st.seccomp_mode != 0 {
            ptrace::suspend_seccomp(pid).map_err(|e| InfectError::AttachFailed {
                pid,
                reason: format!("can't suspend seccomp: {}", e),
            })?;
            log::debug!("suspended seccomp for task {}", pid);
        }

        Ok(Self {
            thread,
            arch,
            orig: None,
            syscall_ip: 0,
            poisoned: false,
        })
    }

    pub fn pid(&self) -> pid_t {
        self.thread.pid()
    }

    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    /// Word-aligned address the injected code slot goes to.
    pub fn syscall_ip(&self) -> u64 {
        self.syscall_ip
    }

    /// Move the injected code slot, e.g. into a parasite mapping.
    /// The address must be word aligned.
    pub fn set_syscall_ip(&mut self, addr: u64) -> Result<()> {
        if addr % WORD_SIZE as u64 != 0 {
            return Err(InfectError::InvalidLength(addr as usize));
        }
        self.syscall_ip = addr;
        Ok(())
    }

    /// Saved context from [`capture`](Self::capture), if any.
    pub fn ctx(&self) -> Option<&ThreadCtx> {
        self.orig.as_ref()
    }

    /// Capture the thread's registers, extended FPU state and signal mask.
    ///
    /// Registers are restart-normalized, so restoring this context resumes
    /// an interrupted syscall instead of leaking its kernel restart code
    /// into user space. The injected-code address defaults to the captured
    /// instruction pointer, rounded down to a word boundary.
    pub fn capture(&mut self) -> Result<(ThreadCtx, ExtendedFpuState)> {
        self.check_usable()?;
        let pid = self.pid();
        let v = variant(self.arch);
        let mut src = PtraceRegsetSource { pid };

        let regs = v.capture_regs(pid, &mut src)?;
        if regs.arch() != self.arch {
            return Err(InfectError::ArchMismatch);
        }
        let fpu = v.capture_fpu(pid, &regs, &mut src)?;
        let sigmask = ptrace::get_sigmask(pid).map_err(|e| InfectError::CaptureFailed {
            pid,
            reason: format!("can't read signal mask: {}", e),
        })?;

        let ctx = ThreadCtx { sigmask, regs };
        self.syscall_ip = ctx.regs.ip() & !(WORD_SIZE as u64 - 1);
        self.orig = Some(ctx.clone());
        log::debug!(
            "captured task {} at ip {:#x}, fpu flags {:#x}",
            pid,
            ctx.regs.ip(),
            fpu.flags().bits()
        );
        Ok((ctx, fpu))
    }

    /// Run one syscall inside the target and return its result.
    ///
    /// In-band kernel errnos come back as [`InfectError::SyscallFailed`];
    /// anything else is the raw return value. The target's registers,
    /// signal mask and patched instructions are restored whether the call
    /// succeeds or not.
    pub fn execute_syscall(&mut self, nr: u64, args: &[u64]) -> Result<i64> {
        self.check_usable()?;
        let octx = self.orig.clone().ok_or_else(|| InfectError::ExecutionFailed {
            pid: self.pid(),
            reason: "no captured context".into(),
        })?;
        if args.len() > 6 {
            return Err(InfectError::InvalidLength(args.len()));
        }
        let mut argv = [0u64; 6];
        argv[..args.len()].copy_from_slice(args);

        let v = variant(self.arch);
        let mut regs = octx.regs.clone();
        v.prepare_syscall_regs(&mut regs, nr, &argv)?;
        regs.set_ip(self.syscall_ip);

        let code = v.syscall_code(octx.regs.is_native());
        let patch = MemoryPatch::apply(self.pid(), self.syscall_ip, code)?;

        let run = self.run_to_trap(&regs, &octx);

        if patch.revert().is_err() {
            self.poison("could not restore patched instructions");
            return Err(InfectError::TargetInconsistent { pid: self.pid() });
        }

        let val = run?;
        if (-MAX_ERRNO..0).contains(&val) {
            return Err(InfectError::SyscallFailed(-val as i32));
        }
        Ok(val)
    }

    /// mmap inside the target; returns the mapped address.
    pub fn remote_mmap(
        &mut self,
        addr: u64,
        len: u64,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> Result<u64> {
        let native = self
            .orig
            .as_ref()
            .map(|c| c.regs.is_native())
            .unwrap_or(true);
        let v = variant(self.arch);
        // mmap2 takes the offset in pages
        let off = if native { offset } else { offset >> 12 };
        let args = [addr, len, prot as u64, flags as u64, fd as u64, off];
        match self.execute_syscall(v.mmap_nr(native), &args) {
            // the result register comes back sign-extended; a compat
            // address is its low 32 bits
            Ok(va) if native => Ok(va as u64),
            Ok(va) => Ok(va as u64 & 0xffff_ffff),
            Err(InfectError::SyscallFailed(e))
                if e == libc::EACCES
                    && prot & (libc::PROT_WRITE | libc::PROT_EXEC)
                        == (libc::PROT_WRITE | libc::PROT_EXEC) =>
            {
                log::warn!("writable-executable mmap refused, check the selinux execmem policy");
                Err(InfectError::SyscallFailed(e))
            }
            Err(e) => Err(e),
        }
    }

    /// munmap inside the target.
    pub fn remote_munmap(&mut self, addr: u64, len: u64) -> Result<()> {
        let native = self
            .orig
            .as_ref()
            .map(|c| c.regs.is_native())
            .unwrap_or(true);
        let nr = variant(self.arch).munmap_nr(native);
        self.execute_syscall(nr, &[addr, len]).map(|_| ())
    }

    /// Restore the captured context and detach.
    pub fn release(mut self) -> Result<()> {
        if self.poisoned {
            return Err(InfectError::TargetInconsistent { pid: self.pid() });
        }
        if let Some(octx) = self.orig.take() {
            self.restore_ctx(&octx)?;
        }
        self.thread.detach_now();
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(InfectError::TargetInconsistent { pid: self.pid() });
        }
        Ok(())
    }

    fn poison(&mut self, why: &str) {
        log::error!("task {} left inconsistent: {}", self.pid(), why);
        self.poisoned = true;
        self.thread.leave_stopped();
    }

    fn restore_ctx(&mut self, octx: &ThreadCtx) -> Result<()> {
        let pid = self.pid();
        let v = variant(self.arch);
        let res = v.set_regs(pid, &octx.regs).and_then(|_| {
            ptrace::set_sigmask(pid, &octx.sigmask).map_err(InfectError::PtraceFault)
        });
        if res.is_err() {
            self.poison("could not restore registers and signal mask");
            return Err(InfectError::TargetInconsistent { pid });
        }
        Ok(())
    }

    /// Let the target run the injected slot up to its trap instruction,
    /// then put the original context back.
    fn run_to_trap(&mut self, regs: &RegisterSet, octx: &ThreadCtx) -> Result<i64> {
        let pid = self.pid();
        let v = variant(self.arch);

        // Only the trap may interrupt the parasite.
        let mut mask = KRtSigset::new();
        mask.fill();
        mask.del(SIGTRAP);
        ptrace::set_sigmask(pid, &mask).map_err(InfectError::PtraceFault)?;

        let result = (|| {
            v.set_regs(pid, regs)?;
            ptrace::cont(pid)?;

            let mut status: i32 = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, __WALL) };
            if ret != pid {
                return Err(InfectError::ExecutionFailed {
                    pid,
                    reason: format!("waitpid: {}", std::io::Error::last_os_error()),
                });
            }
            if !wifstopped(status) || wstopsig(status) != SIGTRAP {
                return Err(InfectError::ExecutionFailed {
                    pid,
                    reason: format!("unexpected stop, wait status {:#x}", status),
                });
            }

            let mut src = PtraceRegsetSource { pid };
            // Raw read: the trap is ours, not an interrupted syscall.
            let after = v.read_regs(pid, &mut src)?;
            Ok(after.ret_value())
        })();

        self.restore_ctx(octx)?;
        result
    }
}

impl Drop for ParasiteSession {
    fn drop(&mut self) {
        if self.poisoned {
            log::error!(
                "dropping poisoned session for {}, task stays stopped",
                self.pid()
            );
            return;
        }
        if let Some(octx) = self.orig.take() {
            log::warn!("session for {} dropped without release", self.pid());
            let _ = self.restore_ctx(&octx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compel::arch::x86_64::{UserRegs64, X86Regs};
    use crate::compel::seize::TaskStatus;

    fn idle_session() -> ParasiteSession {
        ParasiteSession {
            thread: TracedThread {
                pid: 1,
                state: TaskState::Alive,
                detach_on_drop: false,
            },
            arch: TargetArch::X86_64,
            orig: None,
            syscall_ip: 0,
            poisoned: false,
        }
    }

    #[test]
    fn syscall_requires_captured_context() {
        let mut s = idle_session();
        match s.execute_syscall(39, &[]) {
            Err(InfectError::ExecutionFailed { pid, .. }) => assert_eq!(pid, 1),
            other => panic!("expected ExecutionFailed, got {:?}", other),
        }
    }

    #[test]
    fn at_most_six_syscall_args() {
        let mut s = idle_session();
        s.orig = Some(ThreadCtx {
            sigmask: KRtSigset::new(),
            regs: RegisterSet::X86(X86Regs::Native(UserRegs64::default())),
        });
        match s.execute_syscall(0, &[0; 7]) {
            Err(InfectError::InvalidLength(7)) => {}
            other => panic!("expected InvalidLength, got {:?}", other),
        }
    }

    #[test]
    fn poisoned_session_refuses_everything() {
        let mut s = idle_session();
        s.poisoned = true;
        assert!(matches!(
            s.capture(),
            Err(InfectError::TargetInconsistent { pid: 1 })
        ));
        assert!(matches!(
            s.execute_syscall(39, &[]),
            Err(InfectError::TargetInconsistent { pid: 1 })
        ));
        assert!(matches!(
            s.release(),
            Err(InfectError::TargetInconsistent { pid: 1 })
        ));
    }

    #[test]
    fn syscall_ip_must_be_aligned() {
        let mut s = idle_session();
        assert!(s.set_syscall_ip(0x1001).is_err());
        s.set_syscall_ip(0x1000).unwrap();
        assert_eq!(s.syscall_ip(), 0x1000);
    }

    struct FailingProbe;

    impl StatusProbe for FailingProbe {
        fn status(&mut self, _pid: pid_t) -> std::io::Result<TaskStatus> {
            Err(std::io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    #[test]
    fn attach_to_missing_task_fails() {
        let mut probe = FailingProbe;
        // PID near the usual pid_max, nothing to seize there in practice
        match ParasiteSession::attach(pid_t::MAX, TargetArch::X86_64, &mut probe) {
            Err(InfectError::AttachFailed { .. }) => {}
            other => panic!(
                "expected AttachFailed, got {:?}",
                other.map(|s| s.pid())
            ),
        }
    }
}
