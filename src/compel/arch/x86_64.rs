//! x86 capture variant: native/compat register sets, XSAVE-vs-FXSAVE
//! save-area selection and the int80/syscall injection encodings.

use std::mem;
use std::ptr;
use std::slice;

use libc::pid_t;

use super::{
    capture_failed, ArchVariant, CpuFeatures, ExtendedFpuState, FpuFlags, Regset, RegsetError,
    RegsetSource, RegisterSet, TargetArch, ERESTARTNOHAND, ERESTARTNOINTR, ERESTARTSYS,
    ERESTART_RESTARTBLOCK, SYSCALL_SLOT_SIZE,
};
use crate::compel::ptrace::set_regset;
use crate::error::{InfectError, Result};

/// Injected syscall instruction, padded with int3.
pub const CODE_SYSCALL: [u8; SYSCALL_SLOT_SIZE] = [
    0x0f, 0x05, // syscall
    0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // int 3, ...
];

/// Compat-mode equivalent: int $0x80, padded with int3.
pub const CODE_INT_80: [u8; SYSCALL_SLOT_SIZE] = [
    0xcd, 0x80, // int $0x80
    0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // int 3, ...
];

/// Both encodings are two bytes wide.
pub const SYSCALL_INSN_LEN: u64 = 2;

pub const FXSAVE_SIZE: usize = 512;
pub const XSAVE_AREA_MAX: usize = 4096;

const NR_MMAP: u64 = 9;
const NR_MUNMAP: u64 = 11;
const NR_MMAP2_COMPAT: u64 = 192;
const NR_MUNMAP_COMPAT: u64 = 91;

/// 64-bit user registers
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UserRegs64 {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub bp: u64,
    pub bx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub ax: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub orig_ax: u64,
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub sp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// 32-bit user registers (compat mode)
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UserRegs32 {
    pub bx: u32,
    pub cx: u32,
    pub dx: u32,
    pub si: u32,
    pub di: u32,
    pub bp: u32,
    pub ax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub orig_ax: u32,
    pub ip: u32,
    pub cs: u32,
    pub flags: u32,
    pub sp: u32,
    pub ss: u32,
}

/// General registers tagged with the execution mode they were read in.
/// The kernel-filled regset length decides the variant; it is never
/// reinterpreted afterwards.
#[derive(Debug, Clone)]
pub enum X86Regs {
    Native(UserRegs64),
    Compat(UserRegs32),
}

impl X86Regs {
    pub fn is_native(&self) -> bool {
        matches!(self, X86Regs::Native(_))
    }

    pub fn ip(&self) -> u64 {
        match self {
            X86Regs::Native(r) => r.ip,
            X86Regs::Compat(r) => r.ip as u64,
        }
    }

    pub fn set_ip(&mut self, val: u64) {
        match self {
            X86Regs::Native(r) => r.ip = val,
            X86Regs::Compat(r) => r.ip = val as u32,
        }
    }

    pub fn sp(&self) -> u64 {
        match self {
            X86Regs::Native(r) => r.sp,
            X86Regs::Compat(r) => r.sp as u64,
        }
    }

    pub fn set_sp(&mut self, val: u64) {
        match self {
            X86Regs::Native(r) => r.sp = val,
            X86Regs::Compat(r) => r.sp = val as u32,
        }
    }

    pub fn ax(&self) -> u64 {
        match self {
            X86Regs::Native(r) => r.ax,
            X86Regs::Compat(r) => r.ax as u64,
        }
    }

    pub fn set_ax(&mut self, val: u64) {
        match self {
            X86Regs::Native(r) => r.ax = val,
            X86Regs::Compat(r) => r.ax = val as u32,
        }
    }

    pub fn orig_ax(&self) -> u64 {
        match self {
            X86Regs::Native(r) => r.orig_ax,
            X86Regs::Compat(r) => r.orig_ax as u64,
        }
    }

    pub fn eflags(&self) -> u64 {
        match self {
            X86Regs::Native(r) => r.flags,
            X86Regs::Compat(r) => r.flags as u64,
        }
    }

    /// ax sign-extended per the execution mode; 32-bit in-band errnos are
    /// only visible this way.
    pub fn ax_signed(&self) -> i64 {
        match self {
            X86Regs::Native(r) => r.ax as i64,
            X86Regs::Compat(r) => r.ax as i32 as i64,
        }
    }

    fn orig_ax_signed(&self) -> i64 {
        match self {
            X86Regs::Native(r) => r.orig_ax as i64,
            X86Regs::Compat(r) => r.orig_ax as i32 as i64,
        }
    }
}

/// Mirror the kernel's restart handling for a task stopped on its way out
/// of an interrupted syscall (arch/x86/kernel/signal.c).
pub fn normalize_restart(regs: &mut X86Regs) {
    // Did we come from a system call?
    if regs.orig_ax_signed() < 0 {
        return;
    }
    match -regs.ax_signed() {
        ERESTARTNOHAND | ERESTARTSYS | ERESTARTNOINTR => {
            // Restart the system call
            let nr = regs.orig_ax();
            regs.set_ax(nr);
            let ip = regs.ip();
            regs.set_ip(ip - SYSCALL_INSN_LEN);
        }
        ERESTART_RESTARTBLOCK => {
            log::warn!("will restore with interrupted system call");
            regs.set_ax(-(libc::EINTR as i64) as u64);
        }
        _ => {}
    }
}

/// x86 extended save area. Exactly one format is captured, never both.
#[derive(Debug, Clone)]
pub enum X86FpuState {
    /// Legacy FXSAVE image.
    Fxsave([u8; FXSAVE_SIZE]),
    /// XSAVE image, sized by the kernel.
    Xsave(Vec<u8>),
}

impl X86FpuState {
    pub fn flags(&self) -> FpuFlags {
        let mut f = FpuFlags::empty();
        f.set(FpuFlags::FP);
        if matches!(self, X86FpuState::Xsave(_)) {
            f.set(FpuFlags::XSAVE);
        }
        f
    }
}

/// FPU capture with explicitly probed CPU features; the save format is
/// chosen by what the host actually supports, never guessed.
pub fn capture_fpu_with(
    pid: pid_t,
    feat: CpuFeatures,
    src: &mut dyn RegsetSource,
) -> Result<ExtendedFpuState> {
    if !feat.fpu {
        return Ok(ExtendedFpuState::None);
    }

    if feat.xsave {
        let mut buf = vec![0u8; XSAVE_AREA_MAX];
        let len = src
            .read(Regset::X86Xstate, &mut buf)
            .map_err(|e| capture_failed(pid, "FPU registers (xstate)", e))?;
        buf.truncate(len.min(XSAVE_AREA_MAX));
        Ok(ExtendedFpuState::X86(X86FpuState::Xsave(buf)))
    } else {
        let mut buf = [0u8; FXSAVE_SIZE];
        src.read(Regset::PrFpreg, &mut buf)
            .map_err(|e| capture_failed(pid, "FPU registers", e))?;
        Ok(ExtendedFpuState::X86(X86FpuState::Fxsave(buf)))
    }
}

pub struct X86Variant;

impl ArchVariant for X86Variant {
    fn arch(&self) -> TargetArch {
        TargetArch::X86_64
    }

    fn syscall_code(&self, native: bool) -> &'static [u8; SYSCALL_SLOT_SIZE] {
        if native {
            &CODE_SYSCALL
        } else {
            &CODE_INT_80
        }
    }

    fn read_regs(&self, pid: pid_t, src: &mut dyn RegsetSource) -> Result<RegisterSet> {
        let mut buf = [0u8; mem::size_of::<UserRegs64>()];
        let len = src
            .read(Regset::PrStatus, &mut buf)
            .map_err(|e| capture_failed(pid, "general registers", e))?;

        let regs = if len == mem::size_of::<UserRegs64>() {
            X86Regs::Native(unsafe { ptr::read_unaligned(buf.as_ptr() as *const UserRegs64) })
        } else if len == mem::size_of::<UserRegs32>() {
            X86Regs::Compat(unsafe { ptr::read_unaligned(buf.as_ptr() as *const UserRegs32) })
        } else {
            return Err(InfectError::CaptureFailed {
                pid,
                reason: format!(
                    "regset read {} bytes, but native/compat sizes are {}/{}",
                    len,
                    mem::size_of::<UserRegs64>(),
                    mem::size_of::<UserRegs32>()
                ),
            });
        };

        log::debug!(
            "captured general registers for {} in {} mode",
            pid,
            if regs.is_native() { "native" } else { "compat" }
        );
        Ok(RegisterSet::X86(regs))
    }

    fn normalize_restart(&self, regs: &mut RegisterSet) -> Result<()> {
        let RegisterSet::X86(x) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        normalize_restart(x);
        Ok(())
    }

    fn capture_fpu(
        &self,
        pid: pid_t,
        _regs: &RegisterSet,
        src: &mut dyn RegsetSource,
    ) -> Result<ExtendedFpuState> {
        capture_fpu_with(pid, CpuFeatures::detect(), src)
    }

    fn prepare_syscall_regs(&self, regs: &mut RegisterSet, nr: u64, args: &[u64; 6]) -> Result<()> {
        let RegisterSet::X86(x) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        match x {
            X86Regs::Native(r) => {
                r.ax = nr;
                r.di = args[0];
                r.si = args[1];
                r.dx = args[2];
                r.r10 = args[3];
                r.r8 = args[4];
                r.r9 = args[5];
            }
            X86Regs::Compat(r) => {
                r.ax = nr as u32;
                r.bx = args[0] as u32;
                r.cx = args[1] as u32;
                r.dx = args[2] as u32;
                r.si = args[3] as u32;
                r.di = args[4] as u32;
                r.bp = args[5] as u32;
            }
        }
        Ok(())
    }

    fn mmap_nr(&self, native: bool) -> u64 {
        if native {
            NR_MMAP
        } else {
            NR_MMAP2_COMPAT
        }
    }

    fn munmap_nr(&self, native: bool) -> u64 {
        if native {
            NR_MUNMAP
        } else {
            NR_MUNMAP_COMPAT
        }
    }

    fn set_regs(&self, pid: pid_t, regs: &RegisterSet) -> Result<()> {
        let RegisterSet::X86(x) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        let bytes = match x {
            X86Regs::Native(r) => unsafe {
                slice::from_raw_parts(r as *const _ as *const u8, mem::size_of::<UserRegs64>())
            },
            X86Regs::Compat(r) => unsafe {
                slice::from_raw_parts(r as *const _ as *const u8, mem::size_of::<UserRegs32>())
            },
        };
        set_regset(pid, Regset::PrStatus.nt(), bytes).map_err(InfectError::PtraceFault)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{Reply, ScriptedSource};
    use super::*;

    fn native_after_syscall(ax: i64) -> X86Regs {
        X86Regs::Native(UserRegs64 {
            orig_ax: 39,
            ax: ax as u64,
            ip: 0x1000,
            ..UserRegs64::default()
        })
    }

    #[test]
    fn unconditional_restart_classes_roll_back() {
        for code in [ERESTARTSYS, ERESTARTNOINTR, ERESTARTNOHAND] {
            let mut regs = native_after_syscall(-code);
            normalize_restart(&mut regs);
            assert_eq!(regs.ax(), 39, "syscall number restored into ax");
            assert_eq!(regs.ip(), 0x1000 - SYSCALL_INSN_LEN);
        }
    }

    #[test]
    fn restart_block_becomes_eintr() {
        let mut regs = native_after_syscall(-ERESTART_RESTARTBLOCK);
        normalize_restart(&mut regs);
        assert_eq!(regs.ax() as i64, -(libc::EINTR as i64));
        assert_eq!(regs.ip(), 0x1000, "ip is not rolled back");
    }

    #[test]
    fn no_rewrite_outside_a_syscall() {
        let mut regs = X86Regs::Native(UserRegs64 {
            orig_ax: -1i64 as u64,
            ax: -(ERESTARTSYS) as u64,
            ip: 0x1000,
            ..UserRegs64::default()
        });
        normalize_restart(&mut regs);
        assert_eq!(regs.ip(), 0x1000);
        assert_eq!(regs.ax() as i64, -ERESTARTSYS);
    }

    #[test]
    fn compat_restart_uses_32bit_sign() {
        let mut regs = X86Regs::Compat(UserRegs32 {
            orig_ax: 20,
            ax: -(ERESTARTNOINTR) as u64 as u32,
            ip: 0x2000,
            ..UserRegs32::default()
        });
        normalize_restart(&mut regs);
        assert_eq!(regs.ax(), 20);
        assert_eq!(regs.ip(), 0x2000 - SYSCALL_INSN_LEN);
    }

    #[test]
    fn mode_derived_from_regset_length() {
        let mut src = ScriptedSource::new(vec![(
            Regset::PrStatus,
            Reply::Len(mem::size_of::<UserRegs32>()),
        )]);
        let regs = X86Variant.read_regs(1, &mut src).unwrap();
        assert!(!regs.is_native());
    }

    #[test]
    fn native_syscall_register_placement() {
        let mut regs = RegisterSet::X86(X86Regs::Native(UserRegs64::default()));
        X86Variant
            .prepare_syscall_regs(&mut regs, 39, &[0; 6])
            .unwrap();
        let RegisterSet::X86(X86Regs::Native(r)) = regs else {
            unreachable!()
        };
        assert_eq!(r.ax, 39);
        assert_eq!(r.di, 0);
        assert_eq!(r.r9, 0);
    }

    #[test]
    fn compat_syscall_register_placement() {
        let mut regs = RegisterSet::X86(X86Regs::Compat(UserRegs32::default()));
        X86Variant
            .prepare_syscall_regs(&mut regs, 192, &[1, 2, 3, 4, 5, 6])
            .unwrap();
        let RegisterSet::X86(X86Regs::Compat(r)) = regs else {
            unreachable!()
        };
        assert_eq!(r.ax, 192);
        assert_eq!(r.bx, 1);
        assert_eq!(r.cx, 2);
        assert_eq!(r.dx, 3);
        assert_eq!(r.si, 4);
        assert_eq!(r.di, 5);
        assert_eq!(r.bp, 6);
    }

    #[test]
    fn compat_syscall_result_keeps_errno_negative() {
        let regs = RegisterSet::X86(X86Regs::Compat(UserRegs32 {
            ax: -libc::EINVAL as u32,
            ..UserRegs32::default()
        }));
        let val = regs.ret_value();
        assert_eq!(val, -(libc::EINVAL as i64));
        assert!((-4095..0).contains(&val), "errno range check must catch it");

        let regs = RegisterSet::X86(X86Regs::Native(UserRegs64 {
            ax: -(libc::EINVAL as i64) as u64,
            ..UserRegs64::default()
        }));
        assert_eq!(regs.ret_value(), -(libc::EINVAL as i64));
    }

    #[test]
    fn no_fpu_means_no_state() {
        let mut src = ScriptedSource::new(vec![]);
        let feat = CpuFeatures {
            fpu: false,
            xsave: false,
        };
        let state = capture_fpu_with(1, feat, &mut src).unwrap();
        assert!(matches!(state, ExtendedFpuState::None));
        assert_eq!(state.flags(), FpuFlags::empty());
        assert!(src.requested.is_empty());
    }

    #[test]
    fn xsave_host_uses_extended_format_only() {
        let mut src = ScriptedSource::new(vec![(Regset::X86Xstate, Reply::Len(832))]);
        let feat = CpuFeatures {
            fpu: true,
            xsave: true,
        };
        let state = capture_fpu_with(1, feat, &mut src).unwrap();
        match &state {
            ExtendedFpuState::X86(X86FpuState::Xsave(buf)) => assert_eq!(buf.len(), 832),
            other => panic!("expected xsave state, got {:?}", other),
        }
        assert!(state.flags().contains(FpuFlags::XSAVE));
        assert!(!src.saw(Regset::PrFpreg), "legacy format must not be read");
    }

    #[test]
    fn legacy_host_uses_fxsave_only() {
        let mut src = ScriptedSource::new(vec![(Regset::PrFpreg, Reply::Len(FXSAVE_SIZE))]);
        let feat = CpuFeatures {
            fpu: true,
            xsave: false,
        };
        let state = capture_fpu_with(1, feat, &mut src).unwrap();
        assert!(matches!(
            state,
            ExtendedFpuState::X86(X86FpuState::Fxsave(_))
        ));
        assert!(!state.flags().contains(FpuFlags::XSAVE));
        assert!(!src.saw(Regset::X86Xstate));
    }

    #[test]
    fn fpu_read_fault_is_fatal() {
        let mut src = ScriptedSource::new(vec![(Regset::X86Xstate, Reply::Fault)]);
        let feat = CpuFeatures {
            fpu: true,
            xsave: true,
        };
        match capture_fpu_with(7, feat, &mut src) {
            Err(InfectError::CaptureFailed { pid, .. }) => assert_eq!(pid, 7),
            other => panic!("expected CaptureFailed, got {:?}", other),
        }
    }
}
