//! ARM (AArch32) capture variant.

use std::mem;
use std::ptr;
use std::slice;

use libc::pid_t;

use super::{
    capture_failed, ArchVariant, ExtendedFpuState, Regset, RegsetError, RegsetSource, RegisterSet,
    TargetArch, ERESTARTNOHAND, ERESTARTNOINTR, ERESTARTSYS, ERESTART_RESTARTBLOCK,
    SYSCALL_SLOT_SIZE,
};
use crate::compel::ptrace::set_regset;
use crate::error::{InfectError, Result};

/// Injected code: svc #0 followed by an undefined instruction.
pub const CODE_SYSCALL: [u8; SYSCALL_SLOT_SIZE] = [
    0x00, 0x00, 0x00, 0xef, // svc #0
    0xf0, 0x00, 0xf0, 0xe7, // udf #0
];

const NR_MMAP2: u64 = 192;
const NR_MUNMAP: u64 = 91;

const PSR_T_BIT: u32 = 0x20;

const REG_PC: usize = 15;
const REG_SP: usize = 13;
const REG_CPSR: usize = 16;
const REG_ORIG_R0: usize = 17;

/// struct pt_regs: r0-r15, cpsr, orig_r0.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ArmRegs {
    pub uregs: [u32; 18],
}

impl ArmRegs {
    pub fn pc(&self) -> u32 {
        self.uregs[REG_PC]
    }

    pub fn set_pc(&mut self, val: u32) {
        self.uregs[REG_PC] = val;
    }

    pub fn sp(&self) -> u32 {
        self.uregs[REG_SP]
    }

    pub fn set_sp(&mut self, val: u32) {
        self.uregs[REG_SP] = val;
    }

    pub fn r0(&self) -> u32 {
        self.uregs[0]
    }

    pub fn cpsr(&self) -> u32 {
        self.uregs[REG_CPSR]
    }

    pub fn orig_r0(&self) -> u32 {
        self.uregs[REG_ORIG_R0]
    }

    fn thumb(&self) -> bool {
        self.cpsr() & PSR_T_BIT != 0
    }
}

/// VFP register file: d0-d31 plus the status register.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct ArmVfpState {
    pub fpregs: [u64; 32],
    pub fpscr: u32,
}

impl ArmVfpState {
    fn new() -> Self {
        Self {
            fpregs: [0; 32],
            fpscr: 0,
        }
    }
}

/// Roll an interrupted restart-class syscall back to its svc instruction.
/// Restart-block interruptions cannot be re-issued from outside and are
/// converted to a plain -EINTR return instead.
pub fn normalize_restart(regs: &mut ArmRegs) {
    if (regs.orig_r0() as i32) < 0 {
        return;
    }
    let insn = if regs.thumb() { 2 } else { 4 };
    match regs.r0() as i32 as i64 {
        v if v == -ERESTARTNOHAND || v == -ERESTARTSYS || v == -ERESTARTNOINTR => {
            regs.uregs[0] = regs.orig_r0();
            regs.uregs[REG_PC] -= insn;
        }
        v if v == -ERESTART_RESTARTBLOCK => {
            log::warn!("task interrupted in restart_syscall, returning -EINTR");
            regs.uregs[0] = -libc::EINTR as u32;
        }
        _ => {}
    }
}

/// Read the VFP registers. A target without VFP hardware simply has no
/// extended state to capture.
pub fn capture_fpu(pid: pid_t, src: &mut dyn RegsetSource) -> Result<ExtendedFpuState> {
    let mut vfp = ArmVfpState::new();
    let buf = unsafe {
        slice::from_raw_parts_mut(
            &mut vfp as *mut ArmVfpState as *mut u8,
            mem::size_of::<ArmVfpState>(),
        )
    };
    match src.read(Regset::ArmVfp, buf) {
        Ok(_) => Ok(ExtendedFpuState::Arm(vfp)),
        Err(RegsetError::Unsupported) => {
            log::debug!("task {} has no VFP state", pid);
            Ok(ExtendedFpuState::None)
        }
        Err(e) => Err(capture_failed(pid, "VFP registers", e)),
    }
}

pub struct ArmVariant;

impl ArchVariant for ArmVariant {
    fn arch(&self) -> TargetArch {
        TargetArch::Arm
    }

    fn syscall_code(&self, _native: bool) -> &'static [u8; SYSCALL_SLOT_SIZE] {
        &CODE_SYSCALL
    }

    fn read_regs(&self, pid: pid_t, src: &mut dyn RegsetSource) -> Result<RegisterSet> {
        let mut buf = [0u8; mem::size_of::<ArmRegs>()];
        let len = src
            .read(Regset::PrStatus, &mut buf)
            .map_err(|e| capture_failed(pid, "general registers", e))?;
        if len != mem::size_of::<ArmRegs>() {
            return Err(InfectError::CaptureFailed {
                pid,
                reason: format!("regset read {} bytes, expected {}", len, buf.len()),
            });
        }
        let regs = unsafe { ptr::read_unaligned(buf.as_ptr() as *const ArmRegs) };
        Ok(RegisterSet::Arm(regs))
    }

    fn normalize_restart(&self, regs: &mut RegisterSet) -> Result<()> {
        let RegisterSet::Arm(r) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        normalize_restart(r);
        Ok(())
    }

    fn capture_fpu(
        &self,
        pid: pid_t,
        _regs: &RegisterSet,
        src: &mut dyn RegsetSource,
    ) -> Result<ExtendedFpuState> {
        capture_fpu(pid, src)
    }

    fn prepare_syscall_regs(&self, regs: &mut RegisterSet, nr: u64, args: &[u64; 6]) -> Result<()> {
        let RegisterSet::Arm(r) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        r.uregs[7] = nr as u32;
        for (i, a) in args.iter().enumerate() {
            r.uregs[i] = *a as u32;
        }
        Ok(())
    }

    fn mmap_nr(&self, _native: bool) -> u64 {
        NR_MMAP2
    }

    fn munmap_nr(&self, _native: bool) -> u64 {
        NR_MUNMAP
    }

    fn set_regs(&self, pid: pid_t, regs: &RegisterSet) -> Result<()> {
        let RegisterSet::Arm(r) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        let bytes =
            unsafe { slice::from_raw_parts(r as *const _ as *const u8, mem::size_of::<ArmRegs>()) };
        set_regset(pid, Regset::PrStatus.nt(), bytes).map_err(InfectError::PtraceFault)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{Reply, ScriptedSource};
    use super::super::FpuFlags;
    use super::*;

    fn syscall_stop(r0: i64) -> ArmRegs {
        let mut regs = ArmRegs::default();
        regs.uregs[0] = r0 as u32;
        regs.uregs[REG_ORIG_R0] = 20; // getpid
        regs.uregs[REG_PC] = 0x8004;
        regs
    }

    #[test]
    fn restart_classes_roll_back_pc() {
        for code in [ERESTARTSYS, ERESTARTNOINTR, ERESTARTNOHAND] {
            let mut regs = syscall_stop(-code);
            normalize_restart(&mut regs);
            assert_eq!(regs.r0(), 20);
            assert_eq!(regs.pc(), 0x8000);
        }
    }

    #[test]
    fn thumb_rollback_is_two_bytes() {
        let mut regs = syscall_stop(-ERESTARTSYS);
        regs.uregs[REG_CPSR] = PSR_T_BIT;
        normalize_restart(&mut regs);
        assert_eq!(regs.pc(), 0x8002);
    }

    #[test]
    fn restart_block_becomes_eintr() {
        let mut regs = syscall_stop(-ERESTART_RESTARTBLOCK);
        normalize_restart(&mut regs);
        assert_eq!(regs.r0(), -libc::EINTR as u32);
        assert_eq!(regs.pc(), 0x8004, "pc is left alone");
    }

    #[test]
    fn no_rewrite_outside_syscall() {
        let mut regs = syscall_stop(-ERESTARTSYS);
        regs.uregs[REG_ORIG_R0] = -1i32 as u32;
        normalize_restart(&mut regs);
        assert_eq!(regs.r0() as i32, -(ERESTARTSYS as i32));
        assert_eq!(regs.pc(), 0x8004);
    }

    #[test]
    fn missing_vfp_is_not_an_error() {
        let mut src = ScriptedSource::new(vec![(Regset::ArmVfp, Reply::Unsupported)]);
        let state = capture_fpu(1, &mut src).unwrap();
        assert!(matches!(state, ExtendedFpuState::None));
        assert_eq!(state.flags(), FpuFlags::empty());
    }

    #[test]
    fn vfp_capture_sets_flag() {
        let len = mem::size_of::<ArmVfpState>();
        let mut src = ScriptedSource::new(vec![(Regset::ArmVfp, Reply::Len(len))]);
        let state = capture_fpu(1, &mut src).unwrap();
        assert!(state.flags().contains(FpuFlags::VFP));
    }

    #[test]
    fn syscall_register_placement() {
        let mut regs = RegisterSet::Arm(ArmRegs::default());
        ArmVariant
            .prepare_syscall_regs(&mut regs, 192, &[1, 2, 3, 4, 5, 6])
            .unwrap();
        let RegisterSet::Arm(r) = regs else {
            unreachable!()
        };
        assert_eq!(r.uregs[7], 192);
        assert_eq!(&r.uregs[0..6], &[1, 2, 3, 4, 5, 6]);
    }
}
