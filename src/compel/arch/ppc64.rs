//! PPC64 capture variant: transactional-memory checkpoint registers and
//! the FPU/Altivec/VSX capture ordering.

use std::mem;
use std::ptr;
use std::slice;

use libc::pid_t;

use super::{
    capture_failed, ArchVariant, ExtendedFpuState, FpuFlags, Regset, RegsetError, RegsetSource,
    RegisterSet, TargetArch, ERESTARTNOHAND, ERESTARTNOINTR, ERESTARTSYS, ERESTART_RESTARTBLOCK,
    SYSCALL_SLOT_SIZE,
};
use crate::compel::ptrace::set_regset;
use crate::error::{InfectError, Result};

/// Injected code: sc followed by a trap (ppc64le byte order).
pub const CODE_SYSCALL: [u8; SYSCALL_SLOT_SIZE] = [
    0x02, 0x00, 0x00, 0x44, // sc
    0x00, 0x00, 0xe0, 0x0f, // twi 31,0,0
];

pub const SYSCALL_INSN_LEN: u64 = 4;

const NR_MMAP: u64 = 90;
const NR_MUNMAP: u64 = 91;
const NR_RESTART_SYSCALL: u64 = 0;

const MSR_TMA: u64 = 1 << 34; // Trans Mem state: Transactional
const MSR_TMS: u64 = 1 << 33; // Trans Mem state: Suspended
const MSR_TM: u64 = 1 << 32; // Trans Mem Available

fn msr_tm_active(msr: u64) -> bool {
    (msr & MSR_TM) != 0 && (msr & (MSR_TMA | MSR_TMS)) != 0
}

/// struct pt_regs, ELF core layout.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Ppc64Regs {
    pub gpr: [u64; 32],
    pub nip: u64,
    pub msr: u64,
    pub orig_gpr3: u64,
    pub ctr: u64,
    pub link: u64,
    pub xer: u64,
    pub ccr: u64,
    pub softe: u64,
    pub trap: u64,
    pub dar: u64,
    pub dsisr: u64,
    pub result: u64,
}

impl Default for Ppc64Regs {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            nip: 0,
            msr: 0,
            orig_gpr3: 0,
            ctr: 0,
            link: 0,
            xer: 0,
            ccr: 0,
            softe: 0,
            trap: 0,
            dar: 0,
            dsisr: 0,
            result: 0,
        }
    }
}

/// TM special purpose registers.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TmSprRegs {
    pub tfhar: u64,
    pub texasr: u64,
    pub tfiar: u64,
}

/// Registers checkpointed by the hardware when a transaction started.
///
/// The SPR and GPR sets are mandatory; float/vector checkpoint sets are
/// optional and reflected in `flags` only when actually read.
#[derive(Debug, Clone)]
pub struct Ppc64TmState {
    pub flags: FpuFlags,
    pub spr: TmSprRegs,
    pub regs: Ppc64Regs,
    pub fpregs: [u64; 33],
    pub vrregs: [[u8; 16]; 34],
    pub vsxregs: [u64; 32],
}

impl Ppc64TmState {
    fn new() -> Self {
        Self {
            flags: FpuFlags::empty(),
            spr: TmSprRegs::default(),
            regs: Ppc64Regs::default(),
            fpregs: [0; 33],
            vrregs: [[0; 16]; 34],
            vsxregs: [0; 32],
        }
    }
}

/// PPC64 floating/vector state.
///
/// The VSX registers overlap the FPR and VR storage: VSR[0-31] doubleword 0
/// is FPR[0-31] and VSR[32-63] are the Altivec registers, so only the
/// doubleword-1 halves of VSR[0-31] are read here, and only when Altivec
/// itself was captured.
#[derive(Debug, Clone)]
pub struct Ppc64FpuState {
    pub flags: FpuFlags,
    /// FPR[0..31] + FPSCR
    pub fpregs: [u64; 33],
    /// VR[0..31] + VSCR + VRSAVE
    pub vrregs: [[u8; 16]; 34],
    /// Doubleword 1 of VSR[0..31]
    pub vsxregs: [u64; 32],
    pub tm: Option<Ppc64TmState>,
}

impl Ppc64FpuState {
    fn new() -> Self {
        Self {
            flags: FpuFlags::empty(),
            fpregs: [0; 33],
            vrregs: [[0; 16]; 34],
            vsxregs: [0; 32],
            tm: None,
        }
    }
}

fn read_pod<T: Copy>(
    src: &mut dyn RegsetSource,
    set: Regset,
    val: &mut T,
) -> std::result::Result<(), RegsetError> {
    let buf =
        unsafe { slice::from_raw_parts_mut(val as *mut T as *mut u8, mem::size_of::<T>()) };
    src.read(set, buf).map(|_| ())
}

/// Mirror the kernel's check_syscall_restart (arch/powerpc/kernel/signal.c):
/// a system-call trap with CR0.SO set carries a positive error in gpr3.
pub fn normalize_restart(regs: &mut Ppc64Regs) {
    if (regs.trap & !0xf) == 0x0C00 && (regs.ccr & 0x10000000) != 0 {
        match regs.gpr[3] as i64 {
            ERESTARTNOHAND | ERESTARTSYS | ERESTARTNOINTR => {
                regs.gpr[3] = regs.orig_gpr3;
                regs.nip -= SYSCALL_INSN_LEN;
            }
            ERESTART_RESTARTBLOCK => {
                regs.gpr[0] = NR_RESTART_SYSCALL;
                regs.nip -= SYSCALL_INSN_LEN;
            }
            _ => {}
        }
    }
    // Coming back from user space, so the trap is no longer meaningful.
    regs.trap = 0;
}

fn capture_tm(pid: pid_t, src: &mut dyn RegsetSource) -> Result<Ppc64TmState> {
    let mut tm = Ppc64TmState::new();

    let tm_fatal = |what: &str, e: RegsetError| -> InfectError {
        if matches!(e, RegsetError::Unsupported) {
            log::error!("kernel seems to lack the TM ptrace API (>= 4.8)");
        }
        capture_failed(pid, what, e)
    };

    read_pod(src, Regset::PpcTmSpr, &mut tm.spr).map_err(|e| tm_fatal("TM SPR", e))?;
    read_pod(src, Regset::PpcTmCgpr, &mut tm.regs).map_err(|e| tm_fatal("TM GPR", e))?;

    match read_pod(src, Regset::PpcTmCfpr, &mut tm.fpregs) {
        Ok(()) => tm.flags.set(FpuFlags::FP),
        Err(RegsetError::Unsupported) => log::debug!("TM FPR not supported"),
        Err(e) => return Err(capture_failed(pid, "TM FPR", e)),
    }
    match read_pod(src, Regset::PpcTmCvmx, &mut tm.vrregs) {
        Ok(()) => tm.flags.set(FpuFlags::ALTIVEC),
        Err(RegsetError::Unsupported) => log::debug!("TM VMX not supported"),
        Err(e) => return Err(capture_failed(pid, "TM VMX", e)),
    }
    match read_pod(src, Regset::PpcTmCvsx, &mut tm.vsxregs) {
        Ok(()) => tm.flags.set(FpuFlags::VSX),
        Err(RegsetError::Unsupported) => log::debug!("TM VSX not supported"),
        Err(e) => return Err(capture_failed(pid, "TM VSX", e)),
    }

    Ok(tm)
}

/// Capture FPU, Altivec, VSX and - when a transaction is active or
/// suspended - the TM checkpoint registers.
pub fn capture_fpu(
    pid: pid_t,
    regs: &Ppc64Regs,
    src: &mut dyn RegsetSource,
) -> Result<ExtendedFpuState> {
    let mut fp = Ppc64FpuState::new();

    if msr_tm_active(regs.msr) {
        log::debug!(
            "task {} has {} TM operation at {:#x}",
            pid,
            if regs.msr & MSR_TMS != 0 {
                "a suspended"
            } else {
                "an active"
            },
            regs.nip
        );
        fp.tm = Some(capture_tm(pid, src)?);
        fp.flags.set(FpuFlags::TM);
    }

    read_pod(src, Regset::PrFpreg, &mut fp.fpregs)
        .map_err(|e| capture_failed(pid, "floating-point registers", e))?;
    fp.flags.set(FpuFlags::FP);

    match read_pod(src, Regset::PpcVmx, &mut fp.vrregs) {
        Ok(()) => fp.flags.set(FpuFlags::ALTIVEC),
        // EIO means Altivec is simply not there
        Err(RegsetError::Unsupported) => log::debug!("Altivec not supported"),
        Err(e) => return Err(capture_failed(pid, "Altivec registers", e)),
    }

    // VSX storage overlaps FPR and VR and is meaningless without Altivec.
    if fp.flags.contains(FpuFlags::ALTIVEC) {
        match read_pod(src, Regset::PpcVsx, &mut fp.vsxregs) {
            Ok(()) => fp.flags.set(FpuFlags::VSX),
            Err(RegsetError::Unsupported) => log::debug!("VSX register dump not supported"),
            Err(e) => return Err(capture_failed(pid, "VSX registers", e)),
        }
    }

    Ok(ExtendedFpuState::Ppc64(fp))
}

pub struct Ppc64Variant;

impl ArchVariant for Ppc64Variant {
    fn arch(&self) -> TargetArch {
        TargetArch::Ppc64
    }

    fn syscall_code(&self, _native: bool) -> &'static [u8; SYSCALL_SLOT_SIZE] {
        &CODE_SYSCALL
    }

    fn read_regs(&self, pid: pid_t, src: &mut dyn RegsetSource) -> Result<RegisterSet> {
        let mut buf = [0u8; mem::size_of::<Ppc64Regs>()];
        let len = src
            .read(Regset::PrStatus, &mut buf)
            .map_err(|e| capture_failed(pid, "general registers", e))?;
        if len != mem::size_of::<Ppc64Regs>() {
            return Err(InfectError::CaptureFailed {
                pid,
                reason: format!("regset read {} bytes, expected {}", len, buf.len()),
            });
        }
        let regs = unsafe { ptr::read_unaligned(buf.as_ptr() as *const Ppc64Regs) };
        Ok(RegisterSet::Ppc64(regs))
    }

    fn normalize_restart(&self, regs: &mut RegisterSet) -> Result<()> {
        let RegisterSet::Ppc64(r) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        normalize_restart(r);
        Ok(())
    }

    fn capture_fpu(
        &self,
        pid: pid_t,
        regs: &RegisterSet,
        src: &mut dyn RegsetSource,
    ) -> Result<ExtendedFpuState> {
        let RegisterSet::Ppc64(r) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        capture_fpu(pid, r, src)
    }

    fn prepare_syscall_regs(&self, regs: &mut RegisterSet, nr: u64, args: &[u64; 6]) -> Result<()> {
        let RegisterSet::Ppc64(r) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        r.gpr[0] = nr;
        r.gpr[3..9].copy_from_slice(args);
        Ok(())
    }

    fn mmap_nr(&self, _native: bool) -> u64 {
        NR_MMAP
    }

    fn munmap_nr(&self, _native: bool) -> u64 {
        NR_MUNMAP
    }

    fn set_regs(&self, pid: pid_t, regs: &RegisterSet) -> Result<()> {
        let RegisterSet::Ppc64(r) = regs else {
            return Err(InfectError::ArchMismatch);
        };
        let bytes = unsafe {
            slice::from_raw_parts(r as *const _ as *const u8, mem::size_of::<Ppc64Regs>())
        };
        set_regset(pid, Regset::PrStatus.nt(), bytes).map_err(InfectError::PtraceFault)
    }
}
