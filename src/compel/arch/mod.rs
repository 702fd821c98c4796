//! Architecture-pluggable register capture and syscall encoding.
//!
//! Each supported architecture provides one [`ArchVariant`] implementation,
//! selected at runtime through [`TargetArch`] instead of conditional
//! compilation, so the capture and normalization logic of every variant is
//! exercisable on any host.

pub mod arm;
pub mod ppc64;
pub mod x86_64;

use std::io;

use libc::pid_t;

use crate::error::Result;

/// Explicit target selector for the per-arch capture variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    Ppc64,
    Arm,
}

impl TargetArch {
    /// Architecture this controller itself runs on, if supported.
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X86_64)
        } else if cfg!(target_arch = "powerpc64") {
            Some(Self::Ppc64)
        } else if cfg!(target_arch = "arm") {
            Some(Self::Arm)
        } else {
            None
        }
    }
}

/// Look up the capture variant for `arch`.
pub fn variant(arch: TargetArch) -> &'static dyn ArchVariant {
    match arch {
        TargetArch::X86_64 => &x86_64::X86Variant,
        TargetArch::Ppc64 => &ppc64::Ppc64Variant,
        TargetArch::Arm => &arm::ArmVariant,
    }
}

/// ptrace regset identifiers (ELF note numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regset {
    PrStatus,
    PrFpreg,
    X86Xstate,
    PpcVmx,
    PpcVsx,
    PpcTmSpr,
    PpcTmCgpr,
    PpcTmCfpr,
    PpcTmCvmx,
    PpcTmCvsx,
    ArmVfp,
}

impl Regset {
    pub fn nt(self) -> u32 {
        match self {
            Regset::PrStatus => 1,
            Regset::PrFpreg => 2,
            Regset::X86Xstate => 0x202,
            Regset::PpcVmx => 0x100,
            Regset::PpcVsx => 0x102,
            Regset::PpcTmCgpr => 0x108,
            Regset::PpcTmCfpr => 0x109,
            Regset::PpcTmCvmx => 0x10a,
            Regset::PpcTmCvsx => 0x10b,
            Regset::PpcTmSpr => 0x10c,
            Regset::ArmVfp => 0x400,
        }
    }
}

/// Why a regset read produced no data.
#[derive(Debug)]
pub enum RegsetError {
    /// The kernel or CPU does not provide this set (EIO class). Optional
    /// sets degrade to an unset capability flag on this.
    Unsupported,
    /// A real fault; mandatory sets treat this as capture failure.
    Fault(io::Error),
}

/// Source of regset reads for one stopped thread.
///
/// Live capture goes through ptrace; the per-arch gating logic is
/// exercised in tests with scripted sources.
pub trait RegsetSource {
    fn read(&mut self, set: Regset, buf: &mut [u8]) -> std::result::Result<usize, RegsetError>;
}

/// ptrace-backed source for a stopped task.
pub struct PtraceRegsetSource {
    pub pid: pid_t,
}

impl RegsetSource for PtraceRegsetSource {
    fn read(&mut self, set: Regset, buf: &mut [u8]) -> std::result::Result<usize, RegsetError> {
        match super::ptrace::get_regset(self.pid, set.nt(), buf) {
            Ok(len) => Ok(len),
            Err(e) => match e.raw_os_error() {
                Some(libc::EIO) | Some(libc::EINVAL) | Some(libc::ENODEV) => {
                    Err(RegsetError::Unsupported)
                }
                _ => Err(RegsetError::Fault(e)),
            },
        }
    }
}

/// CPU features deciding which save format the FPU capture may use.
/// Detected on the live host, injected in tests.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub fpu: bool,
    pub xsave: bool,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                fpu: true,
                xsave: std::arch::is_x86_feature_detected!("xsave"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self {
                fpu: true,
                xsave: false,
            }
        }
    }
}

/// Classify a failed mandatory regset read.
pub(crate) fn capture_failed(pid: pid_t, what: &str, e: RegsetError) -> crate::error::InfectError {
    match e {
        RegsetError::Unsupported => crate::error::InfectError::CaptureFailed {
            pid,
            reason: format!("{} regset not supported by the kernel", what),
        },
        RegsetError::Fault(err) => crate::error::InfectError::CaptureFailed {
            pid,
            reason: format!("can't read {}: {}", what, err),
        },
    }
}

/// Which extended register sub-states were actually read. A flag is only
/// ever set after the corresponding regset came back successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FpuFlags(u32);

impl FpuFlags {
    pub const FP: Self = Self(1 << 0);
    pub const ALTIVEC: Self = Self(1 << 1);
    pub const VSX: Self = Self(1 << 2);
    pub const TM: Self = Self(1 << 3);
    pub const XSAVE: Self = Self(1 << 4);
    pub const VFP: Self = Self(1 << 5);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Signal set constants
pub const KNSIG: usize = 64;
pub const NSIG_BPW: usize = 64;
pub const KNSIG_WORDS: usize = KNSIG / NSIG_BPW;

/// Kernel signal set
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct KRtSigset {
    pub sig: [u64; KNSIG_WORDS],
}

impl KRtSigset {
    pub const fn new() -> Self {
        Self {
            sig: [0; KNSIG_WORDS],
        }
    }

    pub fn fill(&mut self) {
        for w in self.sig.iter_mut() {
            *w = !0u64;
        }
    }

    pub fn empty(&mut self) {
        for w in self.sig.iter_mut() {
            *w = 0;
        }
    }

    pub fn add(&mut self, sig: i32) {
        let s = (sig - 1) as usize;
        self.sig[s / NSIG_BPW] |= 1u64 << (s % NSIG_BPW);
    }

    pub fn del(&mut self, sig: i32) {
        let s = (sig - 1) as usize;
        self.sig[s / NSIG_BPW] &= !(1u64 << (s % NSIG_BPW));
    }
}

/// Thread context saved before parasite operations.
#[derive(Debug, Clone)]
pub struct ThreadCtx {
    pub sigmask: KRtSigset,
    pub regs: RegisterSet,
}

/// Arch- and mode-tagged general register snapshot.
///
/// The execution mode is fixed when the registers are read and never
/// reinterpreted afterwards.
#[derive(Debug, Clone)]
pub enum RegisterSet {
    X86(x86_64::X86Regs),
    Ppc64(ppc64::Ppc64Regs),
    Arm(arm::ArmRegs),
}

impl RegisterSet {
    pub fn arch(&self) -> TargetArch {
        match self {
            RegisterSet::X86(_) => TargetArch::X86_64,
            RegisterSet::Ppc64(_) => TargetArch::Ppc64,
            RegisterSet::Arm(_) => TargetArch::Arm,
        }
    }

    pub fn is_native(&self) -> bool {
        match self {
            RegisterSet::X86(r) => r.is_native(),
            RegisterSet::Ppc64(_) | RegisterSet::Arm(_) => true,
        }
    }

    pub fn ip(&self) -> u64 {
        match self {
            RegisterSet::X86(r) => r.ip(),
            RegisterSet::Ppc64(r) => r.nip,
            RegisterSet::Arm(r) => r.pc() as u64,
        }
    }

    pub fn set_ip(&mut self, val: u64) {
        match self {
            RegisterSet::X86(r) => r.set_ip(val),
            RegisterSet::Ppc64(r) => r.nip = val,
            RegisterSet::Arm(r) => r.set_pc(val as u32),
        }
    }

    pub fn sp(&self) -> u64 {
        match self {
            RegisterSet::X86(r) => r.sp(),
            RegisterSet::Ppc64(r) => r.gpr[1],
            RegisterSet::Arm(r) => r.sp() as u64,
        }
    }

    pub fn set_sp(&mut self, val: u64) {
        match self {
            RegisterSet::X86(r) => r.set_sp(val),
            RegisterSet::Ppc64(r) => r.gpr[1] = val,
            RegisterSet::Arm(r) => r.set_sp(val as u32),
        }
    }

    /// Syscall result register (ax / gpr3 / r0), sign-extended per the
    /// execution mode so in-band kernel errnos from 32-bit modes stay
    /// negative.
    pub fn ret_value(&self) -> i64 {
        match self {
            RegisterSet::X86(r) => r.ax_signed(),
            RegisterSet::Ppc64(r) => r.gpr[3] as i64,
            RegisterSet::Arm(r) => r.r0() as i32 as i64,
        }
    }

    /// Condition flags register (eflags / ccr / cpsr).
    pub fn flags(&self) -> u64 {
        match self {
            RegisterSet::X86(r) => r.eflags(),
            RegisterSet::Ppc64(r) => r.ccr,
            RegisterSet::Arm(r) => r.cpsr() as u64,
        }
    }
}

/// Extended FPU/vector state, tagged by architecture and save format.
#[derive(Debug, Clone)]
pub enum ExtendedFpuState {
    /// Host has no FPU at all; nothing was captured.
    None,
    X86(x86_64::X86FpuState),
    Ppc64(ppc64::Ppc64FpuState),
    Arm(arm::ArmVfpState),
}

impl ExtendedFpuState {
    /// Capability flags reflecting exactly the sub-states that were read.
    pub fn flags(&self) -> FpuFlags {
        match self {
            ExtendedFpuState::None => FpuFlags::empty(),
            ExtendedFpuState::X86(s) => s.flags(),
            ExtendedFpuState::Ppc64(s) => s.flags,
            ExtendedFpuState::Arm(_) => {
                let mut f = FpuFlags::empty();
                f.set(FpuFlags::VFP);
                f
            }
        }
    }
}

/// Kernel-internal syscall restart codes (include/linux/errno.h).
pub const ERESTARTSYS: i64 = 512;
pub const ERESTARTNOINTR: i64 = 513;
pub const ERESTARTNOHAND: i64 = 514;
pub const ERESTART_RESTARTBLOCK: i64 = 516;

/// Size of the injected code slot: syscall instruction plus a trap,
/// padded to one alignment unit.
pub const SYSCALL_SLOT_SIZE: usize = 8;

/// One implementation per supported architecture.
pub trait ArchVariant: Sync {
    fn arch(&self) -> TargetArch;

    /// Injected instruction bytes for the given execution mode: the
    /// syscall instruction immediately followed by a trap.
    fn syscall_code(&self, native: bool) -> &'static [u8; SYSCALL_SLOT_SIZE];

    /// Read the general registers of a stopped thread, without restart
    /// normalization.
    fn read_regs(&self, pid: pid_t, src: &mut dyn RegsetSource) -> Result<RegisterSet>;

    /// Rewrite ip and the return-value register of a thread stopped in an
    /// interrupted restart-class syscall, mirroring kernel semantics.
    fn normalize_restart(&self, regs: &mut RegisterSet) -> Result<()>;

    /// Read plus normalize; this is what capture uses.
    fn capture_regs(&self, pid: pid_t, src: &mut dyn RegsetSource) -> Result<RegisterSet> {
        let mut regs = self.read_regs(pid, src)?;
        self.normalize_restart(&mut regs)?;
        Ok(regs)
    }

    /// Read extended FPU/vector state for already-captured registers.
    fn capture_fpu(
        &self,
        pid: pid_t,
        regs: &RegisterSet,
        src: &mut dyn RegsetSource,
    ) -> Result<ExtendedFpuState>;

    /// Place syscall number and arguments per the mode's calling
    /// convention.
    fn prepare_syscall_regs(&self, regs: &mut RegisterSet, nr: u64, args: &[u64; 6]) -> Result<()>;

    /// mmap syscall number for the given execution mode.
    fn mmap_nr(&self, native: bool) -> u64;

    /// munmap syscall number for the given execution mode.
    fn munmap_nr(&self, native: bool) -> u64;

    /// Write registers back into the stopped task.
    fn set_regs(&self, pid: pid_t, regs: &RegisterSet) -> Result<()>;
}
