//! Compel - parasite code injection library
//!
//! Seizes a traced task, captures its architecture-specific register
//! state and runs controller-chosen syscalls inside its address space.

pub mod arch;
pub mod infect;
pub mod patch;
pub mod ptrace;
pub mod seize;

pub use arch::{
    variant, ArchVariant, ExtendedFpuState, FpuFlags, KRtSigset, RegisterSet, TargetArch,
    ThreadCtx,
};
pub use infect::{ParasiteSession, TracedThread};
pub use patch::{swap_area, MemoryPatch};
pub use seize::{seize, wait_task, ProcStatusProbe, StatusProbe, TaskState, TaskStatus};
