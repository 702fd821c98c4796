use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InfectError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("can't seize task {pid}: {reason}")]
    AttachFailed { pid: i32, reason: String },

    #[error("can't capture mandatory register state of {pid}: {reason}")]
    CaptureFailed { pid: i32, reason: String },

    #[error("area request with non-word size {0}")]
    InvalidLength(usize),

    #[error("ptrace request failed: {0}")]
    PtraceFault(io::Error),

    #[error("task {pid} left partially patched, unsafe to resume")]
    TargetInconsistent { pid: i32 },

    #[error("register set does not match the selected architecture")]
    ArchMismatch,

    #[error("can't execute parasite code in {pid}: {reason}")]
    ExecutionFailed { pid: i32, reason: String },

    #[error("remote syscall failed with errno {0}")]
    SyscallFailed(i32),
}

pub type Result<T> = std::result::Result<T, InfectError>;
