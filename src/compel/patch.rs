//! Word-granular backup/apply/restore of target memory.

use libc::pid_t;

use super::ptrace::{peek_area, poke_area, WORD_SIZE};
use crate::error::{InfectError, Result};

/// Swap `buf` with the bytes at `addr` in the target.
///
/// On success `buf` holds the bytes that were overwritten, so a second
/// call with the same buffer undoes the first. If the write fails midway
/// the original bytes are put back; if that restore also fails the target
/// is left inconsistent and the error says so - callers must not resume
/// the task in that case.
pub fn swap_area(pid: pid_t, addr: u64, buf: &mut [u8]) -> Result<()> {
    if buf.len() % WORD_SIZE != 0 {
        return Err(InfectError::InvalidLength(buf.len()));
    }

    let mut orig = vec![0u8; buf.len()];
    peek_area(pid, &mut orig, addr)?;

    if let Err(e) = poke_area(pid, buf, addr) {
        if poke_area(pid, &orig, addr).is_err() {
            log::error!(
                "failed to restore {} bytes at {:#x} in {}",
                buf.len(),
                addr,
                pid
            );
            return Err(InfectError::TargetInconsistent { pid });
        }
        return Err(e);
    }

    buf.copy_from_slice(&orig);
    Ok(())
}

/// Bytes temporarily replaced inside the target.
///
/// Every patch must be reverted exactly once before it is discarded.
/// Dropping an unreverted patch logs and restores best-effort.
#[derive(Debug)]
pub struct MemoryPatch {
    pid: pid_t,
    addr: u64,
    orig: Vec<u8>,
    reverted: bool,
}

impl MemoryPatch {
    /// Back up `new.len()` bytes at `addr` and write `new` in their place.
    pub fn apply(pid: pid_t, addr: u64, new: &[u8]) -> Result<Self> {
        let mut buf = new.to_vec();
        swap_area(pid, addr, &mut buf)?;
        Ok(Self {
            pid,
            addr,
            orig: buf,
            reverted: false,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.orig.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orig.is_empty()
    }

    /// The bytes that were at `addr` before the patch.
    pub fn original(&self) -> &[u8] {
        &self.orig
    }

    /// Put the original bytes back.
    pub fn revert(mut self) -> Result<()> {
        self.reverted = true;
        poke_area(self.pid, &self.orig, self.addr)
    }
}

impl Drop for MemoryPatch {
    fn drop(&mut self) {
        if self.reverted {
            return;
        }
        log::warn!(
            "patch at {:#x} in {} dropped without revert, restoring",
            self.addr,
            self.pid
        );
        if poke_area(self.pid, &self.orig, self.addr).is_err() {
            log::error!(
                "could not restore {} bytes at {:#x} in {}",
                self.orig.len(),
                self.addr,
                self.pid
            );
        }
    }
}
