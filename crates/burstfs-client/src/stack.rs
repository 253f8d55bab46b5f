//! Free-index stacks living inside the superblock
//!
//! A stack hands out integer ids in `[0, capacity)`. It is stored in place
//! so that every process mapping the region sees the same free list:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────┐
//! │ capacity u32 │ free     u32 │ slots: capacity × u32        │
//! └──────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! `slots[0..free]` are the free ids, the top of the stack is
//! `slots[free - 1]`. A fresh stack pops `0, 1, 2, ...` in order.
//!
//! Stacks do no locking of their own. Callers take a [`StackLock`] first;
//! which lock is chosen once at mount time.

use burstfs_common::{Error, Result};
use std::fmt;
use std::fs::File;

const HEADER_SIZE: usize = 8;
const SLOT_SIZE: usize = 4;

/// A stack of free ids over a borrowed byte region
pub struct FreeStack<'a> {
    buf: &'a mut [u8],
    what: &'static str,
}

impl<'a> FreeStack<'a> {
    /// Bytes needed for a stack of `capacity` ids
    #[must_use]
    pub const fn bytes(capacity: usize) -> usize {
        HEADER_SIZE + capacity * SLOT_SIZE
    }

    /// View an already laid out region; `what` names the ids in errors
    pub fn attach(buf: &'a mut [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    /// Fill the stack with every id in `[0, capacity)`
    pub fn init(&mut self, capacity: usize) -> Result<()> {
        if Self::bytes(capacity) > self.buf.len() {
            return Err(Error::Layout(format!(
                "{} stack of {capacity} needs {} bytes, region has {}",
                self.what,
                Self::bytes(capacity),
                self.buf.len()
            )));
        }
        let cap = u32::try_from(capacity)
            .map_err(|_| Error::Layout(format!("{} stack capacity {capacity}", self.what)))?;
        self.write_u32(0, cap);
        self.write_u32(4, cap);
        for i in 0..cap {
            self.write_slot(i as usize, cap - 1 - i);
        }
        Ok(())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.read_u32(0) as usize
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.read_u32(4) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free_count() == 0
    }

    /// Take a free id
    pub fn pop(&mut self) -> Result<u32> {
        let free = self.read_u32(4);
        if free == 0 {
            return Err(Error::Exhausted(self.what));
        }
        let id = self.read_slot(free as usize - 1);
        self.write_u32(4, free - 1);
        Ok(id)
    }

    /// Return an id
    ///
    /// Pushing an id that is already free corrupts the stack; only a push
    /// onto a full stack or of an out-of-range id is detected.
    pub fn push(&mut self, id: u32) -> Result<()> {
        let cap = self.read_u32(0);
        let free = self.read_u32(4);
        if id >= cap {
            return Err(Error::invalid_argument(format!(
                "{} id {id} outside stack of {cap}",
                self.what
            )));
        }
        if free >= cap {
            return Err(Error::invalid_argument(format!(
                "{} stack already full, cannot return {id}",
                self.what
            )));
        }
        self.write_slot(free as usize, id);
        self.write_u32(4, free + 1);
        Ok(())
    }

    fn read_u32(&self, at: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[at..at + 4]);
        u32::from_le_bytes(raw)
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_slot(&self, slot: usize) -> u32 {
        self.read_u32(HEADER_SIZE + slot * SLOT_SIZE)
    }

    fn write_slot(&mut self, slot: usize, value: u32) {
        self.write_u32(HEADER_SIZE + slot * SLOT_SIZE, value);
    }
}

impl fmt::Debug for FreeStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeStack")
            .field("what", &self.what)
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}

/// Mutual exclusion around stack and lock-state updates
pub trait StackLock: Send + Sync + fmt::Debug {
    fn acquire(&self) -> Result<StackGuard<'_>>;
}

/// Held while a stack is being modified
#[must_use]
pub struct StackGuard<'a> {
    file: Option<&'a File>,
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file
            && let Err(e) = fs2::FileExt::unlock(file)
        {
            tracing::warn!("Failed to release superblock lock: {}", e);
        }
    }
}

/// For a region private to one process
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl StackLock for NoLock {
    fn acquire(&self) -> Result<StackGuard<'_>> {
        Ok(StackGuard { file: None })
    }
}

/// For a region mapped by several processes on the node
///
/// Takes an exclusive `flock` on a handle to the region's backing object,
/// which every process sharing the region can open.
#[derive(Debug)]
pub struct SharedLock {
    file: File,
}

impl SharedLock {
    #[must_use]
    pub const fn new(file: File) -> Self {
        Self { file }
    }
}

impl StackLock for SharedLock {
    fn acquire(&self) -> Result<StackGuard<'_>> {
        fs2::FileExt::lock_exclusive(&self.file)?;
        Ok(StackGuard {
            file: Some(&self.file),
        })
    }
}
