//! Linear memory for marshalling
//!
//! Requests and responses cross into the module as byte buffers allocated
//! from a bounded arena. Each buffer is owned by an [`Allocation`] guard
//! that frees it when dropped, so every exit path of a call releases what
//! it allocated.

use slab::Slab;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Handle to a buffer in linear memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ptr(pub u32);

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptr:{:#x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("linear memory exhausted: {requested} bytes requested, {available} available")]
    Exhausted { requested: usize, available: usize },
    #[error("invalid pointer {0}")]
    BadPointer(Ptr),
    #[error("{len} bytes do not fit a {capacity} byte buffer")]
    Overflow { len: usize, capacity: usize },
}

/// Bounded buffer arena
#[derive(Debug)]
pub struct LinearMemory {
    blocks: Slab<Vec<u8>>,
    used: usize,
    limit: usize,
    peak: usize,
}

impl LinearMemory {
    pub fn new(limit: usize) -> Self {
        Self {
            blocks: Slab::new(),
            used: 0,
            limit,
            peak: 0,
        }
    }

    /// Reserve a zeroed buffer of `len` bytes
    pub fn alloc(&mut self, len: usize) -> Result<Ptr, MemoryError> {
        let available = self.limit - self.used;
        if len > available {
            return Err(MemoryError::Exhausted {
                requested: len,
                available,
            });
        }
        let key = self.blocks.insert(vec![0; len]);
        self.used += len;
        self.peak = self.peak.max(self.used);
        Ok(Ptr(key as u32))
    }

    pub fn free(&mut self, ptr: Ptr) -> Result<(), MemoryError> {
        let block = self
            .blocks
            .try_remove(ptr.0 as usize)
            .ok_or(MemoryError::BadPointer(ptr))?;
        self.used -= block.len();
        Ok(())
    }

    /// Copy `bytes` into the start of a buffer
    pub fn write(&mut self, ptr: Ptr, bytes: &[u8]) -> Result<(), MemoryError> {
        let block = self
            .blocks
            .get_mut(ptr.0 as usize)
            .ok_or(MemoryError::BadPointer(ptr))?;
        if bytes.len() > block.len() {
            return Err(MemoryError::Overflow {
                len: bytes.len(),
                capacity: block.len(),
            });
        }
        block[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, ptr: Ptr) -> Result<&[u8], MemoryError> {
        self.blocks
            .get(ptr.0 as usize)
            .map(|block| block.as_slice())
            .ok_or(MemoryError::BadPointer(ptr))
    }

    /// Number of buffers not yet freed
    pub fn live(&self) -> usize {
        self.blocks.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn peak(&self) -> usize {
        self.peak
    }
}

/// Shared handle to a module's linear memory
pub type SharedMemory = Rc<RefCell<LinearMemory>>;

/// A buffer that is freed when the guard goes out of scope
#[derive(Debug)]
pub struct Allocation {
    memory: SharedMemory,
    ptr: Ptr,
    len: usize,
}

impl Allocation {
    pub fn new(memory: &SharedMemory, len: usize) -> Result<Self, MemoryError> {
        let ptr = memory.borrow_mut().alloc(len)?;
        Ok(Self {
            memory: memory.clone(),
            ptr,
            len,
        })
    }

    /// Allocate exactly enough for `bytes` and copy them in
    pub fn from_bytes(memory: &SharedMemory, bytes: &[u8]) -> Result<Self, MemoryError> {
        let alloc = Self::new(memory, bytes.len())?;
        let written = memory.borrow_mut().write(alloc.ptr, bytes);
        written.map(|_| alloc)
    }

    pub fn ptr(&self) -> Ptr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MemoryError> {
        Ok(self.memory.borrow().read(self.ptr)?.to_vec())
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Err(e) = self.memory.borrow_mut().free(self.ptr) {
            log::error!("freeing {}: {}", self.ptr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_memory(limit: usize) -> SharedMemory {
        Rc::new(RefCell::new(LinearMemory::new(limit)))
    }

    #[test]
    fn test_alloc_and_free() {
        let mut mem = LinearMemory::new(100);
        let a = mem.alloc(40).unwrap();
        let b = mem.alloc(60).unwrap();
        assert_eq!(mem.used(), 100);
        assert_eq!(mem.live(), 2);

        mem.free(a).unwrap();
        assert_eq!(mem.used(), 60);
        mem.free(b).unwrap();
        assert_eq!(mem.live(), 0);
        assert_eq!(mem.peak(), 100);
    }

    #[test]
    fn test_limit_enforced() {
        let mut mem = LinearMemory::new(10);
        mem.alloc(8).unwrap();
        assert_eq!(
            mem.alloc(3),
            Err(MemoryError::Exhausted {
                requested: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_double_free() {
        let mut mem = LinearMemory::new(10);
        let p = mem.alloc(4).unwrap();
        mem.free(p).unwrap();
        assert_eq!(mem.free(p), Err(MemoryError::BadPointer(p)));
    }

    #[test]
    fn test_write_overflow() {
        let mut mem = LinearMemory::new(10);
        let p = mem.alloc(2).unwrap();
        assert!(matches!(
            mem.write(p, b"abc"),
            Err(MemoryError::Overflow { len: 3, capacity: 2 })
        ));
        mem.write(p, b"ab").unwrap();
        assert_eq!(mem.read(p).unwrap(), b"ab");
    }

    // ========== Guards ==========

    #[test]
    fn test_guard_frees_on_drop() {
        let memory = setup_memory(64);
        {
            let a = Allocation::from_bytes(&memory, b"hello").unwrap();
            assert_eq!(a.to_vec().unwrap(), b"hello");
            assert_eq!(memory.borrow().live(), 1);
        }
        assert_eq!(memory.borrow().live(), 0);
        assert_eq!(memory.borrow().used(), 0);
    }

    #[test]
    fn test_guard_frees_on_error_path() {
        fn fails(memory: &SharedMemory) -> Result<(), MemoryError> {
            let _held = Allocation::new(memory, 32)?;
            Allocation::new(memory, 64)?;
            Ok(())
        }

        let memory = setup_memory(64);
        assert!(fails(&memory).is_err());
        assert_eq!(memory.borrow().live(), 0);
    }
}
