//! The kernel as a loaded module
//!
//! A [`ModuleInstance`] is what the host talks to: a message bus behind a
//! linear memory. The host copies an encoded request into memory, calls the
//! module with its pointer, and gets back a pointer to the encoded
//! response. Both buffers are guarded allocations.

use super::memory::{Allocation, LinearMemory, MemoryError, SharedMemory};
use crate::config::KernelConfig;
use crate::kernel::{FsEvent, Kernel, MessageBus};
use crate::protocol::ProtocolError;
use crate::vfs::ContentSource;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct ModuleInstance {
    bus: MessageBus,
    memory: SharedMemory,
}

impl ModuleInstance {
    pub fn new(config: &KernelConfig, source: Box<dyn ContentSource>) -> Self {
        Self::with_bus(MessageBus::new(Kernel::new(config, source)), config.memory_limit)
    }

    pub fn with_bus(bus: MessageBus, memory_limit: usize) -> Self {
        Self {
            bus,
            memory: Rc::new(RefCell::new(LinearMemory::new(memory_limit))),
        }
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn is_poisoned(&self) -> bool {
        self.bus.is_poisoned()
    }

    /// Reserve a buffer the host can fill
    pub fn alloc(&self, len: usize) -> Result<Allocation, MemoryError> {
        Allocation::new(&self.memory, len)
    }

    /// Copy bytes into a fresh buffer
    pub fn load(&self, bytes: &[u8]) -> Result<Allocation, MemoryError> {
        Allocation::from_bytes(&self.memory, bytes)
    }

    /// Run one encoded request at time `now` and return the encoded response
    pub fn call(&mut self, request: &Allocation, now: f64) -> Result<Allocation, ModuleError> {
        let bytes = request.to_vec()?;
        self.bus.kernel_mut().set_clock(now);
        let response = self.bus.dispatch_bytes(&bytes)?;
        Ok(self.load(&response)?)
    }

    /// Filesystem change events posted by the kernel since the last take
    pub fn take_events(&mut self) -> Vec<FsEvent> {
        self.bus.kernel_mut().take_events()
    }
}
