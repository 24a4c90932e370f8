// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The narrow kernel surface postcopy stands on: user-space page-fault
//! delivery, page-level memory advice, and an eventfd-style quit signal.
//!
//! Everything above the syscall layer talks to the [`HostMemory`] and
//! [`FaultChannel`] traits so the engine can be driven by the real Linux
//! backend in production and by [`testing::TestMemory`] in tests.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::io;
use std::sync::Arc;
use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Debug, Error)]
pub enum SysError {
    #[error("host lacks required capability: {0}")]
    Unsupported(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("short read from fault descriptor: {0} bytes")]
    ShortFaultRead(usize),
    #[error("address {0:#x} outside any mapped range")]
    BadAddress(u64),
}

pub type Result<T> = std::result::Result<T, SysError>;

/// What the fault thread saw when it woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultEvent {
    /// A guest access hit a page that has not been placed yet; `addr` is the
    /// faulting host address as reported by the kernel.
    Fault { addr: u64 },
    /// The quit signal fired; the fault thread must clean up and exit.
    Quit,
}

/// One registered user-fault descriptor plus its quit signal.
///
/// `copy` and `zeropage` atomically install a page and wake every thread
/// blocked on an address inside the range.
pub trait FaultChannel: Send + Sync {
    fn register(&self, start: u64, len: u64) -> Result<()>;
    fn unregister(&self, start: u64, len: u64) -> Result<()>;
    fn copy(&self, dst: u64, src: u64, len: u64) -> Result<()>;
    fn zeropage(&self, start: u64, len: u64) -> Result<()>;
    fn wake(&self, start: u64, len: u64) -> Result<()>;
    /// Block until a fault arrives or the quit signal fires.
    fn next_event(&self) -> Result<FaultEvent>;
    fn request_quit(&self) -> Result<()>;
}

/// Host memory operations postcopy needs beyond the fault channel itself.
///
/// `write`/`read` operate on raw host addresses; callers must only pass
/// addresses inside ranges they obtained from this backend or registered
/// with it.
pub trait HostMemory: Send + Sync {
    fn page_size(&self) -> usize;

    /// The ADVISE-time capability probe: verify page-fault delivery with the
    /// required feature set is actually available, and disable memory
    /// locking process-wide (user faults and locked pages do not mix).
    fn probe(&self, target_page_size: usize) -> Result<()>;

    /// Drop the backing of a range (reads afterwards observe zeroes).
    fn discard(&self, addr: u64, len: u64) -> Result<()>;
    /// Keep the range on base pages so single pages can be placed atomically.
    fn nohuge(&self, addr: u64, len: u64) -> Result<()>;
    /// Allow huge pages again once migration is over.
    fn huge(&self, addr: u64, len: u64) -> Result<()>;
    /// Re-lock process memory after cleanup, when the embedder wants it.
    fn lock_all(&self) -> Result<()>;

    /// Map one anonymous staging page.
    fn alloc_page(&self) -> Result<u64>;
    fn free_page(&self, addr: u64) -> Result<()>;

    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    fn open_fault_channel(&self, nonblocking: bool) -> Result<Arc<dyn FaultChannel>>;
}
