// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live virtual-machine state transfer.
//!
//! Devices register versioned state sections with the [`registry`], the
//! [`driver`] streams them between hosts as self-describing frames with
//! out-of-band [`command`]s, and two migration disciplines build on that
//! framework: demand-paged [`postcopy`] and checkpoint-replicated [`colo`].
//!
//! The block layer, NIC filters, the VM run loop and guest memory mapping
//! stay outside; they are reached through the traits in [`vm`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::sync::{Mutex, MutexGuard};

pub mod announce;
pub mod colo;
pub mod command;
pub mod config;
pub mod driver;
pub mod postcopy;
pub mod protocol;
pub mod ram;
pub mod registry;
pub mod section;
pub mod snapshot;
pub mod state;
pub mod vm;

pub use config::{MigrationConfig, MigrationParams};
pub use driver::IncomingState;
pub use registry::SectionRegistry;
pub use state::{MigrationStatus, SharedStatus};

/// Lock a mutex whose poisoning we treat as fatal; every holder of these
/// locks only performs non-panicking state updates.
pub(crate) trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
