// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering::SeqCst};
use std::sync::Arc;

/// Where a migration currently stands. Long-running loops poll this and
/// unwind cooperatively when the status moves away from their phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationStatus {
    None = 0,
    Setup = 1,
    Active = 2,
    Postcopy = 3,
    Colo = 4,
    Completed = 5,
    Failed = 6,
    Cancelled = 7,
}

impl MigrationStatus {
    fn from_u8(v: u8) -> MigrationStatus {
        match v {
            1 => MigrationStatus::Setup,
            2 => MigrationStatus::Active,
            3 => MigrationStatus::Postcopy,
            4 => MigrationStatus::Colo,
            5 => MigrationStatus::Completed,
            6 => MigrationStatus::Failed,
            7 => MigrationStatus::Cancelled,
            _ => MigrationStatus::None,
        }
    }
}

/// Shared, atomically-updated migration status.
#[derive(Debug, Clone, Default)]
pub struct SharedStatus(Arc<AtomicU8>);

impl SharedStatus {
    pub fn new(status: MigrationStatus) -> Self {
        SharedStatus(Arc::new(AtomicU8::new(status as u8)))
    }

    pub fn get(&self) -> MigrationStatus {
        MigrationStatus::from_u8(self.0.load(SeqCst))
    }

    pub fn set(&self, status: MigrationStatus) {
        self.0.store(status as u8, SeqCst);
    }

    /// Move `old → new`; returns false when someone else got there first.
    pub fn transition(&self, old: MigrationStatus, new: MigrationStatus) -> bool {
        self.0
            .compare_exchange(old as u8, new as u8, SeqCst, SeqCst)
            .is_ok()
    }
}
