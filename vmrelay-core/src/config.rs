// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Engine tunables. Everything has a usable default; embedders usually
/// deserialize this straight out of their own configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Milliseconds between COLO checkpoint transactions.
    pub checkpoint_delay_ms: u64,
    /// Upper bound accepted for a PACKAGED command, checked before any
    /// allocation happens.
    pub max_packaged_size: u32,
    /// Start the guest as soon as postcopy enters RUNNING; `false` leaves it
    /// paused for management to start.
    pub autostart: bool,
    /// Re-lock process memory after postcopy cleanup. Locking had to be
    /// dropped for the fault window; embedders running with mlock get it
    /// back once every page is local again.
    pub relock_memory: bool,
    /// log2 of the guest page size the RAM bitmap is expressed in.
    pub target_page_bits: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            checkpoint_delay_ms: 200,
            max_packaged_size: 1 << 24,
            autostart: true,
            relock_memory: false,
            target_page_bits: 12,
        }
    }
}

/// Per-migration parameters handed to every live section before setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationParams {
    /// Migrate block device contents in-band.
    pub blk: bool,
    /// Storage is shared between source and destination.
    pub shared: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let cfg: MigrationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.checkpoint_delay_ms, 200);
        assert_eq!(cfg.max_packaged_size, 1 << 24);
        assert!(cfg.autostart);
        assert_eq!(cfg.target_page_bits, 12);
    }
}
