// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the subsystems this engine deliberately does not own:
//! the VM run loop, block replication, the NIC filter layer, the COLO RAM
//! cache, and event delivery. Production embedders implement these; tests
//! drop in the mocks from `driver::tests` and the integration suites.

/// Block replication role during COLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    Primary,
    Secondary,
}

/// Which COLO side an engine or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColoMode {
    Primary,
    Secondary,
}

/// Why a migration or COLO loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Ordinary completion.
    Normal,
    /// A transport, protocol or device failure unwound the loop.
    Error,
    /// An operator request (failover, cancel) ended it.
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

/// The VM run loop. Methods that stop or start the guest are called with
/// the embedder's equivalent of the big VM lock held.
pub trait VmController: Send + Sync {
    /// Force the guest to stop, regardless of what it is doing.
    fn stop(&self) -> anyhow::Result<()>;
    fn start(&self) -> anyhow::Result<()>;
    /// Reset devices to power-on defaults without telling the user.
    fn reset_silent(&self) -> anyhow::Result<()>;
    fn is_running(&self) -> bool;
    /// Flush per-CPU state into the device model before serializing it.
    fn sync_cpu_state(&self) {}
    /// Ask the host process to shut down (COLO coordinated shutdown).
    fn request_shutdown(&self) {}
    /// Whether a freshly-loaded guest should run immediately.
    fn autostart(&self) -> bool {
        true
    }
    /// Secondary failover forces this on so the new primary actually runs.
    fn set_autostart(&self, _on: bool) {}
}

/// The block-layer replication interface used by COLO.
pub trait BlockReplication: Send + Sync {
    fn start_replication(&self, mode: ReplicationMode) -> anyhow::Result<()>;
    fn stop_replication(&self, failover: bool) -> anyhow::Result<()>;
    /// Commit a checkpoint on every replicated disk.
    fn checkpoint(&self) -> anyhow::Result<()>;
}

/// The NIC filter layer: holding guest egress until the secondary catches up.
pub trait PacketBuffering: Send + Sync {
    /// Whether the netdev stack supports buffering at all.
    fn supported(&self) -> bool {
        true
    }
    fn set_buffering(&self, enabled: bool) -> anyhow::Result<()>;
    /// Let everything buffered so far out on the wire.
    fn release_buffered(&self);
}

/// Destination-side shadow of guest RAM used by COLO to defer commits until
/// a whole checkpoint has arrived.
pub trait RamCache: Send + Sync {
    fn init(&self) -> anyhow::Result<()>;
    /// Move the cached pages into actual guest memory.
    fn flush(&self) -> anyhow::Result<()>;
    fn release(&self);
}

/// Out-of-band event delivery to the operator surface.
pub trait EventSink: Send + Sync {
    fn migration_exit(&self, _reason: ExitReason) {}
    fn colo_exit(&self, mode: ColoMode, reason: ExitReason);
}

/// Raw-frame egress used by the post-migration self announce.
pub trait NicAnnounce: Send + Sync {
    fn macs(&self) -> Vec<MacAddr>;
    fn send_raw(&self, frame: &[u8]);
}
