// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! What a migratable unit of state looks like to the engine: a capability
//! record (the ops trait object) owning whatever per-device state it needs.

use crate::config::MigrationParams;
use vmrelay_wire::WireStream;

/// What a live iteration pass reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterateStatus {
    /// More data pending; the driver should come back for another pass.
    Again,
    /// This section has nothing further to send iteratively.
    Done,
}

/// Iteratively-savable bulk state (RAM and friends).
///
/// A live section writes its own payload framing inside the section frames
/// the driver emits; `load` must consume exactly what the save side wrote.
pub trait LiveOps: Send {
    fn set_params(&mut self, _params: &MigrationParams) {}

    /// Called once under a SECTION_START frame before any iteration.
    fn setup(&mut self, f: &mut WireStream) -> anyhow::Result<()>;

    /// One bounded chunk of state under a SECTION_PART frame.
    fn iterate(&mut self, f: &mut WireStream) -> anyhow::Result<IterateStatus>;

    /// Final flush under a SECTION_END frame, guest stopped.
    fn complete(&mut self, f: &mut WireStream) -> anyhow::Result<()>;

    /// Estimated bytes still to transfer; drives the postcopy switch.
    fn pending(&mut self, _max_size: u64) -> u64 {
        0
    }

    fn load(&mut self, f: &mut WireStream, version_id: u32) -> anyhow::Result<()>;

    fn is_active(&self) -> bool {
        true
    }

    /// Whether this section's remaining state can be demand-fetched.
    fn can_postcopy(&self) -> bool {
        false
    }

    fn cancel(&mut self) {}
}

/// Whole-state save/load ("old style"): one blob under a SECTION_FULL frame.
pub trait DeviceOps: Send {
    fn save(&mut self, f: &mut WireStream) -> anyhow::Result<()>;
    fn load(&mut self, f: &mut WireStream, version_id: u32) -> anyhow::Result<()>;
}

/// The "new style" structured descriptor: versioning metadata the registry
/// can reason about without calling into the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDescriptor {
    pub name: String,
    pub version_id: u32,
    pub minimum_version_id: u32,
    /// A registered-but-unmigratable device blocks every migration.
    pub unmigratable: bool,
}

impl StateDescriptor {
    pub fn new(name: &str, version_id: u32, minimum_version_id: u32) -> Self {
        StateDescriptor {
            name: name.to_string(),
            version_id,
            minimum_version_id,
            unmigratable: false,
        }
    }
}

/// A section is either live, a bare save/load pair, or descriptor-driven,
/// never more than one of these at once.
pub enum SectionBody {
    Live(Box<dyn LiveOps>),
    Plain(Box<dyn DeviceOps>),
    Described {
        desc: StateDescriptor,
        ops: Box<dyn DeviceOps>,
    },
}

impl SectionBody {
    /// Live-iterable bulk memory, skipped by device-only serialization.
    pub fn is_ram(&self) -> bool {
        matches!(self, SectionBody::Live(_))
    }

    pub fn descriptor(&self) -> Option<&StateDescriptor> {
        match self {
            SectionBody::Described { desc, .. } => Some(desc),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SectionBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SectionBody::Live(_) => f.write_str("Live"),
            SectionBody::Plain(_) => f.write_str("Plain"),
            SectionBody::Described { desc, .. } => write!(f, "Described({})", desc.name),
        }
    }
}
