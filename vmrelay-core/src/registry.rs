// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ordered set of registered state sections. Registration happens at
//! device realize, unregistration at unrealize; emission order on the wire
//! is registration order.

use crate::section::{DeviceOps, LiveOps, SectionBody, StateDescriptor};
use serde_json::json;
use std::sync::{Mutex, OnceLock};
use tracing::debug;

/// Caller's choice of instance id at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceId {
    /// One more than the highest existing id for the same idstr.
    Auto,
    Exact(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompatEntry {
    idstr: String,
    instance_id: u32,
}

/// One registered section.
pub struct SectionEntry {
    /// Runtime-assigned, monotonically increasing; keys PART/END frames.
    pub section_id: u32,
    pub idstr: String,
    pub instance_id: u32,
    pub alias_id: Option<u32>,
    pub version_id: u32,
    compat: Option<CompatEntry>,
    pub body: SectionBody,
}

impl SectionEntry {
    pub fn is_ram(&self) -> bool {
        self.body.is_ram()
    }
}

/// Insertion-ordered registry of state sections.
#[derive(Default)]
pub struct SectionRegistry {
    entries: Vec<SectionEntry>,
    next_section_id: u32,
}

impl SectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_instance_id(&self, idstr: &str) -> u32 {
        let mut instance_id = 0;
        for e in &self.entries {
            if e.idstr == idstr && instance_id <= e.instance_id {
                instance_id = e.instance_id + 1;
            }
        }
        instance_id
    }

    fn next_compat_instance_id(&self, idstr: &str) -> u32 {
        let mut instance_id = 0;
        for e in &self.entries {
            if let Some(compat) = &e.compat {
                if compat.idstr == idstr && instance_id <= compat.instance_id {
                    instance_id = compat.instance_id + 1;
                }
            }
        }
        instance_id
    }

    /// Canonicalize the idstr against the device path and work out the
    /// instance id, creating a compat entry for migrations from producers
    /// that predate device-path prefixes.
    fn resolve_identity(
        &self,
        dev_path: Option<&str>,
        idstr: &str,
        instance_id: InstanceId,
    ) -> (String, u32, Option<CompatEntry>) {
        match dev_path {
            Some(path) => {
                let full = format!("{path}/{idstr}");
                let compat = CompatEntry {
                    idstr: idstr.to_string(),
                    instance_id: match instance_id {
                        InstanceId::Auto => self.next_compat_instance_id(idstr),
                        InstanceId::Exact(id) => id,
                    },
                };
                // The caller's id went into the compat entry; the canonical
                // identity is always auto-assigned.
                let id = self.next_instance_id(&full);
                debug_assert_eq!(id, 0, "duplicate device path registration: {full}");
                (full, id, Some(compat))
            }
            None => {
                let id = match instance_id {
                    InstanceId::Auto => self.next_instance_id(idstr),
                    InstanceId::Exact(id) => id,
                };
                (idstr.to_string(), id, None)
            }
        }
    }

    fn insert(
        &mut self,
        idstr: String,
        instance_id: u32,
        alias_id: Option<u32>,
        version_id: u32,
        compat: Option<CompatEntry>,
        body: SectionBody,
    ) -> u32 {
        let section_id = self.next_section_id;
        self.next_section_id += 1;
        debug!(%idstr, instance_id, section_id, "registering state section");
        self.entries.push(SectionEntry {
            section_id,
            idstr,
            instance_id,
            alias_id,
            version_id,
            compat,
            body,
        });
        section_id
    }

    /// Register an iteratively-savable section; returns its section id.
    pub fn register_live(
        &mut self,
        dev_path: Option<&str>,
        idstr: &str,
        instance_id: InstanceId,
        version_id: u32,
        ops: Box<dyn LiveOps>,
    ) -> u32 {
        let (idstr, instance_id, compat) = self.resolve_identity(dev_path, idstr, instance_id);
        self.insert(
            idstr,
            instance_id,
            None,
            version_id,
            compat,
            SectionBody::Live(ops),
        )
    }

    /// Register an old-style save/load pair.
    pub fn register_device(
        &mut self,
        dev_path: Option<&str>,
        idstr: &str,
        instance_id: InstanceId,
        version_id: u32,
        ops: Box<dyn DeviceOps>,
    ) -> u32 {
        let (idstr, instance_id, compat) = self.resolve_identity(dev_path, idstr, instance_id);
        self.insert(
            idstr,
            instance_id,
            None,
            version_id,
            compat,
            SectionBody::Plain(ops),
        )
    }

    /// Register a descriptor-driven section, optionally reachable under an
    /// alias instance id for streams produced before a renumbering.
    pub fn register_with_alias(
        &mut self,
        dev_path: Option<&str>,
        instance_id: InstanceId,
        desc: StateDescriptor,
        ops: Box<dyn DeviceOps>,
        alias_id: Option<u32>,
        required_for_version: u32,
    ) -> anyhow::Result<u32> {
        // If this triggers, alias support can be dropped for the descriptor.
        anyhow::ensure!(
            alias_id.is_none() || required_for_version >= desc.minimum_version_id,
            "alias id for '{}' outlived every version that needs it",
            desc.name
        );
        let version_id = desc.version_id;
        let (idstr, instance_id, compat) =
            self.resolve_identity(dev_path, &desc.name, instance_id);
        Ok(self.insert(
            idstr,
            instance_id,
            alias_id,
            version_id,
            compat,
            SectionBody::Described { desc, ops },
        ))
    }

    /// Remove every section registered under `idstr` for `dev_path`.
    pub fn unregister(&mut self, dev_path: Option<&str>, idstr: &str) {
        let full = match dev_path {
            Some(path) => format!("{path}/{idstr}"),
            None => idstr.to_string(),
        };
        self.entries.retain(|e| e.idstr != full);
    }

    pub fn unregister_section(&mut self, section_id: u32) {
        self.entries.retain(|e| e.section_id != section_id);
    }

    /// Find the entry an incoming `(idstr, instance_id)` header refers to.
    pub fn find(&self, idstr: &str, instance_id: u32) -> Option<usize> {
        for (i, e) in self.entries.iter().enumerate() {
            if e.idstr == idstr
                && (instance_id == e.instance_id || Some(instance_id) == e.alias_id)
            {
                return Some(i);
            }
            // Migrating from an older producer?
            if let Some(compat) = &e.compat {
                if e.idstr.contains(idstr)
                    && compat.idstr == idstr
                    && (instance_id == compat.instance_id || Some(instance_id) == e.alias_id)
                {
                    return Some(i);
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SectionEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SectionEntry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectionEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SectionEntry> {
        self.entries.iter_mut()
    }

    /// Why a migration cannot run right now, if any section forbids it.
    pub fn blocked_reason(&self) -> Option<String> {
        self.entries.iter().find_map(|e| {
            e.body.descriptor().and_then(|d| {
                d.unmigratable
                    .then(|| format!("state blocked by non-migratable device '{}'", e.idstr))
            })
        })
    }

    /// JSON dump of the descriptor-driven sections, for offline stream
    /// compatibility checks.
    pub fn descriptor_index(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .entries
            .iter()
            .filter_map(|e| {
                e.body.descriptor().map(|d| {
                    json!({
                        "name": d.name,
                        "idstr": e.idstr,
                        "instance_id": e.instance_id,
                        "version_id": d.version_id,
                        "minimum_version_id": d.minimum_version_id,
                    })
                })
            })
            .collect();
        json!({ "descriptors": entries })
    }
}

static GLOBAL: OnceLock<Mutex<SectionRegistry>> = OnceLock::new();

/// Run `f` against the process-wide registry, creating it on first use.
/// Tests should build their own [`SectionRegistry`] instead.
pub fn with_global<R>(f: impl FnOnce(&mut SectionRegistry) -> R) -> R {
    let reg = GLOBAL.get_or_init(|| Mutex::new(SectionRegistry::new()));
    #[allow(clippy::unwrap_used)]
    let mut guard = reg.lock().unwrap();
    f(&mut guard)
}
