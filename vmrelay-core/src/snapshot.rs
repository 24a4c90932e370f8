// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The operator surface: whole-VM snapshots persisted through the block
//! layer. The serialized stream is stored as a single blob named by the
//! snapshot; only the image physically holding the blob records its size.

use crate::config::MigrationParams;
use crate::driver::{self, IncomingEnv, IncomingState};
use crate::registry::SectionRegistry;
use crate::vm::VmController;
use anyhow::{bail, Context};
use chrono::Local;
use tracing::{info, warn};
use vmrelay_wire::WireStream;

/// Snapshot metadata as kept by the block layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    /// Bytes of serialized VM state; zero on every image except the one
    /// holding the blob.
    pub vm_state_size: u64,
    pub date_sec: i64,
    pub date_nsec: u32,
}

/// The block snapshot layer, per image.
pub trait SnapshotStore: Send + Sync {
    fn images(&self) -> Vec<String>;
    fn can_snapshot(&self, image: &str) -> bool;
    fn is_writable(&self, image: &str) -> bool;
    fn find(&self, image: &str, name: &str) -> Option<SnapshotInfo>;
    fn create(&self, image: &str, info: &SnapshotInfo) -> anyhow::Result<()>;
    fn delete(&self, image: &str, name: &str) -> anyhow::Result<()>;
    fn list(&self, image: &str) -> Vec<SnapshotInfo>;
    /// Activate the named snapshot's disk state on `image`.
    fn goto(&self, image: &str, name: &str) -> anyhow::Result<()>;
    /// Flush outstanding I/O before switching disk state.
    fn drain(&self) {}
    fn vmstate_writer(&self, image: &str) -> anyhow::Result<WireStream>;
    fn vmstate_reader(&self, image: &str) -> anyhow::Result<WireStream>;
}

fn vmstate_image(store: &dyn SnapshotStore) -> anyhow::Result<String> {
    store
        .images()
        .into_iter()
        .find(|i| store.can_snapshot(i))
        .context("no block device can accept snapshots")
}

fn check_all_writable_can_snapshot(store: &dyn SnapshotStore) -> anyhow::Result<()> {
    for image in store.images() {
        if store.is_writable(&image) && !store.can_snapshot(&image) {
            bail!("device '{image}' is writable but does not support snapshots");
        }
    }
    Ok(())
}

/// Serialize the whole VM and create a snapshot of the same name on every
/// capable image. Returns the snapshot metadata that was stored.
pub fn save_snapshot(
    reg: &mut SectionRegistry,
    store: &dyn SnapshotStore,
    vm: &dyn VmController,
    name: Option<&str>,
) -> anyhow::Result<SnapshotInfo> {
    check_all_writable_can_snapshot(store)?;
    let holder = vmstate_image(store)?;

    let was_running = vm.is_running();
    vm.stop()?;
    let result = save_snapshot_stopped(reg, store, vm, name, &holder);
    if was_running {
        vm.start()?;
    }
    result
}

fn save_snapshot_stopped(
    reg: &mut SectionRegistry,
    store: &dyn SnapshotStore,
    vm: &dyn VmController,
    name: Option<&str>,
    holder: &str,
) -> anyhow::Result<SnapshotInfo> {
    let now = Local::now();
    let mut info = SnapshotInfo {
        name: match name {
            Some(n) => n.to_string(),
            None => now.format("vm-%Y%m%d%H%M%S").to_string(),
        },
        vm_state_size: 0,
        date_sec: now.timestamp(),
        date_nsec: now.timestamp_subsec_nanos(),
    };

    // Delete old snapshots of the same name before writing new ones.
    if name.is_some() {
        for image in store.images() {
            if store.can_snapshot(&image) && store.find(&image, &info.name).is_some() {
                store
                    .delete(&image, &info.name)
                    .with_context(|| format!("deleting old snapshot on '{image}'"))?;
            }
        }
    }

    let mut f = store.vmstate_writer(holder)?;
    vm.sync_cpu_state();
    driver::save_full_state(reg, &mut f, &MigrationParams::default())?;
    f.flush()?;
    let vm_state_size = f.total_written();

    for image in store.images() {
        if !store.can_snapshot(&image) {
            continue;
        }
        // Only the image that physically holds the blob records its size.
        info.vm_state_size = if image == holder { vm_state_size } else { 0 };
        if let Err(e) = store.create(&image, &info) {
            warn!("error while creating snapshot on '{image}': {e:#}");
        }
    }
    info.vm_state_size = vm_state_size;
    info!(name = %info.name, vm_state_size, "snapshot saved");
    Ok(info)
}

/// Activate a named snapshot on every image and load the VM state from its
/// blob. The guest is left stopped; starting it is the caller's decision.
pub fn load_snapshot(
    reg: &mut SectionRegistry,
    store: &dyn SnapshotStore,
    env: &IncomingEnv,
    name: &str,
) -> anyhow::Result<()> {
    let holder = vmstate_image(store)?;
    let sn = store
        .find(&holder, name)
        .with_context(|| format!("no snapshot named '{name}'"))?;
    if sn.vm_state_size == 0 {
        bail!("'{name}' is a disk-only snapshot; revert to it offline");
    }

    for image in store.images() {
        if !store.is_writable(&image) {
            continue;
        }
        if !store.can_snapshot(&image) {
            bail!("device '{image}' is writable but does not support snapshots");
        }
        if store.find(&image, name).is_none() {
            bail!("device '{image}' does not have the requested snapshot '{name}'");
        }
    }

    // Flush all I/O so nothing interferes with the reverted disk state.
    store.drain();
    for image in store.images() {
        if store.can_snapshot(&image) {
            store
                .goto(&image, name)
                .with_context(|| format!("activating snapshot '{name}' on '{image}'"))?;
        }
    }

    env.vm.reset_silent()?;
    let f = store.vmstate_reader(&holder)?;
    let mut incoming = IncomingState::new(f, env.clone());
    incoming
        .load_state(reg)
        .with_context(|| format!("error while loading snapshot '{name}'"))?;
    Ok(())
}

/// Drop a named snapshot from every capable image.
pub fn delete_snapshot(store: &dyn SnapshotStore, name: &str) -> anyhow::Result<()> {
    vmstate_image(store)?;
    for image in store.images() {
        if store.can_snapshot(&image) {
            if let Err(e) = store.delete(&image, name) {
                warn!("error while deleting snapshot on '{image}': {e:#}");
            }
        }
    }
    Ok(())
}

/// Snapshots usable for a full revert: present on every capable image.
pub fn list_snapshots(store: &dyn SnapshotStore) -> anyhow::Result<Vec<SnapshotInfo>> {
    let holder = vmstate_image(store)?;
    let candidates = store.list(&holder);
    let images: Vec<String> = store
        .images()
        .into_iter()
        .filter(|i| *i != holder && store.can_snapshot(i))
        .collect();
    Ok(candidates
        .into_iter()
        .filter(|sn| images.iter().all(|i| store.find(i, &sn.name).is_some()))
        .collect())
}
