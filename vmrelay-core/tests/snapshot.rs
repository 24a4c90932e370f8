// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The savevm/loadvm/delvm/info-snapshots surface over an in-memory block
//! snapshot store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use vmrelay_core::driver::IncomingEnv;
use vmrelay_core::ram::RamLayout;
use vmrelay_core::registry::{InstanceId, SectionRegistry};
use vmrelay_core::section::DeviceOps;
use vmrelay_core::snapshot::{
    delete_snapshot, list_snapshots, load_snapshot, save_snapshot, SnapshotInfo, SnapshotStore,
};
use vmrelay_core::vm::{ColoMode, EventSink, ExitReason, VmController};
use vmrelay_core::MigrationConfig;
use vmrelay_sys::testing::TestMemory;
use vmrelay_wire::{SizedBuffer, WireStream};

struct Image {
    writable: bool,
    snapshotable: bool,
}

struct MemStore {
    images: Vec<(String, Image)>,
    snapshots: Mutex<HashMap<(String, String), SnapshotInfo>>,
    blobs: Mutex<HashMap<String, SizedBuffer>>,
}

impl MemStore {
    fn new(images: Vec<(&str, bool, bool)>) -> Self {
        MemStore {
            images: images
                .into_iter()
                .map(|(name, writable, snapshotable)| {
                    (
                        name.to_string(),
                        Image {
                            writable,
                            snapshotable,
                        },
                    )
                })
                .collect(),
            snapshots: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    fn image(&self, name: &str) -> Option<&Image> {
        self.images.iter().find(|(n, _)| n == name).map(|(_, i)| i)
    }
}

impl SnapshotStore for MemStore {
    fn images(&self) -> Vec<String> {
        self.images.iter().map(|(n, _)| n.clone()).collect()
    }

    fn can_snapshot(&self, image: &str) -> bool {
        self.image(image).is_some_and(|i| i.snapshotable)
    }

    fn is_writable(&self, image: &str) -> bool {
        self.image(image).is_some_and(|i| i.writable)
    }

    fn find(&self, image: &str, name: &str) -> Option<SnapshotInfo> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&(image.to_string(), name.to_string()))
            .cloned()
    }

    fn create(&self, image: &str, info: &SnapshotInfo) -> anyhow::Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert((image.to_string(), info.name.clone()), info.clone());
        Ok(())
    }

    fn delete(&self, image: &str, name: &str) -> anyhow::Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .remove(&(image.to_string(), name.to_string()));
        Ok(())
    }

    fn list(&self, image: &str) -> Vec<SnapshotInfo> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|((i, _), _)| i == image)
            .map(|(_, sn)| sn.clone())
            .collect()
    }

    fn goto(&self, _image: &str, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn vmstate_writer(&self, image: &str) -> anyhow::Result<WireStream> {
        let buf = SizedBuffer::new();
        self.blobs
            .lock()
            .unwrap()
            .insert(image.to_string(), buf.clone());
        Ok(buf.writer())
    }

    fn vmstate_reader(&self, image: &str) -> anyhow::Result<WireStream> {
        let buf = self
            .blobs
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no vmstate blob on '{image}'"))?;
        Ok(buf.reader())
    }
}

struct MockVm {
    running: AtomicBool,
    resets: AtomicU32,
}

impl MockVm {
    fn new(running: bool) -> Arc<Self> {
        Arc::new(MockVm {
            running: AtomicBool::new(running),
            resets: AtomicU32::new(0),
        })
    }
}

impl VmController for MockVm {
    fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, SeqCst);
        Ok(())
    }

    fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, SeqCst);
        Ok(())
    }

    fn reset_silent(&self) -> anyhow::Result<()> {
        self.resets.fetch_add(1, SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(SeqCst)
    }
}

struct NullEvents;

impl EventSink for NullEvents {
    fn colo_exit(&self, _mode: ColoMode, _reason: ExitReason) {}
}

struct Nvram {
    contents: Vec<u8>,
    loaded: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Nvram {
    fn pair(contents: &[u8]) -> (Box<Self>, Arc<Mutex<Option<Vec<u8>>>>) {
        let loaded = Arc::new(Mutex::new(None));
        (
            Box::new(Nvram {
                contents: contents.to_vec(),
                loaded: loaded.clone(),
            }),
            loaded,
        )
    }
}

impl DeviceOps for Nvram {
    fn save(&mut self, f: &mut WireStream) -> anyhow::Result<()> {
        f.put_u32(self.contents.len() as u32)?;
        f.put_buffer(&self.contents)?;
        Ok(())
    }

    fn load(&mut self, f: &mut WireStream, _version_id: u32) -> anyhow::Result<()> {
        let len = f.get_u32()? as usize;
        let mut buf = vec![0u8; len];
        f.get_buffer(&mut buf)?;
        *self.loaded.lock().unwrap() = Some(buf);
        Ok(())
    }
}

fn env(vm: Arc<dyn VmController>) -> IncomingEnv {
    IncomingEnv {
        config: MigrationConfig::default(),
        layout: RamLayout::new(),
        memory: Arc::new(TestMemory::new(4096)),
        vm,
        events: Arc::new(NullEvents),
    }
}

#[test]
fn snapshot_roundtrip_restores_device_state() {
    let store = MemStore::new(vec![("disk0", true, true), ("disk1", false, true)]);
    let vm = MockVm::new(true);

    let mut reg = SectionRegistry::new();
    let (dev, _) = Nvram::pair(b"boot-order=cd");
    reg.register_device(None, "nvram", InstanceId::Auto, 1, dev);

    let info = save_snapshot(&mut reg, &store, vm.as_ref(), Some("before-upgrade")).unwrap();
    assert!(info.vm_state_size > 0);
    // Saving restored the running guest.
    assert!(vm.is_running());
    // The size is recorded only on the image holding the blob.
    assert_eq!(
        store.find("disk0", "before-upgrade").unwrap().vm_state_size,
        info.vm_state_size
    );
    assert_eq!(store.find("disk1", "before-upgrade").unwrap().vm_state_size, 0);

    let mut reg2 = SectionRegistry::new();
    let (dev, loaded) = Nvram::pair(b"");
    reg2.register_device(None, "nvram", InstanceId::Auto, 1, dev);
    let vm2 = MockVm::new(false);
    load_snapshot(&mut reg2, &store, &env(vm2.clone()), "before-upgrade").unwrap();
    assert_eq!(loaded.lock().unwrap().clone(), Some(b"boot-order=cd".to_vec()));
    assert_eq!(vm2.resets.load(SeqCst), 1);
    // Loading leaves the guest stopped for the caller to start.
    assert!(!vm2.is_running());
}

#[test]
fn save_overwrites_snapshots_of_the_same_name() {
    let store = MemStore::new(vec![("disk0", true, true)]);
    let vm = MockVm::new(false);
    let mut reg = SectionRegistry::new();
    let (dev, _) = Nvram::pair(b"v1");
    reg.register_device(None, "nvram", InstanceId::Auto, 1, dev);
    save_snapshot(&mut reg, &store, vm.as_ref(), Some("snap")).unwrap();
    let first = store.find("disk0", "snap").unwrap();
    save_snapshot(&mut reg, &store, vm.as_ref(), Some("snap")).unwrap();
    // Still exactly one snapshot of that name.
    assert_eq!(store.list("disk0").len(), 1);
    let second = store.find("disk0", "snap").unwrap();
    assert!(second.date_sec >= first.date_sec);
}

#[test]
fn writable_image_without_snapshot_support_refuses_save() {
    let store = MemStore::new(vec![("disk0", true, true), ("raw0", true, false)]);
    let vm = MockVm::new(false);
    let mut reg = SectionRegistry::new();
    let err = save_snapshot(&mut reg, &store, vm.as_ref(), Some("x")).unwrap_err();
    assert!(err.to_string().contains("does not support snapshots"));
}

#[test]
fn disk_only_snapshot_refuses_load() {
    let store = MemStore::new(vec![("disk0", true, true)]);
    store
        .create(
            "disk0",
            &SnapshotInfo {
                name: "diskonly".into(),
                vm_state_size: 0,
                date_sec: 0,
                date_nsec: 0,
            },
        )
        .unwrap();
    let vm = MockVm::new(false);
    let mut reg = SectionRegistry::new();
    let err = load_snapshot(&mut reg, &store, &env(vm), "diskonly").unwrap_err();
    assert!(err.to_string().contains("disk-only"));
}

#[test]
fn list_requires_presence_on_every_capable_image() {
    let store = MemStore::new(vec![("disk0", true, true), ("disk1", false, true)]);
    let everywhere = SnapshotInfo {
        name: "aligned".into(),
        vm_state_size: 1,
        date_sec: 0,
        date_nsec: 0,
    };
    store.create("disk0", &everywhere).unwrap();
    store.create("disk1", &everywhere).unwrap();
    let partial = SnapshotInfo {
        name: "half".into(),
        vm_state_size: 1,
        date_sec: 0,
        date_nsec: 0,
    };
    store.create("disk0", &partial).unwrap();

    let names: HashSet<String> = list_snapshots(&store)
        .unwrap()
        .into_iter()
        .map(|sn| sn.name)
        .collect();
    assert_eq!(names, HashSet::from(["aligned".to_string()]));

    delete_snapshot(&store, "aligned").unwrap();
    assert!(list_snapshots(&store).unwrap().is_empty());
}
