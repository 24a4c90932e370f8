// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end COLO: a primary and a secondary engine joined by a socket
//! pair, with mock collaborators standing in for the VM, block and NIC
//! layers.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use vmrelay_core::colo::failover::FailoverStatus;
use vmrelay_core::colo::{ColoContext, ColoPrimary, ColoSecondary};
use vmrelay_core::command::{expect_command, send_colo, send_colo_value};
use vmrelay_core::driver::{self, IncomingEnv, IncomingState};
use vmrelay_core::protocol::{Command, FILE_MAGIC, FILE_VERSION};
use vmrelay_core::ram::RamLayout;
use vmrelay_core::registry::{InstanceId, SectionRegistry};
use vmrelay_core::section::{DeviceOps, IterateStatus, LiveOps};
use vmrelay_core::vm::{
    BlockReplication, ColoMode, EventSink, ExitReason, PacketBuffering, RamCache, ReplicationMode,
    VmController,
};
use vmrelay_core::{MigrationConfig, MigrationStatus, SharedStatus};
use vmrelay_sys::testing::TestMemory;
use vmrelay_wire::{SizedBuffer, WireStream};

struct MockVm {
    running: AtomicBool,
    autostart: AtomicBool,
    starts: AtomicU32,
    resets: AtomicU32,
    shutdowns: AtomicU32,
}

impl MockVm {
    fn new(autostart: bool) -> Arc<Self> {
        Arc::new(MockVm {
            running: AtomicBool::new(false),
            autostart: AtomicBool::new(autostart),
            starts: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
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
        self.starts.fetch_add(1, SeqCst);
        Ok(())
    }

    fn reset_silent(&self) -> anyhow::Result<()> {
        self.resets.fetch_add(1, SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(SeqCst)
    }

    fn request_shutdown(&self) {
        self.shutdowns.fetch_add(1, SeqCst);
    }

    fn autostart(&self) -> bool {
        self.autostart.load(SeqCst)
    }

    fn set_autostart(&self, on: bool) {
        self.autostart.store(on, SeqCst);
    }
}

#[derive(Default)]
struct MockBlocks {
    started: Mutex<Vec<ReplicationMode>>,
    checkpoints: AtomicU32,
    stops: Mutex<Vec<bool>>,
}

impl BlockReplication for MockBlocks {
    fn start_replication(&self, mode: ReplicationMode) -> anyhow::Result<()> {
        self.started.lock().unwrap().push(mode);
        Ok(())
    }

    fn stop_replication(&self, failover: bool) -> anyhow::Result<()> {
        self.stops.lock().unwrap().push(failover);
        Ok(())
    }

    fn checkpoint(&self) -> anyhow::Result<()> {
        self.checkpoints.fetch_add(1, SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockNet {
    buffering: AtomicBool,
    releases: AtomicU32,
}

impl PacketBuffering for MockNet {
    fn set_buffering(&self, enabled: bool) -> anyhow::Result<()> {
        self.buffering.store(enabled, SeqCst);
        Ok(())
    }

    fn release_buffered(&self) {
        self.releases.fetch_add(1, SeqCst);
    }
}

#[derive(Default)]
struct MockCache {
    inits: AtomicU32,
    flushes: AtomicU32,
    releases: AtomicU32,
}

impl RamCache for MockCache {
    fn init(&self) -> anyhow::Result<()> {
        self.inits.fetch_add(1, SeqCst);
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.flushes.fetch_add(1, SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, SeqCst);
    }
}

/// RAM cache whose flush parks until the test lets it continue, so a
/// failover can be fired deterministically mid-load.
struct GateCache {
    entered_tx: mpsc::Sender<()>,
    go_rx: Mutex<mpsc::Receiver<()>>,
}

impl GateCache {
    fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel();
        (
            Arc::new(GateCache {
                entered_tx,
                go_rx: Mutex::new(go_rx),
            }),
            entered_rx,
            go_tx,
        )
    }
}

impl RamCache for GateCache {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        let _ = self.entered_tx.send(());
        let _ = self.go_rx.lock().unwrap().recv();
        Ok(())
    }

    fn release(&self) {}
}

#[derive(Default)]
struct RecordingEvents {
    exits: Mutex<Vec<(ColoMode, ExitReason)>>,
}

impl EventSink for RecordingEvents {
    fn colo_exit(&self, mode: ColoMode, reason: ExitReason) {
        self.exits.lock().unwrap().push((mode, reason));
    }
}

/// One-byte-chunk live section, symmetric on save and load.
struct ByteRam;

impl LiveOps for ByteRam {
    fn setup(&mut self, f: &mut WireStream) -> anyhow::Result<()> {
        f.put_u8(0xAA)?;
        Ok(())
    }

    fn iterate(&mut self, f: &mut WireStream) -> anyhow::Result<IterateStatus> {
        f.put_u8(0xAB)?;
        Ok(IterateStatus::Done)
    }

    fn complete(&mut self, f: &mut WireStream) -> anyhow::Result<()> {
        f.put_u8(0xAC)?;
        Ok(())
    }

    fn load(&mut self, f: &mut WireStream, _version_id: u32) -> anyhow::Result<()> {
        f.get_u8()?;
        Ok(())
    }
}

/// Device section that saves an incrementing sequence number and records
/// every value it loads.
struct SeqDevice {
    next: u32,
    loaded: Arc<Mutex<Vec<u32>>>,
}

impl SeqDevice {
    fn pair() -> (Box<Self>, Arc<Mutex<Vec<u32>>>) {
        let loaded = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(SeqDevice {
                next: 1,
                loaded: loaded.clone(),
            }),
            loaded,
        )
    }
}

impl DeviceOps for SeqDevice {
    fn save(&mut self, f: &mut WireStream) -> anyhow::Result<()> {
        f.put_u32(self.next)?;
        self.next += 1;
        Ok(())
    }

    fn load(&mut self, f: &mut WireStream, _version_id: u32) -> anyhow::Result<()> {
        let v = f.get_u32()?;
        self.loaded.lock().unwrap().push(v);
        Ok(())
    }
}

fn colo_registry() -> (SectionRegistry, Arc<Mutex<Vec<u32>>>) {
    let mut reg = SectionRegistry::new();
    reg.register_live(None, "ram", InstanceId::Auto, 1, Box::new(ByteRam));
    let (dev, loaded) = SeqDevice::pair();
    reg.register_device(None, "cpu", InstanceId::Auto, 1, dev);
    (reg, loaded)
}

fn test_env(vm: Arc<dyn VmController>) -> IncomingEnv {
    IncomingEnv {
        config: MigrationConfig::default(),
        layout: RamLayout::new(),
        memory: Arc::new(TestMemory::new(4096)),
        vm,
        events: Arc::new(RecordingEvents::default()),
    }
}

/// Two checkpoint transactions with two packet releases, then a
/// GUEST_SHUTDOWN ends both sides cleanly.
#[test]
fn checkpoint_loop_runs_and_shuts_down() {
    let (sock_p, sock_s) = UnixStream::pair().unwrap();

    let vm_p = MockVm::new(true);
    let blocks_p = Arc::new(MockBlocks::default());
    let net = Arc::new(MockNet::default());
    let events_p = Arc::new(RecordingEvents::default());
    let ctx_p = ColoContext::primary(
        vm_p.clone(),
        blocks_p.clone(),
        net.clone(),
        events_p.clone(),
        SharedStatus::new(MigrationStatus::Active),
    );

    let vm_s = MockVm::new(true);
    let blocks_s = Arc::new(MockBlocks::default());
    let cache = Arc::new(MockCache::default());
    let events_s = Arc::new(RecordingEvents::default());
    let ctx_s = ColoContext::secondary(
        vm_s.clone(),
        blocks_s.clone(),
        cache.clone(),
        events_s.clone(),
        SharedStatus::new(MigrationStatus::Active),
    );

    let (mut reg_p, _) = colo_registry();
    let (mut reg_s, loaded) = colo_registry();

    let primary = {
        let ctx = ctx_p.clone();
        std::thread::spawn(move || {
            let engine = ColoPrimary::new(
                ctx,
                MigrationConfig {
                    checkpoint_delay_ms: 300,
                    ..Default::default()
                },
            );
            let mut f = WireStream::over(sock_p);
            engine.run(&mut reg_p, &mut f)
        })
    };

    let secondary = {
        let ctx = ctx_s.clone();
        let env = test_env(vm_s.clone());
        std::thread::spawn(move || {
            let mut incoming = IncomingState::new(WireStream::over(sock_s), env);
            ColoSecondary::new(ctx).run(&mut reg_s, &mut incoming)
        })
    };

    // After the first transaction's packet release, ask for a coordinated
    // shutdown; the next checkpoint carries it out.
    let deadline = Instant::now() + Duration::from_secs(10);
    while net.releases.load(SeqCst) < 1 {
        assert!(Instant::now() < deadline, "first checkpoint never finished");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(ctx_p.notify_shutdown());

    primary.join().unwrap().unwrap();
    secondary.join().unwrap().unwrap();

    // Exactly one release per completed transaction.
    assert_eq!(net.releases.load(SeqCst), 2);
    // Device state arrived in checkpoint order.
    assert_eq!(loaded.lock().unwrap().clone(), vec![1, 2]);
    // Both sides committed block checkpoints each round.
    assert_eq!(blocks_p.checkpoints.load(SeqCst), 2);
    assert_eq!(blocks_s.checkpoints.load(SeqCst), 2);
    // Replication roles were announced correctly and stopped non-failover.
    assert_eq!(
        blocks_p.started.lock().unwrap().clone(),
        vec![ReplicationMode::Primary]
    );
    assert_eq!(
        blocks_s.started.lock().unwrap().clone(),
        vec![ReplicationMode::Secondary]
    );
    assert_eq!(blocks_p.stops.lock().unwrap().clone(), vec![false]);
    assert_eq!(blocks_s.stops.lock().unwrap().clone(), vec![false]);
    // The guest resumed after the non-final transaction only; the secondary
    // reset once per checkpoint.
    assert_eq!(vm_s.resets.load(SeqCst), 2);
    assert_eq!(vm_p.shutdowns.load(SeqCst), 1);
    assert_eq!(vm_s.shutdowns.load(SeqCst), 1);
    // Clean coordinated shutdown emits no COLO exit events.
    assert!(events_p.exits.lock().unwrap().is_empty());
    assert!(events_s.exits.lock().unwrap().is_empty());
}

/// A failover armed while `vmstate_loading` defers to RELAUNCH; the load
/// path observes it, re-arms, and exits the loop.
#[test]
fn secondary_failover_mid_load_relaunches() {
    let (sock_s, sock_src) = UnixStream::pair().unwrap();

    let vm_s = MockVm::new(false);
    let blocks_s = Arc::new(MockBlocks::default());
    let (cache, entered_rx, go_tx) = GateCache::new();
    let events_s = Arc::new(RecordingEvents::default());
    let ctx_s = ColoContext::secondary(
        vm_s.clone(),
        blocks_s.clone(),
        cache,
        events_s.clone(),
        SharedStatus::new(MigrationStatus::Active),
    );
    let wake = ctx_s.take_wake_receiver().unwrap();

    let (mut reg_s, loaded) = colo_registry();
    let secondary = {
        let ctx = ctx_s.clone();
        let env = test_env(vm_s.clone());
        std::thread::spawn(move || {
            let mut incoming = IncomingState::new(WireStream::over(sock_s), env);
            ColoSecondary::new(ctx).run(&mut reg_s, &mut incoming)
        })
    };

    // Scripted primary: header, one transaction up to the device blob.
    let mut f = WireStream::over(sock_src);
    let mut rp = f.return_path().unwrap().unwrap();
    f.put_u32(FILE_MAGIC).unwrap();
    f.put_u32(FILE_VERSION).unwrap();
    f.flush().unwrap();

    expect_command(&mut rp, Command::ColoCheckpointReady).unwrap();
    send_colo(&mut f, Command::ColoCheckpointRequest).unwrap();
    send_colo(&mut f, Command::ColoVmstateSend).unwrap();
    // Empty live burst: just the EOF terminator.
    f.put_u8(0x05).unwrap();
    f.flush().unwrap();

    let (mut reg_src, _) = colo_registry();
    let blob = SizedBuffer::new();
    driver::save_device_state(&mut reg_src, &mut blob.writer()).unwrap();
    send_colo_value(&mut f, Command::ColoVmstateSize, blob.len() as u64).unwrap();
    blob.drain_to(&mut f, blob.len()).unwrap();
    f.flush().unwrap();

    expect_command(&mut rp, Command::ColoVmstateReceived).unwrap();

    // The secondary is now inside the gated cache flush: vmstate_loading.
    entered_rx.recv().unwrap();
    ctx_s.request_failover();
    assert_eq!(ctx_s.failover_state(), FailoverStatus::Relaunch);
    // Repeated requests while deferred stay no-ops.
    ctx_s.request_failover();
    assert_eq!(ctx_s.failover_state(), FailoverStatus::Relaunch);
    go_tx.send(()).unwrap();

    let err = secondary.join().unwrap().unwrap_err();
    assert!(format!("{err:#}").contains("failover request"));

    // The deferred failover re-armed and completed after the load.
    assert_eq!(ctx_s.failover_state(), FailoverStatus::Completed);
    // Device state was fully loaded before failing over.
    assert_eq!(loaded.lock().unwrap().clone(), vec![1]);
    // The secondary becomes the authoritative side: autostart forced on,
    // replication stopped in failover mode, incoming task woken.
    assert!(vm_s.autostart.load(SeqCst));
    assert_eq!(blocks_s.stops.lock().unwrap().clone(), vec![true]);
    wake.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        events_s.exits.lock().unwrap().clone(),
        vec![(ColoMode::Secondary, ExitReason::Request)]
    );
    // VMSTATE_LOADED was never sent.
    assert_eq!(ctx_s.status().get(), MigrationStatus::Completed);
}

#[test]
fn failover_is_idempotent_after_completion() {
    let vm = MockVm::new(true);
    let blocks = Arc::new(MockBlocks::default());
    let net = Arc::new(MockNet::default());
    let events = Arc::new(RecordingEvents::default());
    let ctx = ColoContext::primary(
        vm,
        blocks.clone(),
        net.clone(),
        events,
        SharedStatus::new(MigrationStatus::Colo),
    );

    ctx.request_failover();
    assert_eq!(ctx.failover_state(), FailoverStatus::Completed);
    ctx.request_failover();
    ctx.request_failover();
    // Only the first request did the work.
    assert_eq!(blocks.stops.lock().unwrap().clone(), vec![true]);
    assert_eq!(net.releases.load(SeqCst), 1);
    assert_eq!(ctx.status().get(), MigrationStatus::Completed);
}
