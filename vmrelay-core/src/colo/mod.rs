// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! COLO: coarse-grained lock-stepping of a primary and a secondary VM.
//!
//! Both sides execute; at every checkpoint the primary stops, replays its
//! state onto the secondary, and only then lets buffered guest output out.
//! If the primary is lost, the secondary takes over from the last agreed
//! checkpoint via the failover machinery.

pub mod failover;

use crate::command::{self, expect_command, expect_value_command, read_command_header};
use crate::config::MigrationConfig;
use crate::driver::{self, IncomingState};
use crate::protocol::{Command, SectionType};
use crate::registry::SectionRegistry;
use crate::state::{MigrationStatus, SharedStatus};
use crate::vm::{
    BlockReplication, ColoMode, EventSink, ExitReason, PacketBuffering, RamCache, ReplicationMode,
    VmController,
};
use crate::MutexExt;
use anyhow::{bail, ensure, Context};
use failover::{FailoverState, FailoverStatus};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use vmrelay_wire::{ShutdownHandle, SizedBuffer, WireStream};

/// Counting semaphore; the failover routine posts it so the checkpoint
/// thread knows teardown may proceed.
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn post(&self) {
        *self.count.lock_or_panic() += 1;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock_or_panic();
        while *count == 0 {
            #[allow(clippy::unwrap_used)]
            {
                count = self.cv.wait(count).unwrap();
            }
        }
        *count -= 1;
    }
}

/// State shared between a COLO engine thread and whoever may request a
/// failover (heartbeat monitor, operator).
pub struct ColoContext {
    mode: ColoMode,
    failover: FailoverState,
    vmstate_loading: AtomicBool,
    shutdown_requested: AtomicBool,
    sem: Semaphore,
    vm: Arc<dyn VmController>,
    blocks: Arc<dyn BlockReplication>,
    net: Option<Arc<dyn PacketBuffering>>,
    cache: Option<Arc<dyn RamCache>>,
    events: Arc<dyn EventSink>,
    status: SharedStatus,
    shutdown_handles: Mutex<Vec<ShutdownHandle>>,
    wake_incoming_tx: Mutex<Option<Sender<()>>>,
    wake_incoming_rx: Mutex<Option<Receiver<()>>>,
}

impl ColoContext {
    pub fn primary(
        vm: Arc<dyn VmController>,
        blocks: Arc<dyn BlockReplication>,
        net: Arc<dyn PacketBuffering>,
        events: Arc<dyn EventSink>,
        status: SharedStatus,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            ColoMode::Primary,
            vm,
            blocks,
            Some(net),
            None,
            events,
            status,
        ))
    }

    pub fn secondary(
        vm: Arc<dyn VmController>,
        blocks: Arc<dyn BlockReplication>,
        cache: Arc<dyn RamCache>,
        events: Arc<dyn EventSink>,
        status: SharedStatus,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            ColoMode::Secondary,
            vm,
            blocks,
            None,
            Some(cache),
            events,
            status,
        ))
    }

    fn new(
        mode: ColoMode,
        vm: Arc<dyn VmController>,
        blocks: Arc<dyn BlockReplication>,
        net: Option<Arc<dyn PacketBuffering>>,
        cache: Option<Arc<dyn RamCache>>,
        events: Arc<dyn EventSink>,
        status: SharedStatus,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        ColoContext {
            mode,
            failover: FailoverState::new(),
            vmstate_loading: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            sem: Semaphore::new(),
            vm,
            blocks,
            net,
            cache,
            events,
            status,
            shutdown_handles: Mutex::new(Vec::new()),
            wake_incoming_tx: Mutex::new(Some(tx)),
            wake_incoming_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn mode(&self) -> ColoMode {
        self.mode
    }

    pub fn status(&self) -> &SharedStatus {
        &self.status
    }

    pub fn failover_state(&self) -> FailoverStatus {
        self.failover.get()
    }

    pub fn failover_active(&self) -> bool {
        self.failover.active()
    }

    /// The secondary's incoming task parks on this; failover signals it.
    pub fn take_wake_receiver(&self) -> Option<Receiver<()>> {
        self.wake_incoming_rx.lock_or_panic().take()
    }

    /// Route a host shutdown request through COLO. Returns true when COLO
    /// claims responsibility for coordinating it.
    pub fn notify_shutdown(&self) -> bool {
        if self.status.get() != MigrationStatus::Colo {
            return false;
        }
        if self.mode == ColoMode::Primary {
            self.shutdown_requested.store(true, SeqCst);
        }
        true
    }

    pub(crate) fn add_shutdown_handle(&self, handle: Option<ShutdownHandle>) {
        if let Some(handle) = handle {
            self.shutdown_handles.lock_or_panic().push(handle);
        }
    }

    /// Force both stream directions down so blocked I/O unwinds. The two
    /// handles may share one descriptor; the second shutdown is harmless.
    fn shutdown_streams(&self) {
        for handle in self.shutdown_handles.lock_or_panic().iter() {
            if let Err(e) = handle.shutdown() {
                warn!("stream shutdown during failover: {e}");
            }
        }
    }

    pub(crate) fn set_vmstate_loading(&self, loading: bool) {
        self.vmstate_loading.store(loading, SeqCst);
    }

    /// Take over (or defer, when the secondary is mid-load). Idempotent:
    /// only the request that moves `None → Handling` does any work.
    pub fn request_failover(&self) {
        if self.failover.set_state(FailoverStatus::None, FailoverStatus::Handling)
            != FailoverStatus::None
        {
            debug!("failover already underway");
            return;
        }
        // Make sure the VM is stopped while we fail over.
        if self.vm.is_running() {
            if let Err(e) = self.vm.stop() {
                warn!("stopping VM for failover: {e}");
            }
        }
        match self.mode {
            ColoMode::Primary => self.primary_failover(),
            ColoMode::Secondary => self.secondary_failover(),
        }
    }

    fn primary_failover(&self) {
        self.status
            .transition(MigrationStatus::Colo, MigrationStatus::Completed);
        self.shutdown_streams();
        let old = self
            .failover
            .set_state(FailoverStatus::Handling, FailoverStatus::Completed);
        if old != FailoverStatus::Handling {
            error!("incorrect failover state {old:?} while failing over the primary");
            return;
        }
        if let Some(net) = &self.net {
            // Don't buffer any packets now that COLO is over.
            if let Err(e) = net.set_buffering(false) {
                warn!("disabling packet buffering: {e}");
            }
            net.release_buffered();
        }
        if let Err(e) = self.blocks.stop_replication(true) {
            warn!("stopping block replication: {e}");
        }
        info!("primary failover complete");
        self.sem.post();
    }

    fn secondary_failover(&self) {
        // Failing over while the VM state is half-loaded would break the
        // guest; leave a marker for the load path to act on instead.
        if self.vmstate_loading.load(SeqCst) {
            let old = self
                .failover
                .set_state(FailoverStatus::Handling, FailoverStatus::Relaunch);
            if old != FailoverStatus::Handling {
                error!("unexpected failover state {old:?} while deferring secondary failover");
            }
            return;
        }

        self.status
            .transition(MigrationStatus::Colo, MigrationStatus::Completed);
        if let Err(e) = self.blocks.stop_replication(true) {
            warn!("stopping block replication: {e}");
        }
        if !self.vm.autostart() {
            warn!("autostart=off is ignored on the secondary side");
            self.vm.set_autostart(true);
        }
        self.shutdown_streams();
        let old = self
            .failover
            .set_state(FailoverStatus::Handling, FailoverStatus::Completed);
        if old != FailoverStatus::Handling {
            error!("incorrect failover state {old:?} while failing over the secondary");
            return;
        }
        info!("secondary failover complete");
        self.sem.post();
        // Unpark the incoming task so it can resume as the new primary.
        if let Some(tx) = self.wake_incoming_tx.lock_or_panic().take() {
            let _ = tx.send(());
        }
    }
}

/// The primary-side checkpoint engine.
pub struct ColoPrimary {
    pub ctx: Arc<ColoContext>,
    pub config: MigrationConfig,
}

enum Progress {
    Continue,
    Shutdown,
}

impl ColoPrimary {
    pub fn new(ctx: Arc<ColoContext>, config: MigrationConfig) -> Self {
        ColoPrimary { ctx, config }
    }

    /// Drive checkpoints until failover, error, cancellation or coordinated
    /// shutdown. Blocks; run it on a dedicated thread.
    pub fn run(&self, reg: &mut SectionRegistry, f: &mut WireStream) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        ensure!(
            ctx.status.transition(MigrationStatus::Active, MigrationStatus::Colo),
            "COLO requires an active migration to take over from"
        );

        let result = self.process(reg, f);
        if result.is_ok() {
            // Coordinated shutdown exits the thread right here; resources
            // are freed by drop rather than by the failover path.
            return result;
        }
        let reason = if ctx.failover_active() {
            ExitReason::Request
        } else {
            ExitReason::Error
        };
        if let Err(err) = &result {
            error!("primary checkpoint loop ended: {err:#}");
        }
        ctx.events.colo_exit(ColoMode::Primary, reason);
        if ctx.failover_active() {
            // The failover routine may still be shutting streams down;
            // don't drop them out from under it.
            ctx.sem.wait();
        }
        result
    }

    fn process(&self, reg: &mut SectionRegistry, f: &mut WireStream) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        ctx.add_shutdown_handle(f.shutdown_handle());

        let net = ctx.net.clone().context("primary COLO needs a NIC filter")?;
        ensure!(net.supported(), "netdev stack cannot buffer guest output");
        // Hold guest egress until the secondary has acked a checkpoint.
        net.set_buffering(true)?;

        let mut rp = match f.return_path() {
            Some(rp) => rp.context("opening return path")?,
            None => bail!("COLO transport has no return path"),
        };
        ctx.add_shutdown_handle(rp.shutdown_handle());

        driver::state_begin(reg, f, &Default::default())?;
        if let Some(err) = f.last_error() {
            return Err(err).context("state begin failed");
        }

        // Wait for the secondary to finish loading and enter COLO restore.
        expect_command(&mut rp, Command::ColoCheckpointReady)?;

        let buffer = SizedBuffer::new();
        ctx.blocks.start_replication(ReplicationMode::Primary)?;
        ctx.vm.start()?;
        info!("COLO primary entered checkpoint loop");

        let mut last_checkpoint = Instant::now();
        while ctx.status.get() == MigrationStatus::Colo {
            ensure!(!ctx.failover_active(), "failover request");
            self.wait_for_next_checkpoint(last_checkpoint);
            match self.transaction(reg, f, &mut rp, &buffer, &net)? {
                Progress::Continue => {}
                Progress::Shutdown => return Ok(()),
            }
            last_checkpoint = Instant::now();
        }
        bail!("migration left COLO state");
    }

    /// Sleep out the checkpoint interval, cutting it short for shutdown or
    /// failover requests.
    fn wait_for_next_checkpoint(&self, last: Instant) {
        let period = Duration::from_millis(self.config.checkpoint_delay_ms);
        loop {
            let elapsed = last.elapsed();
            if elapsed >= period
                || self.ctx.shutdown_requested.load(SeqCst)
                || self.ctx.failover_active()
            {
                return;
            }
            std::thread::sleep((period - elapsed).min(Duration::from_millis(10)));
        }
    }

    /// One checkpoint transaction: stop, snapshot, ship, await both acks,
    /// release buffered output, resume (or carry out a shutdown).
    fn transaction(
        &self,
        reg: &mut SectionRegistry,
        f: &mut WireStream,
        rp: &mut WireStream,
        buffer: &SizedBuffer,
        net: &Arc<dyn PacketBuffering>,
    ) -> anyhow::Result<Progress> {
        let ctx = &self.ctx;
        command::send_colo(f, Command::ColoCheckpointRequest)?;

        buffer.clear();
        let mut trans = buffer.writer();

        ensure!(!ctx.failover_active(), "failover request");
        let shutdown = ctx.shutdown_requested.load(SeqCst);
        ctx.vm.stop()?;
        debug!("checkpoint: run -> stop");
        // A failover may have fired while we were stopping.
        ensure!(!ctx.failover_active(), "failover request");

        ctx.blocks.checkpoint()?;

        command::send_colo(f, Command::ColoVmstateSend)?;

        // Live state goes straight down the wire; device state is staged in
        // the buffer so it can be delivered atomically.
        driver::save_live_state(reg, f)?;
        ctx.vm.sync_cpu_state();
        driver::save_device_state(reg, &mut trans)?;
        trans.flush()?;

        let size = buffer.len() as u64;
        command::send_colo_value(f, Command::ColoVmstateSize, size)?;
        buffer.drain_to(f, size as usize)?;
        f.flush()?;
        if let Some(err) = f.last_error() {
            return Err(err).context("checkpoint stream failed");
        }

        expect_command(rp, Command::ColoVmstateReceived)?;
        expect_command(rp, Command::ColoVmstateLoaded)?;

        // The secondary has caught up; everything the guest sent since the
        // last checkpoint is now safe to emit.
        net.release_buffered();

        if shutdown {
            ctx.blocks.stop_replication(false)?;
            command::send_colo(f, Command::ColoGuestShutdown)?;
            f.flush()?;
            ctx.shutdown_requested.store(false, SeqCst);
            ctx.vm.request_shutdown();
            info!("coordinated shutdown; leaving checkpoint loop");
            return Ok(Progress::Shutdown);
        }

        ctx.vm.start()?;
        debug!("checkpoint: stop -> run");
        Ok(Progress::Continue)
    }
}

enum Checkpoint {
    Request,
    Shutdown,
}

/// The secondary-side checkpoint engine.
pub struct ColoSecondary {
    pub ctx: Arc<ColoContext>,
}

impl ColoSecondary {
    pub fn new(ctx: Arc<ColoContext>) -> Self {
        ColoSecondary { ctx }
    }

    /// Receive checkpoints until failover, error or coordinated shutdown.
    /// Blocks; run it on a dedicated thread.
    pub fn run(&self, reg: &mut SectionRegistry, incoming: &mut IncomingState) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        ensure!(
            ctx.status.transition(MigrationStatus::Active, MigrationStatus::Colo),
            "COLO requires an active incoming migration"
        );

        let result = self.process(reg, incoming);
        if result.is_ok() {
            return result;
        }
        let reason = if ctx.failover_active() {
            ExitReason::Request
        } else {
            ExitReason::Error
        };
        if let Err(err) = &result {
            error!("secondary checkpoint loop ended: {err:#}");
        }
        ctx.events.colo_exit(ColoMode::Secondary, reason);
        if let Some(cache) = &ctx.cache {
            cache.release();
        }
        if ctx.failover_active() {
            ctx.sem.wait();
        }
        result
    }

    fn process(&self, reg: &mut SectionRegistry, incoming: &mut IncomingState) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        ctx.add_shutdown_handle(incoming.file.shutdown_handle());
        let rp = incoming.open_return_path()?;
        ctx.add_shutdown_handle(rp.lock_or_panic().shutdown_handle());

        // The incoming coroutine left the stream non-blocking; this thread
        // wants plain blocking reads.
        incoming.file.set_blocking(true)?;

        let cache = ctx.cache.clone().context("secondary COLO needs a RAM cache")?;
        cache.init().context("initializing RAM cache")?;

        let buffer = SizedBuffer::new();
        incoming
            .load_state_header()
            .context("reading COLO stream header")?;

        ctx.blocks.start_replication(ReplicationMode::Secondary)?;
        command::send_colo(&mut rp.lock_or_panic(), Command::ColoCheckpointReady)?;
        info!("COLO secondary ready");

        while ctx.status.get() == MigrationStatus::Colo {
            match self.wait_checkpoint(reg, incoming)? {
                Checkpoint::Shutdown => return Ok(()),
                Checkpoint::Request => {}
            }
            ensure!(!ctx.failover_active(), "failover request");

            ctx.vm.stop()?;
            debug!("checkpoint: run -> stop");

            expect_command(&mut incoming.file, Command::ColoVmstateSend)?;

            // Live RAM lands in the cache; nothing touches guest memory
            // until the whole checkpoint has arrived.
            incoming.load_ram_state(reg).context("loading live state")?;

            let size = expect_value_command(&mut incoming.file, Command::ColoVmstateSize)?;
            buffer.clear();
            let got = buffer.fill_from(&mut incoming.file, size as usize)?;
            ensure!(
                got as u64 == size,
                "got {got} bytes of device state, less than expected {size}"
            );

            command::send_colo(&mut rp.lock_or_panic(), Command::ColoVmstateReceived)?;

            ctx.vm.reset_silent()?;
            ctx.set_vmstate_loading(true);
            let loaded = cache
                .flush()
                .context("flushing RAM cache")
                .and_then(|()| {
                    driver::load_device_state(reg, &mut buffer.reader())
                        .context("loading device state")
                })
                .and_then(|()| ctx.blocks.checkpoint().context("block checkpoint commit"));
            ctx.set_vmstate_loading(false);
            loaded?;

            if ctx.failover.get() == FailoverStatus::Relaunch {
                // A failover fired mid-load and was deferred; re-arm it now
                // that the checkpoint is consistent.
                ctx.failover
                    .set_state(FailoverStatus::Relaunch, FailoverStatus::None);
                ctx.request_failover();
                bail!("failover request");
            }

            command::send_colo(&mut rp.lock_or_panic(), Command::ColoVmstateLoaded)?;

            ctx.vm.start()?;
            debug!("checkpoint: stop -> run");
        }
        bail!("migration left COLO state");
    }

    /// Absorb stray section frames (live setup, trailing bursts) until the
    /// primary opens a transaction or coordinates a shutdown.
    fn wait_checkpoint(
        &self,
        reg: &mut SectionRegistry,
        incoming: &mut IncomingState,
    ) -> anyhow::Result<Checkpoint> {
        let ctx = &self.ctx;
        loop {
            let tag = incoming.file.get_u8()?;
            let ty = SectionType::try_from(tag)
                .map_err(|v| anyhow::anyhow!("unknown section type {v:#x}"))?;
            match ty {
                SectionType::Command => {
                    let header = read_command_header(&mut incoming.file)?;
                    match header.cmd {
                        Command::ColoCheckpointRequest => {
                            command::check_len(header.cmd, header.len, 0)?;
                            return Ok(Checkpoint::Request);
                        }
                        Command::ColoGuestShutdown => {
                            command::check_len(header.cmd, header.len, 0)?;
                            info!("primary coordinated a shutdown");
                            ctx.vm.stop()?;
                            ctx.blocks.stop_replication(false)?;
                            ctx.vm.request_shutdown();
                            return Ok(Checkpoint::Shutdown);
                        }
                        other => bail!("got unknown COLO command: {}", other.name()),
                    }
                }
                SectionType::Start | SectionType::Full => {
                    incoming.load_section_start_full(reg)?;
                }
                SectionType::Part | SectionType::End => {
                    incoming.load_section_part_end(reg)?;
                }
                SectionType::Eof => bail!("state stream ended while waiting for a checkpoint"),
            }
        }
    }
}
