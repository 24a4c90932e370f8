// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The save/load driver: walks the section registry, emits self-describing
//! frames on the way out, and dispatches them (plus commands) on the way in.

use crate::command::{self, check_len};
use crate::config::{MigrationConfig, MigrationParams};
use crate::postcopy::PostcopyIncoming;
use crate::protocol::{
    Command, SectionType, EXIT_KEEPHANDLERS, EXIT_QUITLOOP, EXIT_QUITPARENT, FILE_MAGIC,
    FILE_VERSION, FILE_VERSION_OBSOLETE,
};
use crate::ram::RamLayout;
use crate::registry::SectionRegistry;
use crate::section::{IterateStatus, SectionBody};
use crate::state::SharedStatus;
use crate::vm::{EventSink, ExitReason, VmController};
use crate::MutexExt;
use anyhow::{bail, ensure, Context};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use vmrelay_sys::HostMemory;
use vmrelay_wire::{SizedBuffer, WireError, WireStream};

// ---- save side ----

fn put_section_header(
    f: &mut WireStream,
    ty: SectionType,
    section_id: u32,
    idstr: &str,
    instance_id: u32,
    version_id: u32,
) -> vmrelay_wire::Result<()> {
    f.put_u8(ty as u8)?;
    f.put_u32(section_id)?;
    f.put_counted_string(idstr)?;
    f.put_u32(instance_id)?;
    f.put_u32(version_id)
}

fn device_error(f: &mut WireStream, idstr: &str, err: &anyhow::Error) {
    f.set_error(WireError::Device(format!("{idstr}: {err:#}")));
}

/// Open the stream (magic + version) and give every live section its
/// SECTION_START frame and setup pass.
pub fn state_begin(
    reg: &mut SectionRegistry,
    f: &mut WireStream,
    params: &MigrationParams,
) -> anyhow::Result<()> {
    for e in reg.iter_mut() {
        if let SectionBody::Live(ops) = &mut e.body {
            ops.set_params(params);
        }
    }

    f.put_u32(FILE_MAGIC)?;
    f.put_u32(FILE_VERSION)?;

    for e in reg.iter_mut() {
        let active = matches!(&e.body, SectionBody::Live(ops) if ops.is_active());
        if !active {
            continue;
        }
        put_section_header(
            f,
            SectionType::Start,
            e.section_id,
            &e.idstr,
            e.instance_id,
            e.version_id,
        )?;
        let idstr = e.idstr.clone();
        if let SectionBody::Live(ops) = &mut e.body {
            if let Err(err) = ops.setup(f) {
                device_error(f, &idstr, &err);
                return Err(err).with_context(|| format!("setup of '{idstr}' failed"));
            }
        }
    }
    Ok(())
}

/// One pass over the live sections. `Again` means the caller has to come
/// back; iteration deliberately stops at the first section that is not
/// done, so a fast-changing section cannot starve the ones behind it.
pub fn state_iterate(reg: &mut SectionRegistry, f: &mut WireStream) -> anyhow::Result<IterateStatus> {
    let mut status = IterateStatus::Done;
    for e in reg.iter_mut() {
        let active = matches!(&e.body, SectionBody::Live(ops) if ops.is_active());
        if !active {
            continue;
        }
        if f.rate_limited() {
            return Ok(IterateStatus::Again);
        }
        f.put_u8(SectionType::Part as u8)?;
        f.put_u32(e.section_id)?;
        let idstr = e.idstr.clone();
        if let SectionBody::Live(ops) = &mut e.body {
            match ops.iterate(f) {
                Err(err) => {
                    device_error(f, &idstr, &err);
                    return Err(err).with_context(|| format!("iterate of '{idstr}' failed"));
                }
                Ok(s) => {
                    status = s;
                    if s == IterateStatus::Again {
                        break;
                    }
                }
            }
        }
    }
    Ok(status)
}

/// Finish the stream: SECTION_END for every live section (skipping the
/// postcopiable ones when a postcopy tail follows), SECTION_FULL for every
/// device, then EOF unless postcopy keeps the stream open.
pub fn state_complete(
    reg: &mut SectionRegistry,
    f: &mut WireStream,
    in_postcopy: bool,
) -> anyhow::Result<()> {
    for e in reg.iter_mut() {
        let (active, postcopiable) = match &e.body {
            SectionBody::Live(ops) => (ops.is_active(), ops.can_postcopy()),
            _ => continue,
        };
        if !active || (in_postcopy && postcopiable) {
            continue;
        }
        f.put_u8(SectionType::End as u8)?;
        f.put_u32(e.section_id)?;
        let idstr = e.idstr.clone();
        if let SectionBody::Live(ops) = &mut e.body {
            if let Err(err) = ops.complete(f) {
                device_error(f, &idstr, &err);
                return Err(err).with_context(|| format!("completion of '{idstr}' failed"));
            }
        }
    }

    save_full_sections(reg, f, false)?;

    if !in_postcopy {
        // The postcopy stream will still be going.
        f.put_u8(SectionType::Eof as u8)?;
    }
    f.flush()?;
    Ok(())
}

fn save_full_sections(
    reg: &mut SectionRegistry,
    f: &mut WireStream,
    skip_ram: bool,
) -> anyhow::Result<()> {
    for e in reg.iter_mut() {
        if skip_ram && e.is_ram() {
            continue;
        }
        let ops = match &mut e.body {
            SectionBody::Live(_) => continue,
            SectionBody::Plain(ops) => ops,
            SectionBody::Described { ops, .. } => ops,
        };
        put_section_header(
            f,
            SectionType::Full,
            e.section_id,
            &e.idstr,
            e.instance_id,
            e.version_id,
        )?;
        if let Err(err) = ops.save(f) {
            let idstr = e.idstr.clone();
            device_error(f, &idstr, &err);
            return Err(err).with_context(|| format!("save of '{idstr}' failed"));
        }
    }
    Ok(())
}

/// Flush the postcopiable sections' last pages and close out the postcopy
/// tail of the stream.
pub fn state_postcopy_complete(
    reg: &mut SectionRegistry,
    f: &mut WireStream,
) -> anyhow::Result<()> {
    for e in reg.iter_mut() {
        let wanted = matches!(
            &e.body,
            SectionBody::Live(ops) if ops.is_active() && ops.can_postcopy()
        );
        if !wanted {
            continue;
        }
        f.put_u8(SectionType::End as u8)?;
        f.put_u32(e.section_id)?;
        let idstr = e.idstr.clone();
        if let SectionBody::Live(ops) = &mut e.body {
            if let Err(err) = ops.complete(f) {
                device_error(f, &idstr, &err);
                return Err(err).with_context(|| format!("completion of '{idstr}' failed"));
            }
        }
    }
    command::send_postcopy_end(f, 0)?;
    f.put_u8(SectionType::Eof as u8)?;
    f.flush()?;
    Ok(())
}

/// Split estimate of bytes still to transfer: `(non_postcopiable,
/// postcopiable)`. The caller flips into postcopy when the first number is
/// small enough.
pub fn state_pending(reg: &mut SectionRegistry, max_size: u64) -> (u64, u64) {
    let mut non_pc = 0;
    let mut pc = 0;
    for e in reg.iter_mut() {
        if let SectionBody::Live(ops) = &mut e.body {
            if !ops.is_active() {
                continue;
            }
            let pending = ops.pending(max_size);
            if ops.can_postcopy() {
                pc += pending;
            } else {
                non_pc += pending;
            }
        }
    }
    (non_pc, pc)
}

/// Tell every live section the migration is being abandoned.
pub fn state_cancel(reg: &mut SectionRegistry) {
    for e in reg.iter_mut() {
        if let SectionBody::Live(ops) = &mut e.body {
            ops.cancel();
        }
    }
}

/// The whole save pipeline for a stopped guest: begin, iterate to
/// exhaustion, complete. Used by snapshots; live migration drives the
/// phases itself.
pub fn save_full_state(
    reg: &mut SectionRegistry,
    f: &mut WireStream,
    params: &MigrationParams,
) -> anyhow::Result<()> {
    if let Some(reason) = reg.blocked_reason() {
        bail!(reason);
    }
    state_begin(reg, f, params)?;
    while f.last_error().is_none() {
        if state_iterate(reg, f)? == IterateStatus::Done {
            break;
        }
    }
    if let Some(err) = f.last_error() {
        state_cancel(reg);
        return Err(err).context("state stream failed during iteration");
    }
    state_complete(reg, f, false)?;
    match f.last_error() {
        Some(err) => {
            state_cancel(reg);
            Err(err).context("state stream failed during completion")
        }
        None => Ok(()),
    }
}

/// Serialize only the device sections (no RAM): its own magic/version
/// header, SECTION_FULL frames, EOF. This is the payload COLO packages per
/// checkpoint.
pub fn save_device_state(reg: &mut SectionRegistry, f: &mut WireStream) -> anyhow::Result<()> {
    f.put_u32(FILE_MAGIC)?;
    f.put_u32(FILE_VERSION)?;
    save_full_sections(reg, f, true)?;
    f.put_u8(SectionType::Eof as u8)?;
    f.flush()?;
    match f.last_error() {
        Some(err) => Err(err).context("device state stream failed"),
        None => Ok(()),
    }
}

/// One checkpoint's worth of live state: a final flush of every live
/// section, terminated by EOF so the receiver's load loop knows where the
/// burst ends.
pub fn save_live_state(reg: &mut SectionRegistry, f: &mut WireStream) -> anyhow::Result<()> {
    for e in reg.iter_mut() {
        let active = matches!(&e.body, SectionBody::Live(ops) if ops.is_active());
        if !active {
            continue;
        }
        f.put_u8(SectionType::End as u8)?;
        f.put_u32(e.section_id)?;
        let idstr = e.idstr.clone();
        if let SectionBody::Live(ops) = &mut e.body {
            if let Err(err) = ops.complete(f) {
                device_error(f, &idstr, &err);
                return Err(err).with_context(|| format!("live flush of '{idstr}' failed"));
            }
        }
    }
    f.put_u8(SectionType::Eof as u8)?;
    f.flush()?;
    Ok(())
}

// ---- load side ----

/// Live-entry table row: a SECTION_START/FULL introduced `section_id` and
/// pinned the version every later PART/END is loaded with.
#[derive(Debug, Clone, Copy)]
struct LiveEntry {
    index: usize,
    section_id: u32,
    version_id: u32,
}

/// Everything the incoming side of one migration owns.
///
/// The registry is passed into each call instead of being owned here so
/// tests (and embedders with device hot-plug at realize time) control its
/// lifetime; it must not change while a load loop is running.
pub struct IncomingState {
    pub file: WireStream,
    pub(crate) return_path: Option<Arc<Mutex<WireStream>>>,
    live: Vec<LiveEntry>,
    pub(crate) postcopy: PostcopyIncoming,
    pub(crate) packaged_depth: u32,
    pub config: MigrationConfig,
    pub(crate) layout: RamLayout,
    pub(crate) memory: Arc<dyn HostMemory>,
    pub(crate) vm: Arc<dyn VmController>,
    pub(crate) events: Arc<dyn EventSink>,
    pub status: SharedStatus,
}

/// The collaborators an [`IncomingState`] is built over.
#[derive(Clone)]
pub struct IncomingEnv {
    pub config: MigrationConfig,
    pub layout: RamLayout,
    pub memory: Arc<dyn HostMemory>,
    pub vm: Arc<dyn VmController>,
    pub events: Arc<dyn EventSink>,
}

impl IncomingState {
    pub fn new(file: WireStream, env: IncomingEnv) -> Self {
        IncomingState {
            file,
            return_path: None,
            live: Vec::new(),
            postcopy: PostcopyIncoming::new(),
            packaged_depth: 0,
            config: env.config,
            layout: env.layout,
            memory: env.memory,
            vm: env.vm,
            events: env.events,
            status: SharedStatus::default(),
        }
    }

    /// The destination→source stream, opening it on first use. Shared with
    /// the postcopy fault thread, hence the mutex.
    pub fn open_return_path(&mut self) -> anyhow::Result<Arc<Mutex<WireStream>>> {
        if let Some(rp) = &self.return_path {
            return Ok(rp.clone());
        }
        let rp = match self.file.return_path() {
            Some(Ok(rp)) => rp,
            Some(Err(e)) => return Err(e).context("could not open return path"),
            None => bail!("transport has no return path"),
        };
        let rp = Arc::new(Mutex::new(rp));
        self.return_path = Some(rp.clone());
        Ok(rp)
    }

    pub fn return_path(&self) -> Option<Arc<Mutex<WireStream>>> {
        self.return_path.clone()
    }

    /// Full incoming migration: header check, main loop, table teardown.
    /// Returns the load loop's exit flags.
    pub fn load_state(&mut self, reg: &mut SectionRegistry) -> anyhow::Result<u32> {
        if let Some(reason) = reg.blocked_reason() {
            bail!(reason);
        }

        let magic = self.file.get_u32()?;
        ensure!(magic == FILE_MAGIC, "bad stream magic {magic:#x}");
        let version = self.file.get_u32()?;
        if version == FILE_VERSION_OBSOLETE {
            bail!("state stream version 3 is obsolete and no longer loadable");
        }
        ensure!(version == FILE_VERSION, "unsupported stream version {version}");

        let result = self.load_state_main(reg);
        let flags = match &result {
            Ok(flags) => *flags,
            Err(_) => 0,
        };
        if flags & EXIT_KEEPHANDLERS == 0 {
            self.live.clear();
        }
        let flags = result.inspect_err(|_| self.events.migration_exit(ExitReason::Error))?;
        if let Some(err) = self.file.last_error() {
            self.events.migration_exit(ExitReason::Error);
            return Err(err).context("state stream failed during load");
        }
        self.events.migration_exit(ExitReason::Normal);
        Ok(flags)
    }

    /// Verify magic/version only; the COLO secondary consumes the rest of
    /// the stream checkpoint by checkpoint.
    pub fn load_state_header(&mut self) -> anyhow::Result<()> {
        let magic = self.file.get_u32()?;
        ensure!(magic == FILE_MAGIC, "bad stream magic {magic:#x}");
        let version = self.file.get_u32()?;
        ensure!(version == FILE_VERSION, "unsupported stream version {version}");
        Ok(())
    }

    /// One load-loop round that keeps the live table: COLO RAM bursts.
    pub fn load_ram_state(&mut self, reg: &mut SectionRegistry) -> anyhow::Result<()> {
        self.load_state_main(reg)?;
        Ok(())
    }

    /// The dispatch loop: one byte of section type per frame until EOF or a
    /// handler asks to quit. Returns accumulated exit flags.
    pub fn load_state_main(&mut self, reg: &mut SectionRegistry) -> anyhow::Result<u32> {
        let mut exitcode = 0;
        loop {
            let tag = self.file.get_u8()?;
            let ty = SectionType::try_from(tag)
                .map_err(|v| anyhow::anyhow!("unknown section type {v:#x}"))?;
            match ty {
                SectionType::Eof => break,
                SectionType::Start | SectionType::Full => {
                    self.load_section_start_full(reg)?;
                }
                SectionType::Part | SectionType::End => {
                    self.load_section_part_end(reg)?;
                }
                SectionType::Command => {
                    let ret = self.process_command(reg)?;
                    if ret & EXIT_QUITLOOP != 0 {
                        return Ok(exitcode | ret);
                    }
                    exitcode |= ret;
                }
            }
        }
        Ok(exitcode)
    }

    pub(crate) fn load_section_start_full(
        &mut self,
        reg: &mut SectionRegistry,
    ) -> anyhow::Result<()> {
        let section_id = self.file.get_u32()?;
        let idstr = self
            .file
            .get_counted_string()
            .with_context(|| format!("unable to read ID string for section {section_id}"))?;
        let instance_id = self.file.get_u32()?;
        let version_id = self.file.get_u32()?;
        debug!(section_id, %idstr, instance_id, version_id, "section header");

        let index = reg.find(&idstr, instance_id).with_context(|| {
            format!("unknown state section or instance '{idstr}' {instance_id}")
        })?;
        let entry = reg.get(index).context("registry changed during load")?;
        ensure!(
            version_id <= entry.version_id,
            "unsupported version {version_id} for '{idstr}' v{}",
            entry.version_id
        );
        if let Some(desc) = entry.body.descriptor() {
            ensure!(
                version_id >= desc.minimum_version_id,
                "version {version_id} for '{idstr}' is older than the minimum {}",
                desc.minimum_version_id
            );
        }

        self.live.push(LiveEntry {
            index,
            section_id,
            version_id,
        });
        self.dispatch_load(reg, index, version_id)
            .with_context(|| format!("error while loading state for '{idstr}' {instance_id}"))
    }

    pub(crate) fn load_section_part_end(
        &mut self,
        reg: &mut SectionRegistry,
    ) -> anyhow::Result<()> {
        let section_id = self.file.get_u32()?;
        let le = self
            .live
            .iter()
            .find(|le| le.section_id == section_id)
            .copied()
            .with_context(|| format!("unknown state section id {section_id}"))?;
        self.dispatch_load(reg, le.index, le.version_id)
            .with_context(|| format!("error while loading state section id {section_id}"))
    }

    fn dispatch_load(
        &mut self,
        reg: &mut SectionRegistry,
        index: usize,
        version_id: u32,
    ) -> anyhow::Result<()> {
        let entry = reg.get_mut(index).context("registry changed during load")?;
        match &mut entry.body {
            SectionBody::Live(ops) => ops.load(&mut self.file, version_id),
            SectionBody::Plain(ops) => ops.load(&mut self.file, version_id),
            SectionBody::Described { ops, .. } => ops.load(&mut self.file, version_id),
        }
    }

    /// Dispatch one SECTION_COMMAND; returns the exit flags for the loop.
    fn process_command(&mut self, reg: &mut SectionRegistry) -> anyhow::Result<u32> {
        let header = command::read_command_header(&mut self.file)?;
        debug!(cmd = header.cmd.name(), len = header.len, "processing command");
        match header.cmd {
            Command::OpenReturnPath => {
                check_len(header.cmd, header.len, 0)?;
                if self.return_path.is_some() {
                    // Not really a problem, so don't give up.
                    warn!("OPENRP received with the return path already open");
                    return Ok(0);
                }
                self.open_return_path()?;
                Ok(0)
            }
            Command::ReqAck => {
                check_len(header.cmd, header.len, 4)?;
                let value = self.file.get_u32()?;
                let rp = self
                    .return_path
                    .clone()
                    .with_context(|| format!("REQACK ({value:#x}) with no open return path"))?;
                command::send_rp_ack(&mut rp.lock_or_panic(), value)?;
                Ok(0)
            }
            Command::Packaged => {
                check_len(header.cmd, header.len, 4)?;
                let length = self.file.get_u32()?;
                self.load_packaged(reg, length)
            }
            Command::PostcopyAdvise => {
                check_len(header.cmd, header.len, 0)?;
                self.postcopy_advise()?;
                Ok(0)
            }
            Command::PostcopyDiscard => {
                self.postcopy_discard(header.len)?;
                Ok(0)
            }
            Command::PostcopyListen => {
                check_len(header.cmd, header.len, 0)?;
                self.postcopy_listen()?;
                Ok(0)
            }
            Command::PostcopyRun => {
                check_len(header.cmd, header.len, 0)?;
                self.postcopy_run()
            }
            Command::PostcopyEnd => {
                check_len(header.cmd, header.len, 1)?;
                let status = self.file.get_u8()?;
                self.postcopy_end(status)?;
                Ok(0)
            }
            other => bail!("unexpected {} in a state load stream", other.name()),
        }
    }

    /// Treat the next `length` bytes as an embedded sub-stream and run the
    /// load loop over it. A QUITPARENT from inside crosses this boundary as
    /// a QUITLOOP for our caller; a bare QUITLOOP is consumed here.
    fn load_packaged(&mut self, reg: &mut SectionRegistry, length: u32) -> anyhow::Result<u32> {
        ensure!(
            length <= self.config.max_packaged_size,
            "unreasonably large packaged state: {length}"
        );
        let buffer = SizedBuffer::new();
        let got = buffer.fill_from(&mut self.file, length as usize)?;
        ensure!(
            got == length as usize,
            "packaged state cut short: wanted {length}, received {got}"
        );
        debug!(length, "loading packaged sub-stream");

        // The sub-stream temporarily becomes the current file, so section
        // loaders and nested commands read from the package transparently.
        let outer = std::mem::replace(&mut self.file, buffer.reader());
        self.packaged_depth += 1;
        let sub = self.load_state_main(reg);
        self.packaged_depth -= 1;
        self.file = outer;

        let sub = sub.context("packaged sub-stream failed to load")?;
        let mut out = sub & !(EXIT_QUITLOOP | EXIT_QUITPARENT);
        if sub & EXIT_QUITPARENT != 0 {
            out |= EXIT_QUITLOOP;
        }
        Ok(out)
    }

    /// Number of live-table entries (tests and diagnostics).
    pub fn live_sections(&self) -> usize {
        self.live.len()
    }
}

/// Load a device-only stream (a COLO checkpoint buffer): magic/version,
/// SECTION_FULL frames, EOF. Live sections and commands have no business
/// here.
pub fn load_device_state(
    reg: &mut SectionRegistry,
    f: &mut WireStream,
) -> anyhow::Result<()> {
    let magic = f.get_u32()?;
    ensure!(magic == FILE_MAGIC, "bad device state magic {magic:#x}");
    let version = f.get_u32()?;
    ensure!(version == FILE_VERSION, "unsupported device state version {version}");

    loop {
        let tag = f.get_u8()?;
        let ty = SectionType::try_from(tag)
            .map_err(|v| anyhow::anyhow!("unknown section type {v:#x} in device state"))?;
        match ty {
            SectionType::Eof => break,
            SectionType::Full => {
                let section_id = f.get_u32()?;
                let idstr = f
                    .get_counted_string()
                    .with_context(|| format!("unable to read ID string for section {section_id}"))?;
                let instance_id = f.get_u32()?;
                let version_id = f.get_u32()?;
                let index = reg.find(&idstr, instance_id).with_context(|| {
                    format!("unknown state section or instance '{idstr}' {instance_id}")
                })?;
                let entry = reg.get_mut(index).context("registry changed during load")?;
                ensure!(
                    version_id <= entry.version_id,
                    "unsupported version {version_id} for '{idstr}'"
                );
                match &mut entry.body {
                    SectionBody::Plain(ops) => ops.load(f, version_id)?,
                    SectionBody::Described { ops, .. } => ops.load(f, version_id)?,
                    SectionBody::Live(_) => {
                        bail!("live section '{idstr}' in a device-only stream")
                    }
                }
            }
            other => bail!("unexpected {other:?} frame in a device-only stream"),
        }
    }
    Ok(())
}
