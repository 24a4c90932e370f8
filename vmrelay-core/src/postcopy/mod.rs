// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incoming postcopy: the phase machine driven by ADVISE/DISCARD/LISTEN/
//! RUN/END commands, the fault thread that turns kernel notifications into
//! page requests, and atomic page placement.

pub mod discard;

use crate::command;
use crate::driver::IncomingState;
use crate::protocol::{EXIT_KEEPHANDLERS, EXIT_QUITLOOP, EXIT_QUITPARENT};
use crate::ram::RamLayout;
use crate::MutexExt;
use anyhow::{ensure, Context};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use vmrelay_sys::{FaultChannel, FaultEvent};
use vmrelay_wire::WireStream;

/// Postcopy phases are totally ordered; every command is valid in exactly
/// one of them and `End` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    None,
    Advise,
    Listening,
    Running,
    End,
}

/// Destination-side postcopy state, owned by [`IncomingState`].
pub struct PostcopyIncoming {
    pub phase: Phase,
    pub(crate) channel: Option<Arc<dyn FaultChannel>>,
    pub(crate) fault_thread: Option<JoinHandle<()>>,
    pub(crate) tmp_page: Option<u64>,
}

impl PostcopyIncoming {
    pub(crate) fn new() -> Self {
        PostcopyIncoming {
            phase: Phase::None,
            channel: None,
            fault_thread: None,
            tmp_page: None,
        }
    }
}

impl IncomingState {
    /// ADVISE: a postcopy *might* happen. Probe the host and scrub RAM so
    /// every page can later be demand-placed.
    pub(crate) fn postcopy_advise(&mut self) -> anyhow::Result<()> {
        ensure!(
            self.postcopy.phase == Phase::None,
            "POSTCOPY_ADVISE in wrong postcopy phase {:?}",
            self.postcopy.phase
        );
        let target_page = 1usize << self.config.target_page_bits;
        self.memory
            .probe(target_page)
            .context("host cannot support postcopy")?;

        for r in self.layout.regions() {
            // RAM has to be truly empty: ROM contents and tables built at
            // init time go too, the source resends all of it. It must also
            // sit on base pages or single-page placement can't be atomic.
            self.memory.discard(r.host_base, r.len)?;
            self.memory.nohuge(r.host_base, r.len)?;
        }
        self.postcopy.phase = Phase::Advise;
        debug!("postcopy advised");
        Ok(())
    }

    /// DISCARD: drop pages the source re-dirtied after their precopy copy,
    /// so they fault and get re-fetched.
    pub(crate) fn postcopy_discard(&mut self, len: u16) -> anyhow::Result<()> {
        ensure!(
            self.postcopy.phase == Phase::Advise,
            "POSTCOPY_DISCARD in wrong postcopy phase {:?}",
            self.postcopy.phase
        );
        // 2-byte header, a counted name, then at least one 16-byte pair.
        ensure!(len >= 19, "POSTCOPY_DISCARD invalid length {len}");
        let version = self.file.get_u8()?;
        ensure!(version == 0, "POSTCOPY_DISCARD invalid version {version}");
        let first_bit_offset = self.file.get_u8()? as u64;
        let name = self
            .file
            .get_counted_string()
            .context("POSTCOPY_DISCARD failed to read RAM region name")?;

        let header = 3 + name.len();
        ensure!(
            len as usize > header && (len as usize - header) % 16 == 0,
            "POSTCOPY_DISCARD invalid length {len} for region '{name}'"
        );
        let mut remaining = len as usize - header;
        while remaining > 0 {
            let start_word = self.file.get_u64()?;
            let mask = self.file.get_u64()?;
            remaining -= 16;
            self.apply_discard_word(&name, first_bit_offset, start_word, mask)?;
        }
        Ok(())
    }

    /// Walk the runs of set bits in one `(start_word, mask)` pair and
    /// discard the page ranges they select.
    fn apply_discard_word(
        &self,
        name: &str,
        first_bit_offset: u64,
        start_word: u64,
        mut mask: u64,
    ) -> anyhow::Result<()> {
        while mask != 0 {
            let firstset = mask.trailing_zeros() as u64;
            let filled = mask | ((1u64 << firstset) - 1);
            // 64 when the run extends to the top bit.
            let firstzero = (!filled).trailing_zeros() as u64;

            ensure!(
                start_word != 0 || firstset >= first_bit_offset,
                "POSTCOPY_DISCARD bit set prior to region '{name}' \
                 (offset {first_bit_offset}, first set bit {firstset})"
            );
            let first_page = start_word * 64 + firstset - first_bit_offset;
            let last_page = start_word * 64 + (firstzero - 1) - first_bit_offset;
            self.discard_page_range(name, first_page, last_page)?;

            if firstzero < 64 {
                mask &= u64::MAX << firstzero;
            } else {
                mask = 0;
            }
        }
        Ok(())
    }

    /// Discard an inclusive range of target pages, rounded outward to host
    /// page boundaries (discarding more than asked is always safe here).
    fn discard_page_range(
        &self,
        name: &str,
        first_page: u64,
        last_page: u64,
    ) -> anyhow::Result<()> {
        let region = self
            .layout
            .by_name(name)
            .with_context(|| format!("POSTCOPY_DISCARD for unknown region '{name}'"))?;
        let tp_bits = self.config.target_page_bits;
        let start = first_page << tp_bits;
        let end = (last_page + 1) << tp_bits;
        ensure!(
            end <= region.len,
            "POSTCOPY_DISCARD pages {first_page}..={last_page} beyond region '{name}'"
        );
        let host_page = self.memory.page_size() as u64;
        let start = start & !(host_page - 1);
        let end = ((end + host_page - 1) & !(host_page - 1)).min(region.len);
        debug!(name, start, end, "discarding range");
        self.memory
            .discard(region.host_base + start, end - start)
            .with_context(|| format!("discard of '{name}' {start:#x}..{end:#x} failed"))?;
        Ok(())
    }

    /// LISTEN: from here on the stream may reference pages that do not
    /// exist locally. Open a fresh fault channel, start the fault thread,
    /// and arm every region for MISSING faults.
    pub(crate) fn postcopy_listen(&mut self) -> anyhow::Result<()> {
        ensure!(
            self.postcopy.phase == Phase::Advise,
            "POSTCOPY_LISTEN in wrong postcopy phase {:?}",
            self.postcopy.phase
        );
        let rp = self
            .return_path
            .clone()
            .context("postcopy requires an open return path")?;
        let channel = self
            .memory
            .open_fault_channel(true)
            .context("opening fault channel")?;

        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_channel = channel.clone();
        let layout = self.layout.clone();
        let page_len = self.memory.page_size() as u32;
        let handle = std::thread::Builder::new()
            .name("postcopy/fault".into())
            .spawn(move || {
                let _ = ready_tx.send(());
                fault_thread(thread_channel, layout, rp, page_len);
            })
            .context("spawning fault thread")?;
        // Don't register anything until the thread is really servicing.
        let _ = ready_rx.recv();

        for r in self.layout.regions() {
            channel
                .register(r.host_base, r.len)
                .with_context(|| format!("userfault register of '{}' failed", r.name))?;
        }
        self.postcopy.channel = Some(channel);
        self.postcopy.fault_thread = Some(handle);
        self.postcopy.phase = Phase::Listening;
        info!("postcopy listening");
        Ok(())
    }

    /// RUN: the guest may execute. Quits the load loop (and its packaged
    /// parent, if any) while keeping the live table for the page stream
    /// that keeps flowing.
    pub(crate) fn postcopy_run(&mut self) -> anyhow::Result<u32> {
        ensure!(
            self.postcopy.phase == Phase::Listening,
            "POSTCOPY_RUN in wrong postcopy phase {:?}",
            self.postcopy.phase
        );
        self.postcopy.phase = Phase::Running;
        if self.vm.autostart() {
            self.vm.start()?;
        } else {
            // Leave it paused and let management decide when to start.
            info!("postcopy running; guest left paused per autostart policy");
        }
        let mut flags = EXIT_QUITLOOP | EXIT_KEEPHANDLERS;
        if self.packaged_depth > 0 {
            flags |= EXIT_QUITPARENT;
        }
        Ok(flags)
    }

    /// END: the source considers postcopy over; non-zero status means it
    /// failed on its side.
    pub(crate) fn postcopy_end(&mut self, status: u8) -> anyhow::Result<()> {
        ensure!(
            self.postcopy.phase != Phase::None && self.postcopy.phase != Phase::End,
            "POSTCOPY_END in wrong postcopy phase {:?}",
            self.postcopy.phase
        );
        ensure!(status == 0, "source reported postcopy failure ({status})");
        self.postcopy.phase = Phase::End;
        Ok(())
    }

    /// Place one host page at `host` atomically; the kernel wakes whatever
    /// was blocked on it. With `all_zero` no source page is needed at all.
    pub fn place_page(&mut self, host: u64, from: u64, all_zero: bool) -> anyhow::Result<()> {
        let channel = self
            .postcopy
            .channel
            .as_ref()
            .context("no fault channel; not in postcopy?")?;
        let len = self.memory.page_size() as u64;
        if all_zero {
            channel.zeropage(host, len)?;
        } else {
            channel.copy(host, from, len)?;
        }
        Ok(())
    }

    /// The reusable staging page. The same address works across calls
    /// because `place_page` moves the backing page out from under it.
    pub fn tmp_page(&mut self) -> anyhow::Result<u64> {
        if let Some(page) = self.postcopy.tmp_page {
            return Ok(page);
        }
        let page = self.memory.alloc_page()?;
        self.postcopy.tmp_page = Some(page);
        Ok(page)
    }

    /// Undo everything postcopy set up and tell the source we are done.
    pub fn postcopy_cleanup(&mut self) -> anyhow::Result<()> {
        if let Some(channel) = self.postcopy.channel.take() {
            for r in self.layout.regions() {
                // Huge pages may come back now that every page is local,
                // and nothing should fault here any more.
                if let Err(e) = self.memory.huge(r.host_base, r.len) {
                    warn!("re-enabling huge pages on '{}': {e}", r.name);
                }
                if let Err(e) = channel.unregister(r.host_base, r.len) {
                    warn!("userfault unregister of '{}': {e}", r.name);
                }
            }
            channel.request_quit()?;
            if let Some(thread) = self.postcopy.fault_thread.take() {
                if thread.join().is_err() {
                    warn!("fault thread panicked before join");
                }
            }
        }
        if self.config.relock_memory {
            if let Err(e) = self.memory.lock_all() {
                // It doesn't feel right to fail here, the VM state is valid.
                warn!("re-locking memory: {e}");
            }
        }
        if let Some(page) = self.postcopy.tmp_page.take() {
            if let Err(e) = self.memory.free_page(page) {
                warn!("freeing staging page: {e}");
            }
        }
        self.postcopy.phase = Phase::End;
        if let Some(rp) = &self.return_path {
            let status = u32::from(self.file.last_error().is_some());
            if let Err(e) = command::send_rp_shut(&mut rp.lock_or_panic(), status) {
                warn!("sending return-path shutdown: {e}");
            }
        }
        Ok(())
    }
}

/// The fault thread: poll for faulting addresses, resolve them to a region
/// and offset, and ask the source for the page. Exits on the quit signal or
/// the first unrecoverable error.
fn fault_thread(
    channel: Arc<dyn FaultChannel>,
    layout: RamLayout,
    rp: Arc<Mutex<WireStream>>,
    page_len: u32,
) {
    debug!("fault thread running");
    let mut last_region: Option<String> = None;
    loop {
        let event = match channel.next_event() {
            Ok(event) => event,
            Err(e) => {
                error!("fault thread: {e}");
                break;
            }
        };
        let addr = match event {
            FaultEvent::Quit => break,
            FaultEvent::Fault { addr } => addr,
        };
        let Some((region, offset)) = layout.resolve(addr) else {
            error!("page fault outside guest RAM: {addr:#x}");
            break;
        };
        debug!(addr, region = %region.name, offset, "page fault");

        // Name the region only when it changed since the last request.
        let name =
            (last_region.as_deref() != Some(region.name.as_str())).then_some(region.name.as_str());
        if let Err(e) = command::send_rp_req_pages(&mut rp.lock_or_panic(), name, offset, page_len)
        {
            error!("fault thread: page request failed: {e}");
            break;
        }
        last_region = Some(region.name.clone());
    }
    debug!("fault thread exit");
}
