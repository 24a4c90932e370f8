// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic in-memory stand-in for the Linux backend.
//!
//! Owns its own little address space: tests map regions, inject faults, and
//! then observe discards, registrations and page placements without touching
//! a single syscall.

use crate::{FaultChannel, FaultEvent, HostMemory, Result, SysError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub dst: u64,
    pub len: u64,
    pub zero: bool,
}

#[derive(Default)]
struct MemState {
    maps: BTreeMap<u64, Vec<u8>>,
    next_base: u64,
    discards: Vec<(u64, u64)>,
    nohuge: Vec<(u64, u64)>,
    huge: Vec<(u64, u64)>,
    relocked: bool,
    probe_failure: Option<String>,
}

struct FaultState {
    registered: Vec<(u64, u64)>,
    placements: Vec<Placement>,
    events: VecDeque<FaultEvent>,
    quit: bool,
}

struct Shared {
    page_size: usize,
    mem: Mutex<MemState>,
    faults: Mutex<FaultState>,
    wakeup: Condvar,
}

/// In-memory [`HostMemory`] backend; clones share state.
#[derive(Clone)]
pub struct TestMemory {
    shared: Arc<Shared>,
}

impl TestMemory {
    pub fn new(page_size: usize) -> Self {
        TestMemory {
            shared: Arc::new(Shared {
                page_size,
                mem: Mutex::new(MemState {
                    next_base: 0x1000_0000,
                    ..Default::default()
                }),
                faults: Mutex::new(FaultState {
                    registered: Vec::new(),
                    placements: Vec::new(),
                    events: VecDeque::new(),
                    quit: false,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    fn mem(&self) -> MutexGuard<'_, MemState> {
        #[allow(clippy::unwrap_used)]
        self.shared.mem.lock().unwrap()
    }

    fn faults(&self) -> MutexGuard<'_, FaultState> {
        #[allow(clippy::unwrap_used)]
        self.shared.faults.lock().unwrap()
    }

    /// Map a zero-filled region and return its base address.
    pub fn map(&self, len: usize) -> u64 {
        let mut mem = self.mem();
        let base = mem.next_base;
        mem.next_base += (len as u64 + 0xFFFF) & !0xFFFF;
        mem.maps.insert(base, vec![0u8; len]);
        base
    }

    /// Queue a fault event as if the guest had touched `addr`.
    pub fn inject_fault(&self, addr: u64) {
        self.faults().events.push_back(FaultEvent::Fault { addr });
        self.shared.wakeup.notify_all();
    }

    /// Make the next `probe` fail, for capability-error paths.
    pub fn fail_probe(&self, reason: &str) {
        self.mem().probe_failure = Some(reason.to_string());
    }

    pub fn discards(&self) -> Vec<(u64, u64)> {
        self.mem().discards.clone()
    }

    pub fn nohuge_ranges(&self) -> Vec<(u64, u64)> {
        self.mem().nohuge.clone()
    }

    pub fn huge_ranges(&self) -> Vec<(u64, u64)> {
        self.mem().huge.clone()
    }

    pub fn registered_ranges(&self) -> Vec<(u64, u64)> {
        self.faults().registered.clone()
    }

    pub fn placements(&self) -> Vec<Placement> {
        self.faults().placements.clone()
    }

    pub fn relocked(&self) -> bool {
        self.mem().relocked
    }

    fn locate(mem: &MemState, addr: u64, len: usize) -> Result<(u64, usize)> {
        for (base, bytes) in mem.maps.range(..=addr).rev() {
            let off = (addr - base) as usize;
            if off + len <= bytes.len() {
                return Ok((*base, off));
            }
            break;
        }
        Err(SysError::BadAddress(addr))
    }
}

impl HostMemory for TestMemory {
    fn page_size(&self) -> usize {
        self.shared.page_size
    }

    fn probe(&self, target_page_size: usize) -> Result<()> {
        if let Some(reason) = self.mem().probe_failure.clone() {
            return Err(SysError::Unsupported(reason));
        }
        if target_page_size > self.shared.page_size {
            return Err(SysError::Unsupported(
                "target page size bigger than host page size".into(),
            ));
        }
        Ok(())
    }

    fn discard(&self, addr: u64, len: u64) -> Result<()> {
        let mut mem = self.mem();
        let (base, off) = Self::locate(&mem, addr, len as usize)?;
        if let Some(bytes) = mem.maps.get_mut(&base) {
            bytes[off..off + len as usize].fill(0);
        }
        mem.discards.push((addr, len));
        Ok(())
    }

    fn nohuge(&self, addr: u64, len: u64) -> Result<()> {
        self.mem().nohuge.push((addr, len));
        Ok(())
    }

    fn huge(&self, addr: u64, len: u64) -> Result<()> {
        self.mem().huge.push((addr, len));
        Ok(())
    }

    fn lock_all(&self) -> Result<()> {
        self.mem().relocked = true;
        Ok(())
    }

    fn alloc_page(&self) -> Result<u64> {
        Ok(self.map(self.shared.page_size))
    }

    fn free_page(&self, addr: u64) -> Result<()> {
        self.mem().maps.remove(&addr);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut mem = self.mem();
        let (base, off) = Self::locate(&mem, addr, data.len())?;
        if let Some(bytes) = mem.maps.get_mut(&base) {
            bytes[off..off + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mem = self.mem();
        let (base, off) = Self::locate(&mem, addr, len)?;
        match mem.maps.get(&base) {
            Some(bytes) => Ok(bytes[off..off + len].to_vec()),
            None => Err(SysError::BadAddress(addr)),
        }
    }

    fn open_fault_channel(&self, _nonblocking: bool) -> Result<Arc<dyn FaultChannel>> {
        // Reset per-channel state so a fresh LISTEN starts clean.
        {
            let mut faults = self.faults();
            faults.registered.clear();
            faults.quit = false;
        }
        Ok(Arc::new(TestFaultChannel {
            mem: self.clone(),
        }))
    }
}

pub struct TestFaultChannel {
    mem: TestMemory,
}

impl FaultChannel for TestFaultChannel {
    fn register(&self, start: u64, len: u64) -> Result<()> {
        self.mem.faults().registered.push((start, len));
        Ok(())
    }

    fn unregister(&self, start: u64, len: u64) -> Result<()> {
        self.mem
            .faults()
            .registered
            .retain(|r| *r != (start, len));
        Ok(())
    }

    fn copy(&self, dst: u64, src: u64, len: u64) -> Result<()> {
        let data = self.mem.read(src, len as usize)?;
        self.mem.write(dst, &data)?;
        self.mem.faults().placements.push(Placement {
            dst,
            len,
            zero: false,
        });
        Ok(())
    }

    fn zeropage(&self, start: u64, len: u64) -> Result<()> {
        self.mem.write(start, &vec![0u8; len as usize])?;
        self.mem.faults().placements.push(Placement {
            dst: start,
            len,
            zero: true,
        });
        Ok(())
    }

    fn wake(&self, _start: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn next_event(&self) -> Result<FaultEvent> {
        let mut faults = self.mem.faults();
        loop {
            if faults.quit {
                return Ok(FaultEvent::Quit);
            }
            if let Some(ev) = faults.events.pop_front() {
                if ev == FaultEvent::Quit {
                    faults.quit = true;
                }
                return Ok(ev);
            }
            #[allow(clippy::unwrap_used)]
            {
                faults = self.mem.shared.wakeup.wait(faults).unwrap();
            }
        }
    }

    fn request_quit(&self) -> Result<()> {
        self.mem.faults().events.push_back(FaultEvent::Quit);
        self.mem.shared.wakeup.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn placements_follow_copy_and_zero() {
        let mem = TestMemory::new(4096);
        let region = mem.map(4096 * 4);
        let staging = mem.alloc_page().unwrap();
        mem.write(staging, &[7u8; 4096]).unwrap();

        let chan = mem.open_fault_channel(true).unwrap();
        chan.copy(region, staging, 4096).unwrap();
        chan.zeropage(region + 4096, 4096).unwrap();

        assert_eq!(mem.read(region, 2).unwrap(), vec![7, 7]);
        assert_eq!(mem.read(region + 4096, 2).unwrap(), vec![0, 0]);
        assert_eq!(
            mem.placements(),
            vec![
                Placement {
                    dst: region,
                    len: 4096,
                    zero: false
                },
                Placement {
                    dst: region + 4096,
                    len: 4096,
                    zero: true
                },
            ]
        );
    }

    #[test]
    fn quit_wins_over_later_events() {
        let mem = TestMemory::new(4096);
        let chan = mem.open_fault_channel(true).unwrap();
        mem.inject_fault(0x1000_0000);
        chan.request_quit().unwrap();
        assert_eq!(
            chan.next_event().unwrap(),
            FaultEvent::Fault { addr: 0x1000_0000 }
        );
        assert_eq!(chan.next_event().unwrap(), FaultEvent::Quit);
        // Quit latches.
        assert_eq!(chan.next_event().unwrap(), FaultEvent::Quit);
    }
}
