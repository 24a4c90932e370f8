// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The engine's view of guest RAM: a table of named host-mapped regions.
//! Guest-physical address mapping stays with the embedder; everything here
//! works in host addresses and per-region offsets.

/// One contiguous guest RAM region as mapped on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamRegion {
    /// Stable cross-host identifier ("pc.ram", "vga.vram", ...).
    pub name: String,
    pub host_base: u64,
    pub len: u64,
    /// Bit index where this region begins in the global dirty/discard
    /// bitmap; discard commands are expressed relative to it.
    pub bitmap_offset: u64,
}

impl RamRegion {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.host_base && addr < self.host_base + self.len
    }
}

/// All regions of the incoming guest, in registration order.
#[derive(Debug, Clone, Default)]
pub struct RamLayout {
    regions: Vec<RamRegion>,
}

impl RamLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, region: RamRegion) {
        self.regions.push(region);
    }

    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }

    pub fn by_name(&self, name: &str) -> Option<&RamRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Map a faulting host address back to its region and in-region offset.
    pub fn resolve(&self, addr: u64) -> Option<(&RamRegion, u64)> {
        self.regions
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| (r, addr - r.host_base))
    }
}
