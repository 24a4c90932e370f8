// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Source-side batching of discard ranges into POSTCOPY_DISCARD commands.
//!
//! The dirty-bitmap walk hands us inclusive target-page ranges one region
//! at a time; we queue a handful, then flush them as `(start_word, mask)`
//! pairs relative to the word containing the region's first bitmap bit.

use crate::command::send_postcopy_discard;
use crate::protocol::{MAX_DISCARDS_PER_COMMAND, MAX_DISCARD_PAIRS_PER_COMMAND};
use std::collections::BTreeMap;
use tracing::debug;
use vmrelay_wire::WireStream;

/// Per-region discard queue. Create one at the start of each region's
/// bitmap walk, feed it ranges, and `finish` it at the end.
pub struct DiscardPacker {
    name: String,
    first_bit_offset: u64,
    /// Inclusive (start, end) target-page ranges, region-relative.
    ranges: Vec<(u64, u64)>,
    words_sent: usize,
    commands_sent: usize,
}

impl DiscardPacker {
    /// `bitmap_offset` is the bit index where the region begins in the
    /// global RAM bitmap.
    pub fn new(name: &str, bitmap_offset: u64) -> Self {
        DiscardPacker {
            name: name.to_string(),
            first_bit_offset: bitmap_offset % 64,
            ranges: Vec::with_capacity(MAX_DISCARDS_PER_COMMAND),
            words_sent: 0,
            commands_sent: 0,
        }
    }

    /// Queue one inclusive page range; ships a command when the queue is
    /// full.
    pub fn queue_range(
        &mut self,
        f: &mut WireStream,
        start_page: u64,
        end_page: u64,
    ) -> anyhow::Result<()> {
        self.ranges.push((start_page, end_page));
        if self.ranges.len() == MAX_DISCARDS_PER_COMMAND {
            self.flush(f)?;
        }
        Ok(())
    }

    /// Ship whatever is still queued; returns `(words_sent, commands_sent)`.
    pub fn finish(mut self, f: &mut WireStream) -> anyhow::Result<(usize, usize)> {
        if !self.ranges.is_empty() {
            self.flush(f)?;
        }
        debug!(
            name = %self.name,
            words = self.words_sent,
            commands = self.commands_sent,
            "discard send finished"
        );
        Ok((self.words_sent, self.commands_sent))
    }

    fn flush(&mut self, f: &mut WireStream) -> anyhow::Result<()> {
        let mut words: BTreeMap<u64, u64> = BTreeMap::new();
        for (start, end) in self.ranges.drain(..) {
            // Absolute bit positions within the word grid: page p lives at
            // bit p + first_bit_offset.
            let start_bit = start + self.first_bit_offset;
            let end_bit = end + self.first_bit_offset;
            for word in start_bit / 64..=end_bit / 64 {
                let lo = if word == start_bit / 64 {
                    start_bit % 64
                } else {
                    0
                };
                let hi = if word == end_bit / 64 { end_bit % 64 } else { 63 };
                let top = if hi == 63 {
                    u64::MAX
                } else {
                    (1u64 << (hi + 1)) - 1
                };
                let mask = top & !((1u64 << lo) - 1);
                *words.entry(word).or_default() |= mask;
            }
        }

        let pairs: Vec<(u64, u64)> = words.into_iter().collect();
        self.words_sent += pairs.len();
        for chunk in pairs.chunks(MAX_DISCARD_PAIRS_PER_COMMAND) {
            send_postcopy_discard(f, &self.name, self.first_bit_offset as u8, chunk)?;
            self.commands_sent += 1;
        }
        Ok(())
    }
}
