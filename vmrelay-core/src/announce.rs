// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-migration self announce: gratuitous RARP frames so switches learn
//! which port the guest's MACs moved to.

use crate::vm::{MacAddr, NicAnnounce};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

const ETH_P_RARP: u16 = 0x8035;
const ARP_HTYPE_ETH: u16 = 0x0001;
const ARP_PTYPE_IP: u16 = 0x0800;
const ARP_OP_REQUEST_REV: u16 = 0x3;

pub const SELF_ANNOUNCE_ROUNDS: u32 = 5;

// 50ms, 150ms, 250ms, ...
fn self_announce_delay(round: u32) -> Duration {
    Duration::from_millis(50 + (SELF_ANNOUNCE_ROUNDS - round - 1) as u64 * 100)
}

/// A minimum-size reverse-ARP request for `mac`; the FCS is the NIC's job.
pub fn build_rarp_frame(mac: &MacAddr) -> [u8; 60] {
    let mut buf = [0u8; 60];
    // Ethernet header.
    buf[0..6].fill(0xFF); // destination: broadcast
    buf[6..12].copy_from_slice(&mac.0); // source
    buf[12..14].copy_from_slice(&ETH_P_RARP.to_be_bytes());
    // RARP payload.
    buf[14..16].copy_from_slice(&ARP_HTYPE_ETH.to_be_bytes());
    buf[16..18].copy_from_slice(&ARP_PTYPE_IP.to_be_bytes());
    buf[18] = 6; // hardware addr length
    buf[19] = 4; // protocol addr length
    buf[20..22].copy_from_slice(&ARP_OP_REQUEST_REV.to_be_bytes());
    buf[22..28].copy_from_slice(&mac.0); // source hw addr
    buf[32..38].copy_from_slice(&mac.0); // target hw addr
    // Protocol addresses stay zero, padding up to 60 is already zero.
    buf
}

fn announce_round(nic: &dyn NicAnnounce) {
    for mac in nic.macs() {
        debug!(?mac, "announcing");
        nic.send_raw(&build_rarp_frame(&mac));
    }
}

/// Announce every NIC now, then again with growing spacing. Returns the
/// announcer thread's handle so shutdown paths can join it.
pub fn announce_self(nic: Arc<dyn NicAnnounce>) -> JoinHandle<()> {
    announce_round(nic.as_ref());
    std::thread::spawn(move || {
        let mut round = SELF_ANNOUNCE_ROUNDS - 1;
        while round > 0 {
            std::thread::sleep(self_announce_delay(round));
            announce_round(nic.as_ref());
            round -= 1;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MutexExt;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[test]
    fn rarp_frame_layout() {
        let mac = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let frame = build_rarp_frame(&mac);
        assert_eq!(&frame[0..6], &[0xFF; 6]);
        assert_eq!(&frame[6..12], &mac.0);
        assert_eq!(&frame[12..14], &[0x80, 0x35]);
        assert_eq!(&frame[14..22], &[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x03]);
        assert_eq!(&frame[22..28], &mac.0);
        assert_eq!(&frame[28..32], &[0u8; 4]);
        assert_eq!(&frame[32..38], &mac.0);
        assert_eq!(&frame[38..60], &[0u8; 22]);
    }

    struct CountingNic(Mutex<u32>);

    impl NicAnnounce for CountingNic {
        fn macs(&self) -> Vec<MacAddr> {
            vec![MacAddr([2, 0, 0, 0, 0, 1])]
        }

        fn send_raw(&self, frame: &[u8]) {
            assert_eq!(frame.len(), 60);
            *self.0.lock_or_panic() += 1;
        }
    }

    #[test]
    fn announces_five_rounds() {
        let nic = Arc::new(CountingNic(Mutex::new(0)));
        announce_self(nic.clone()).join().unwrap();
        assert_eq!(*nic.0.lock_or_panic(), SELF_ANNOUNCE_ROUNDS);
    }
}
