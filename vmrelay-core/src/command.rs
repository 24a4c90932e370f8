// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sending and receiving the control messages multiplexed into a state
//! stream, and the destination→source return-path messages.

use crate::protocol::{Command, RpMessageType, SectionType};
use anyhow::{bail, ensure, Context};
use tracing::debug;
use vmrelay_wire::{SizedBuffer, WireStream};

/// Emit `SECTION_COMMAND, cmd, len, payload` and flush.
pub fn send_command(f: &mut WireStream, cmd: Command, data: &[u8]) -> vmrelay_wire::Result<()> {
    debug!(cmd = cmd.name(), len = data.len(), "sending command");
    f.put_u8(SectionType::Command as u8)?;
    f.put_u16(cmd as u16)?;
    f.put_u16(data.len() as u16)?;
    if !data.is_empty() {
        f.put_buffer(data)?;
    }
    f.flush()
}

pub fn send_open_return_path(f: &mut WireStream) -> vmrelay_wire::Result<()> {
    send_command(f, Command::OpenReturnPath, &[])
}

pub fn send_req_ack(f: &mut WireStream, value: u32) -> vmrelay_wire::Result<()> {
    send_command(f, Command::ReqAck, &value.to_be_bytes())
}

/// Ship a packaged sub-stream: the command carries only the length, the
/// buffer contents follow in-band.
pub fn send_packaged(f: &mut WireStream, buf: &SizedBuffer) -> vmrelay_wire::Result<()> {
    let len = buf.len();
    send_command(f, Command::Packaged, &(len as u32).to_be_bytes())?;
    buf.drain_to(f, len)?;
    f.flush()
}

pub fn send_postcopy_advise(f: &mut WireStream) -> vmrelay_wire::Result<()> {
    send_command(f, Command::PostcopyAdvise, &[])
}

pub fn send_postcopy_listen(f: &mut WireStream) -> vmrelay_wire::Result<()> {
    send_command(f, Command::PostcopyListen, &[])
}

pub fn send_postcopy_run(f: &mut WireStream) -> vmrelay_wire::Result<()> {
    send_command(f, Command::PostcopyRun, &[])
}

/// `status` zero means the postcopy phase ended well.
pub fn send_postcopy_end(f: &mut WireStream, status: u8) -> vmrelay_wire::Result<()> {
    send_command(f, Command::PostcopyEnd, &[status])
}

/// One discard command for `name`: `ver:u8=0, first_bit_offset:u8,
/// name:counted, (start_word:be64, mask:be64)*`.
pub fn send_postcopy_discard(
    f: &mut WireStream,
    name: &str,
    first_bit_offset: u8,
    pairs: &[(u64, u64)],
) -> anyhow::Result<()> {
    ensure!(name.len() < 256, "RAM region name too long: {name}");
    let mut buf = Vec::with_capacity(3 + name.len() + pairs.len() * 16);
    buf.push(0); // version
    buf.push(first_bit_offset);
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    for (start_word, mask) in pairs {
        buf.extend_from_slice(&start_word.to_be_bytes());
        buf.extend_from_slice(&mask.to_be_bytes());
    }
    ensure!(
        buf.len() <= u16::MAX as usize,
        "discard command would overflow its length field"
    );
    send_command(f, Command::PostcopyDiscard, &buf)?;
    Ok(())
}

/// Payload-free COLO verbs.
pub fn send_colo(f: &mut WireStream, cmd: Command) -> vmrelay_wire::Result<()> {
    send_command(f, cmd, &[])
}

/// COLO verbs that carry one 64-bit value (VMSTATE_SIZE).
pub fn send_colo_value(f: &mut WireStream, cmd: Command, value: u64) -> vmrelay_wire::Result<()> {
    send_command(f, cmd, &value.to_be_bytes())
}

/// Command header as read off the stream, after the SECTION_COMMAND tag.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub cmd: Command,
    pub len: u16,
}

/// Read `cmd:u16, len:u16`; unknown command types are fatal.
pub fn read_command_header(f: &mut WireStream) -> anyhow::Result<CommandHeader> {
    let raw = f.get_u16()?;
    let len = f.get_u16()?;
    let cmd = Command::try_from(raw)
        .map_err(|v| anyhow::anyhow!("unknown command {v:#x} (len {len:#x})"))?;
    Ok(CommandHeader { cmd, len })
}

pub(crate) fn check_len(cmd: Command, actual: u16, expected: u16) -> anyhow::Result<()> {
    ensure!(
        actual == expected,
        "{} received with bad length - expecting {expected}, got {actual}",
        cmd.name()
    );
    Ok(())
}

/// Read one full command frame, requiring it to be `want` with an empty
/// payload. Used by the COLO engines on both stream directions.
pub fn expect_command(f: &mut WireStream, want: Command) -> anyhow::Result<()> {
    let got = read_any_command(f)?;
    ensure!(
        got.cmd == want && got.len == 0,
        "expected {} but received {} (len {})",
        want.name(),
        got.cmd.name(),
        got.len
    );
    Ok(())
}

/// Read one full command frame carrying a 64-bit value.
pub fn expect_value_command(f: &mut WireStream, want: Command) -> anyhow::Result<u64> {
    let got = read_any_command(f)?;
    ensure!(
        got.cmd == want,
        "expected {} but received {}",
        want.name(),
        got.cmd.name()
    );
    check_len(want, got.len, 8)?;
    Ok(f.get_u64()?)
}

/// Read a frame that must be a command, returning its header. The payload
/// is left on the stream for the caller.
pub fn read_any_command(f: &mut WireStream) -> anyhow::Result<CommandHeader> {
    let tag = f.get_u8()?;
    ensure!(
        tag == SectionType::Command as u8,
        "expected a command frame, found section type {tag:#x}"
    );
    read_command_header(f)
}

// ---- return path ----

fn send_rp(rp: &mut WireStream, ty: RpMessageType, data: &[u8]) -> vmrelay_wire::Result<()> {
    rp.put_u16(ty as u16)?;
    rp.put_u16(data.len() as u16)?;
    if !data.is_empty() {
        rp.put_buffer(data)?;
    }
    rp.flush()
}

/// Destination is shutting its half down; non-zero status reports an error.
pub fn send_rp_shut(rp: &mut WireStream, status: u32) -> vmrelay_wire::Result<()> {
    send_rp(rp, RpMessageType::Shut, &status.to_be_bytes())
}

pub fn send_rp_ack(rp: &mut WireStream, value: u32) -> vmrelay_wire::Result<()> {
    send_rp(rp, RpMessageType::Ack, &value.to_be_bytes())
}

/// Ask the source for one host page. `name` rides along only when the
/// faulting region changed since the previous request.
pub fn send_rp_req_pages(
    rp: &mut WireStream,
    name: Option<&str>,
    offset: u64,
    len: u32,
) -> vmrelay_wire::Result<()> {
    let name = name.unwrap_or("");
    let mut buf = Vec::with_capacity(13 + name.len());
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    send_rp(rp, RpMessageType::ReqPages, &buf)
}

/// A parsed return-path message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpEvent {
    Shut {
        status: u32,
    },
    Ack {
        value: u32,
    },
    ReqPages {
        /// Absent when the request targets the same region as the previous
        /// one.
        name: Option<String>,
        offset: u64,
        len: u32,
    },
}

/// Read one message off the return path (source side).
pub fn read_rp_message(rp: &mut WireStream) -> anyhow::Result<RpEvent> {
    let raw = rp.get_u16()?;
    let len = rp.get_u16()?;
    let ty = RpMessageType::try_from(raw)
        .map_err(|v| anyhow::anyhow!("unknown return-path message {v:#x}"))?;
    match ty {
        RpMessageType::Shut => {
            ensure!(len == 4, "SHUT with bad length {len}");
            Ok(RpEvent::Shut {
                status: rp.get_u32()?,
            })
        }
        RpMessageType::Ack => {
            ensure!(len == 4, "ACK with bad length {len}");
            Ok(RpEvent::Ack {
                value: rp.get_u32()?,
            })
        }
        RpMessageType::ReqPages => {
            let name = rp.get_counted_string().context("REQ_PAGES region name")?;
            let offset = rp.get_u64()?;
            let page_len = rp.get_u32()?;
            let expect = 1 + name.len() + 12;
            if len as usize != expect {
                bail!("REQ_PAGES length {len} does not match payload {expect}");
            }
            Ok(RpEvent::ReqPages {
                name: (!name.is_empty()).then_some(name),
                offset,
                len: page_len,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vmrelay_wire::SizedBuffer;

    #[test]
    fn command_frame_layout() {
        let buf = SizedBuffer::new();
        let mut f = buf.writer();
        send_req_ack(&mut f, 0x01020304).unwrap();
        assert_eq!(
            buf.to_vec(),
            vec![0x06, 0x00, 0x02, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn expect_command_round_trip() {
        let buf = SizedBuffer::new();
        let mut w = buf.writer();
        send_colo(&mut w, Command::ColoCheckpointReady).unwrap();
        send_colo_value(&mut w, Command::ColoVmstateSize, 0x1122).unwrap();

        let mut r = buf.reader();
        expect_command(&mut r, Command::ColoCheckpointReady).unwrap();
        assert_eq!(
            expect_value_command(&mut r, Command::ColoVmstateSize).unwrap(),
            0x1122
        );
    }

    #[test]
    fn expect_command_rejects_wrong_verb() {
        let buf = SizedBuffer::new();
        let mut w = buf.writer();
        send_colo(&mut w, Command::ColoVmstateSend).unwrap();
        let mut r = buf.reader();
        let err = expect_command(&mut r, Command::ColoCheckpointRequest).unwrap_err();
        assert!(err.to_string().contains("COLO_VMSTATE_SEND"));
    }

    #[test]
    fn rp_messages_round_trip() {
        let buf = SizedBuffer::new();
        let mut w = buf.writer();
        send_rp_shut(&mut w, 1).unwrap();
        send_rp_ack(&mut w, 0xCAFE).unwrap();
        send_rp_req_pages(&mut w, Some("pc.ram"), 0x4000, 4096).unwrap();
        send_rp_req_pages(&mut w, None, 0x5000, 4096).unwrap();

        let mut r = buf.reader();
        assert_eq!(read_rp_message(&mut r).unwrap(), RpEvent::Shut { status: 1 });
        assert_eq!(
            read_rp_message(&mut r).unwrap(),
            RpEvent::Ack { value: 0xCAFE }
        );
        assert_eq!(
            read_rp_message(&mut r).unwrap(),
            RpEvent::ReqPages {
                name: Some("pc.ram".into()),
                offset: 0x4000,
                len: 4096
            }
        );
        assert_eq!(
            read_rp_message(&mut r).unwrap(),
            RpEvent::ReqPages {
                name: None,
                offset: 0x5000,
                len: 4096
            }
        );
    }
}
