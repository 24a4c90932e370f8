// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-the-wire constants. All integers are big-endian; the frame shapes are
//! documented on each type.

/// First four bytes of every state stream.
pub const FILE_MAGIC: u32 = 0x5145_564d;
/// Current stream format version.
pub const FILE_VERSION: u32 = 0x0000_0005;
/// Last pre-section format; recognized only to refuse it by name.
pub const FILE_VERSION_OBSOLETE: u32 = 0x0000_0003;

/// One-byte tag in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionType {
    /// `section_id:u32, name:counted, instance_id:u32, version_id:u32, payload`
    Start = 0x01,
    /// `section_id:u32, payload`
    Part = 0x02,
    /// `section_id:u32, payload`
    End = 0x03,
    /// Same header as `Start`, full state payload.
    Full = 0x04,
    /// End of stream.
    Eof = 0x05,
    /// `cmd:u16, len:u16, payload[len]`
    Command = 0x06,
}

impl TryFrom<u8> for SectionType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            0x01 => SectionType::Start,
            0x02 => SectionType::Part,
            0x03 => SectionType::End,
            0x04 => SectionType::Full,
            0x05 => SectionType::Eof,
            0x06 => SectionType::Command,
            other => return Err(other),
        })
    }
}

/// Control messages multiplexed into the forward stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    OpenReturnPath = 1,
    ReqAck = 2,
    Packaged = 3,
    PostcopyAdvise = 4,
    PostcopyDiscard = 5,
    PostcopyListen = 6,
    PostcopyRun = 7,
    PostcopyEnd = 8,
    ColoCheckpointReady = 9,
    ColoCheckpointRequest = 10,
    ColoVmstateSend = 11,
    ColoVmstateSize = 12,
    ColoVmstateReceived = 13,
    ColoVmstateLoaded = 14,
    ColoGuestShutdown = 15,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::OpenReturnPath => "OPENRP",
            Command::ReqAck => "REQACK",
            Command::Packaged => "PACKAGED",
            Command::PostcopyAdvise => "POSTCOPY_ADVISE",
            Command::PostcopyDiscard => "POSTCOPY_DISCARD",
            Command::PostcopyListen => "POSTCOPY_LISTEN",
            Command::PostcopyRun => "POSTCOPY_RUN",
            Command::PostcopyEnd => "POSTCOPY_END",
            Command::ColoCheckpointReady => "COLO_CHECKPOINT_READY",
            Command::ColoCheckpointRequest => "COLO_CHECKPOINT_REQUEST",
            Command::ColoVmstateSend => "COLO_VMSTATE_SEND",
            Command::ColoVmstateSize => "COLO_VMSTATE_SIZE",
            Command::ColoVmstateReceived => "COLO_VMSTATE_RECEIVED",
            Command::ColoVmstateLoaded => "COLO_VMSTATE_LOADED",
            Command::ColoGuestShutdown => "COLO_GUEST_SHUTDOWN",
        }
    }
}

impl TryFrom<u16> for Command {
    type Error = u16;

    fn try_from(v: u16) -> Result<Self, u16> {
        Ok(match v {
            1 => Command::OpenReturnPath,
            2 => Command::ReqAck,
            3 => Command::Packaged,
            4 => Command::PostcopyAdvise,
            5 => Command::PostcopyDiscard,
            6 => Command::PostcopyListen,
            7 => Command::PostcopyRun,
            8 => Command::PostcopyEnd,
            9 => Command::ColoCheckpointReady,
            10 => Command::ColoCheckpointRequest,
            11 => Command::ColoVmstateSend,
            12 => Command::ColoVmstateSize,
            13 => Command::ColoVmstateReceived,
            14 => Command::ColoVmstateLoaded,
            15 => Command::ColoGuestShutdown,
            other => return Err(other),
        })
    }
}

/// Destination→source messages on the return path (`type:u16, len:u16,
/// payload`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RpMessageType {
    Shut = 1,
    Ack = 2,
    ReqPages = 3,
}

impl TryFrom<u16> for RpMessageType {
    type Error = u16;

    fn try_from(v: u16) -> Result<Self, u16> {
        Ok(match v {
            1 => RpMessageType::Shut,
            2 => RpMessageType::Ack,
            3 => RpMessageType::ReqPages,
            other => return Err(other),
        })
    }
}

// ORable flags a command handler returns to steer the load loop.
/// Stop reading from the current stream.
pub const EXIT_QUITLOOP: u32 = 1;
/// Propagate the quit one level past a packaged sub-stream.
pub const EXIT_QUITPARENT: u32 = 2;
/// Keep the live-entry table alive when the loop exits.
pub const EXIT_KEEPHANDLERS: u32 = 4;

/// Queued discard ranges flushed per POSTCOPY_DISCARD command.
pub const MAX_DISCARDS_PER_COMMAND: usize = 12;

/// Cap on `(start_word, mask)` pairs in one discard command so the u16
/// length field can always hold the payload.
pub const MAX_DISCARD_PAIRS_PER_COMMAND: usize = 4000;
