// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-level plumbing for the migration engine: the framed big-endian
//! stream every section and command travels through, and the sized
//! scatter buffer used to package sub-streams for atomic delivery.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod buffer;
pub mod chan;
pub mod stream;

pub use buffer::SizedBuffer;
pub use chan::{ByteChannel, ShutdownHandle};
pub use stream::{Result, WireError, WireStream};
