// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// A blocking byte transport under a [`crate::WireStream`].
///
/// The migration protocol only ever needs sequential reads and writes; seek
/// is deliberately absent. A transport that is bidirectional can hand out a
/// second channel for the opposite direction via [`ByteChannel::open_return_path`].
pub trait ByteChannel: Send {
    /// Read into `buf`, returning the number of bytes read. `Ok(0)` means
    /// end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Force pending blocking I/O on this channel to fail. Must be
    /// idempotent; on a shared-descriptor transport it may take the peer
    /// direction down with it.
    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }

    /// A handle that can shut the transport down from another thread while
    /// this channel is blocked inside `read` or `write_all`. `None` when the
    /// transport has no out-of-band teardown.
    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        None
    }

    fn set_blocking(&self, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    /// Derive the opposite-direction channel of a bidirectional transport.
    fn open_return_path(&self) -> Option<io::Result<Box<dyn ByteChannel>>> {
        None
    }
}

/// Out-of-band teardown for a channel whose owner is blocked in I/O.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<dyn Fn() -> io::Result<()> + Send + Sync>);

impl ShutdownHandle {
    pub fn new(f: impl Fn() -> io::Result<()> + Send + Sync + 'static) -> Self {
        ShutdownHandle(Arc::new(f))
    }

    pub fn shutdown(&self) -> io::Result<()> {
        (self.0)()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShutdownHandle")
    }
}

impl ByteChannel for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        // The forward and return streams may share this socket, so the
        // second shutdown can observe an already-closed transport.
        match UnixStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        let dup = match self.try_clone() {
            Ok(dup) => dup,
            Err(_) => return None,
        };
        Some(ShutdownHandle::new(move || {
            match UnixStream::shutdown(&dup, Shutdown::Both) {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            }
        }))
    }

    fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        self.set_nonblocking(!blocking)
    }

    fn open_return_path(&self) -> Option<io::Result<Box<dyn ByteChannel>>> {
        Some(
            self.try_clone()
                .map(|s| Box::new(s) as Box<dyn ByteChannel>),
        )
    }
}

/// Files carry persisted snapshot streams; they have no peer direction and
/// nothing to shut down.
impl ByteChannel for std::fs::File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}
