// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::chan::{ByteChannel, ShutdownHandle};
use std::io;
use thiserror::Error;

/// Errors surfaced by [`WireStream`] operations.
///
/// The variants are cheap to clone because a stream latches its first error
/// and re-returns it from every subsequent operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("transport error: {0:?}")]
    Io(io::ErrorKind),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("counted string exceeds 255 bytes")]
    OversizedString,
    #[error("stream was shut down")]
    ShutDown,
    #[error("device error: {0}")]
    Device(String),
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => WireError::UnexpectedEof,
            kind => WireError::Io(kind),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Rate-limit probe consulted between live iterations; receives the number
/// of bytes written so far and returns `true` when the writer should yield.
pub type RateLimit = Box<dyn FnMut(u64) -> bool + Send>;

/// A framed stream over a [`ByteChannel`].
///
/// All integers are big-endian on the wire regardless of host order. The
/// first failing operation poisons the stream: every later call
/// short-circuits with the same error until the caller gives up and checks
/// [`WireStream::last_error`].
pub struct WireStream {
    chan: Box<dyn ByteChannel>,
    error: Option<WireError>,
    written: u64,
    consumed: u64,
    rate_limit: Option<RateLimit>,
}

impl WireStream {
    pub fn new(chan: Box<dyn ByteChannel>) -> Self {
        WireStream {
            chan,
            error: None,
            written: 0,
            consumed: 0,
            rate_limit: None,
        }
    }

    pub fn over(chan: impl ByteChannel + 'static) -> Self {
        Self::new(Box::new(chan))
    }

    /// The latched error, if any operation has failed.
    pub fn last_error(&self) -> Option<WireError> {
        self.error.clone()
    }

    /// Latch an externally detected failure (e.g. a device callback error)
    /// so the surrounding save/load loop unwinds through the usual path.
    pub fn set_error(&mut self, err: WireError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn check(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn latch<T>(&mut self, res: io::Result<T>) -> Result<T> {
        match res {
            Ok(v) => Ok(v),
            Err(e) => {
                let err = WireError::from(e);
                self.error.get_or_insert_with(|| err.clone());
                Err(err)
            }
        }
    }

    /// Bytes written since creation; doubles as the stream position for
    /// sizing persisted snapshots.
    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn total_consumed(&self) -> u64 {
        self.consumed
    }

    pub fn set_rate_limit(&mut self, probe: Option<RateLimit>) {
        self.rate_limit = probe;
    }

    /// Whether the configured rate limit says the writer should yield.
    pub fn rate_limited(&mut self) -> bool {
        let written = self.written;
        match self.rate_limit.as_mut() {
            Some(probe) => probe(written),
            None => false,
        }
    }

    pub fn put_buffer(&mut self, buf: &[u8]) -> Result<()> {
        self.check()?;
        let res = self.chan.write_all(buf);
        self.latch(res)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put_buffer(&[v])
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put_buffer(&v.to_be_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put_buffer(&v.to_be_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put_buffer(&v.to_be_bytes())
    }

    /// One-byte length followed by the raw bytes, not NUL-terminated.
    pub fn put_counted_string(&mut self, s: &str) -> Result<()> {
        if s.len() > u8::MAX as usize {
            return Err(WireError::OversizedString);
        }
        self.put_u8(s.len() as u8)?;
        self.put_buffer(s.as_bytes())
    }

    /// Fill `buf` exactly; anything short of that latches `UnexpectedEof`.
    pub fn get_buffer(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check()?;
        let mut filled = 0;
        while filled < buf.len() {
            let res = self.chan.read(&mut buf[filled..]);
            let n = self.latch(res)?;
            if n == 0 {
                let err = WireError::UnexpectedEof;
                self.error.get_or_insert_with(|| err.clone());
                return Err(err);
            }
            filled += n;
            self.consumed += n as u64;
        }
        Ok(())
    }

    /// A single read; `Ok(0)` is a clean end-of-stream and does not latch.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        let res = self.chan.read(buf);
        let n = self.latch(res)?;
        self.consumed += n as u64;
        Ok(n)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.get_buffer(&mut b)?;
        Ok(b[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.get_buffer(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.get_buffer(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.get_buffer(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn get_counted_string(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let mut buf = vec![0u8; len];
        self.get_buffer(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.check()?;
        let res = self.chan.flush();
        self.latch(res)
    }

    /// Tear the transport down and poison the stream so in-flight users
    /// unwind. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        let res = self.chan.shutdown();
        self.error.get_or_insert(WireError::ShutDown);
        res.map_err(WireError::from)
    }

    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.chan.shutdown_handle()
    }

    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        self.check()?;
        let res = self.chan.set_blocking(blocking);
        self.latch(res)
    }

    /// Derive the opposite-direction stream of a bidirectional transport.
    pub fn return_path(&self) -> Option<Result<WireStream>> {
        self.chan
            .open_return_path()
            .map(|res| res.map(WireStream::new).map_err(WireError::from))
    }
}

impl std::fmt::Debug for WireStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireStream")
            .field("error", &self.error)
            .field("written", &self.written)
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SizedBuffer;
    use pretty_assertions::assert_eq;

    fn roundtrip() -> (SizedBuffer, WireStream) {
        let buf = SizedBuffer::new();
        let w = buf.writer();
        (buf, w)
    }

    #[test]
    fn integers_are_big_endian() {
        let (buf, mut w) = roundtrip();
        w.put_u8(0xAB).unwrap();
        w.put_u16(0x1234).unwrap();
        w.put_u32(0xDEADBEEF).unwrap();
        w.put_u64(0x0102030405060708).unwrap();
        assert_eq!(
            buf.to_vec(),
            vec![
                0xAB, 0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
                0x07, 0x08
            ]
        );

        let mut r = buf.reader();
        assert_eq!(r.get_u8().unwrap(), 0xAB);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.get_u64().unwrap(), 0x0102030405060708);
    }

    #[test]
    fn counted_string_roundtrip_at_limit() {
        let (buf, mut w) = roundtrip();
        let max = "x".repeat(255);
        w.put_counted_string(&max).unwrap();
        let mut r = buf.reader();
        assert_eq!(r.get_counted_string().unwrap(), max);
    }

    #[test]
    fn counted_string_over_limit_is_rejected() {
        let (buf, mut w) = roundtrip();
        let over = "x".repeat(256);
        assert_eq!(
            w.put_counted_string(&over),
            Err(WireError::OversizedString)
        );
        // The failed put wrote nothing and did not poison the stream.
        assert_eq!(buf.len(), 0);
        assert_eq!(w.last_error(), None);
    }

    #[test]
    fn error_latch_sticks() {
        let buf = SizedBuffer::new();
        let mut r = buf.reader();
        assert_eq!(r.get_u32(), Err(WireError::UnexpectedEof));
        // Even an in-principle satisfiable read now fails the same way.
        assert_eq!(r.get_u8(), Err(WireError::UnexpectedEof));
        assert_eq!(r.last_error(), Some(WireError::UnexpectedEof));
    }

    #[test]
    fn set_error_poisons_future_ops() {
        let (_, mut w) = roundtrip();
        w.set_error(WireError::Device("nvram save failed".into()));
        assert!(matches!(w.put_u8(0), Err(WireError::Device(_))));
    }

    #[test]
    fn rate_limit_probe_sees_written_bytes() {
        let (_, mut w) = roundtrip();
        w.set_rate_limit(Some(Box::new(|written| written >= 4)));
        assert!(!w.rate_limited());
        w.put_u32(7).unwrap();
        assert!(w.rate_limited());
    }

    #[test]
    fn file_backed_stream_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmstate");

        let mut w = WireStream::over(std::fs::File::create(&path).unwrap());
        w.put_u32(0x5145564d).unwrap();
        w.put_counted_string("pc.ram").unwrap();
        w.flush().unwrap();
        assert_eq!(w.total_written(), 4 + 1 + 6);
        drop(w);

        let mut r = WireStream::over(std::fs::File::open(&path).unwrap());
        assert_eq!(r.get_u32().unwrap(), 0x5145564d);
        assert_eq!(r.get_counted_string().unwrap(), "pc.ram");
        // Files have no opposite direction.
        assert!(r.return_path().is_none());
    }

    #[test]
    fn return_path_shares_unix_socket() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut fwd = WireStream::over(a);
        let mut rp = fwd.return_path().unwrap().unwrap();
        let mut peer = WireStream::over(b);

        fwd.put_u32(42).unwrap();
        assert_eq!(peer.get_u32().unwrap(), 42);
        peer.put_u32(99).unwrap();
        assert_eq!(rp.get_u32().unwrap(), 99);
    }
}
