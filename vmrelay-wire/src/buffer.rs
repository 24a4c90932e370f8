// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::chan::ByteChannel;
use crate::stream::{Result, WireStream};
use bytes::BytesMut;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// Chunk granularity for the scatter storage. Device-state checkpoints are
/// typically a few hundred KiB, so growth stays in the tens of chunks.
const CHUNK: usize = 32 * 1024;

#[derive(Default)]
struct Inner {
    chunks: Vec<BytesMut>,
    len: usize,
}

impl Inner {
    fn reserve_tail(&mut self) -> &mut BytesMut {
        let needs_chunk = match self.chunks.last() {
            Some(c) => c.len() == CHUNK,
            None => true,
        };
        if needs_chunk {
            self.chunks.push(BytesMut::with_capacity(CHUNK));
        }
        // Just pushed when empty, so the tail exists.
        #[allow(clippy::unwrap_used)]
        self.chunks.last_mut().unwrap()
    }

    fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let tail = self.reserve_tail();
            let take = data.len().min(CHUNK - tail.len());
            tail.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        self.len = self.chunks.iter().map(BytesMut::len).sum();
    }

    fn truncate(&mut self, len: usize) {
        let mut remaining = len;
        self.chunks.retain_mut(|chunk| {
            if remaining == 0 {
                return false;
            }
            if chunk.len() > remaining {
                chunk.truncate(remaining);
            }
            remaining = remaining.saturating_sub(chunk.len());
            true
        });
        self.len = len.min(self.chunks.iter().map(BytesMut::len).sum());
    }

    fn copy_out(&self, mut pos: usize, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if pos >= chunk.len() {
                pos -= chunk.len();
                continue;
            }
            let take = (chunk.len() - pos).min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&chunk[pos..pos + take]);
            copied += take;
            pos = 0;
            if copied == out.len() {
                break;
            }
        }
        copied
    }
}

/// In-memory scatter/gather buffer used to package a sub-stream for atomic
/// delivery: the COLO device-state checkpoint and postcopy command batches
/// travel through one of these.
///
/// Handles are cheap clones over shared storage, so a writer stream can fill
/// the buffer while the owner keeps a handle for sizing and draining.
#[derive(Clone, Default)]
pub struct SizedBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl SizedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Truncate to `len`, or zero-extend when growing.
    pub fn set_len(&self, len: usize) {
        let mut inner = self.lock();
        if len < inner.len {
            inner.truncate(len);
        } else {
            let grow = len - inner.len;
            if grow > 0 {
                inner.append(&vec![0u8; grow]);
            }
        }
    }

    pub fn clear(&self) {
        self.set_len(0);
    }

    pub fn append(&self, data: &[u8]) {
        self.lock().append(data);
    }

    /// Append exactly `count` bytes from `f`, returning the number actually
    /// transferred; short only when the stream ends early.
    pub fn fill_from(&self, f: &mut WireStream, count: usize) -> Result<usize> {
        let mut moved = 0;
        let mut scratch = [0u8; 4096];
        while moved < count {
            let want = (count - moved).min(scratch.len());
            let n = f.read_some(&mut scratch[..want])?;
            if n == 0 {
                break;
            }
            self.lock().append(&scratch[..n]);
            moved += n;
        }
        Ok(moved)
    }

    /// Write the first `count` buffered bytes into `f`.
    pub fn drain_to(&self, f: &mut WireStream, count: usize) -> Result<()> {
        let mut pos = 0;
        let mut scratch = [0u8; 4096];
        while pos < count {
            let want = (count - pos).min(scratch.len());
            let got = self.lock().copy_out(pos, &mut scratch[..want]);
            if got == 0 {
                break;
            }
            f.put_buffer(&scratch[..got])?;
            pos += got;
        }
        Ok(())
    }

    /// Open a stream that appends into this buffer.
    pub fn writer(&self) -> WireStream {
        WireStream::over(BufferWriter { buf: self.clone() })
    }

    /// Open a stream over the current contents.
    pub fn reader(&self) -> WireStream {
        WireStream::over(BufferReader {
            buf: self.clone(),
            pos: 0,
        })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut out = vec![0u8; inner.len];
        inner.copy_out(0, &mut out);
        out
    }
}

struct BufferWriter {
    buf: SizedBuffer,
}

impl ByteChannel for BufferWriter {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "buffer opened for write",
        ))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buf.append(buf);
        Ok(())
    }
}

struct BufferReader {
    buf: SizedBuffer,
    pos: usize,
}

impl ByteChannel for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buf.lock().copy_out(self.pos, buf);
        self.pos += n;
        Ok(n)
    }

    fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "buffer opened for read",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_and_read_back_across_chunks() {
        let buf = SizedBuffer::new();
        let data: Vec<u8> = (0..CHUNK * 2 + 17).map(|i| (i % 251) as u8).collect();
        buf.append(&data);
        assert_eq!(buf.len(), data.len());
        assert_eq!(buf.to_vec(), data);
    }

    #[test]
    fn set_len_truncates_and_zero_extends() {
        let buf = SizedBuffer::new();
        buf.append(&[1, 2, 3, 4, 5]);
        buf.set_len(2);
        assert_eq!(buf.to_vec(), vec![1, 2]);
        buf.set_len(4);
        assert_eq!(buf.to_vec(), vec![1, 2, 0, 0]);
    }

    #[test]
    fn fill_from_reports_short_reads() {
        let src = SizedBuffer::new();
        src.append(&[9u8; 10]);
        let mut r = src.reader();

        let dst = SizedBuffer::new();
        assert_eq!(dst.fill_from(&mut r, 4).unwrap(), 4);
        // Only 6 bytes left; asking for 10 comes up short.
        assert_eq!(dst.fill_from(&mut r, 10).unwrap(), 6);
        assert_eq!(dst.len(), 10);
    }

    #[test]
    fn drain_to_writes_prefix() {
        let buf = SizedBuffer::new();
        buf.append(&[1, 2, 3, 4]);
        let out = SizedBuffer::new();
        let mut w = out.writer();
        buf.drain_to(&mut w, 3).unwrap();
        assert_eq!(out.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn writer_then_reader_splices_substream() {
        let buf = SizedBuffer::new();
        let mut w = buf.writer();
        w.put_u32(0x5145564d).unwrap();
        w.put_counted_string("cpu/0").unwrap();
        drop(w);

        let mut r = buf.reader();
        assert_eq!(r.get_u32().unwrap(), 0x5145564d);
        assert_eq!(r.get_counted_string().unwrap(), "cpu/0");
    }
}
