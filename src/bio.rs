// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Positioned binary I/O over an arbitrary byte store.
//!
//! Everything on disk is big-endian. `BinaryIo` wraps the container with
//! typed integer access plus bounded bulk zero/copy, and the sequential
//! reader/writer pair gives the header and snapshot parsers a cursor over a
//! fixed byte window.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, ByteOrder};

use super::{Error, Result};

/// Buffer size for bulk zero/copy operations.
const SCRATCH_SIZE: usize = 32 * 1024;

/// A random-access byte store with positional semantics.
///
/// There is no shared cursor: every operation names its offset. Short reads
/// and writes are errors, so a successful call transferred the whole buffer.
pub trait DiskIo: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

impl DiskIo for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.write_all_at(buf, offset)
    }
}

/// Typed big-endian access over a `DiskIo` container.
pub struct BinaryIo {
    base: Box<dyn DiskIo>,
}

impl std::fmt::Debug for BinaryIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryIo").finish_non_exhaustive()
    }
}

impl BinaryIo {
    pub fn new<D: DiskIo + 'static>(base: D) -> BinaryIo {
        BinaryIo {
            base: Box::new(base),
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.base.read_at(offset, buf).map_err(Error::Io)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.base.write_at(offset, buf).map_err(Error::Io)
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_at(offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_at(offset, &mut buf)?;
        Ok(BigEndian::read_u16(&buf))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf)?;
        Ok(BigEndian::read_u64(&buf))
    }

    pub fn write_u8(&self, offset: u64, value: u8) -> Result<()> {
        self.write_at(offset, &[value])
    }

    pub fn write_u16(&self, offset: u64, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write_at(offset, &buf)
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write_at(offset, &buf)
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        self.write_at(offset, &buf)
    }

    /// Fills `count` bytes at `offset` with zeros.
    ///
    /// Issued as a sequence of bounded writes; an external observer may see
    /// the range partially zeroed.
    pub fn zero(&self, offset: u64, count: u64) -> Result<()> {
        let buf = vec![0u8; SCRATCH_SIZE.min(count as usize)];
        let mut offset = offset;
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.write_at(offset, &buf[..n])?;
            offset += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Copies `count` bytes from `src` to `dst` within the container.
    ///
    /// The ranges must not overlap.
    pub fn copy(&self, dst: u64, src: u64, count: u64) -> Result<()> {
        let mut buf = vec![0u8; SCRATCH_SIZE.min(count as usize)];
        let mut src = src;
        let mut dst = dst;
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.read_at(src, &mut buf[..n])?;
            self.write_at(dst, &buf[..n])?;
            src += n as u64;
            dst += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }
}

/// A cursor over the byte window `[start, start + size)`.
///
/// Typed reads that would run past the window fail with `ShortRead`.
pub struct SequentialReader<'a> {
    io: &'a BinaryIo,
    start: u64,
    size: u64,
    pos: u64,
}

impl<'a> SequentialReader<'a> {
    pub fn new(io: &'a BinaryIo, start: u64, size: u64) -> SequentialReader<'a> {
        SequentialReader {
            io,
            start,
            size,
            pos: 0,
        }
    }

    /// Bytes left in the window.
    pub fn remain(&self) -> u64 {
        self.size - self.pos
    }

    /// Current offset relative to the window start.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn advance(&mut self, n: u64) -> Result<u64> {
        if n > self.remain() {
            return Err(Error::ShortRead);
        }
        let at = self.start + self.pos;
        self.pos += n;
        Ok(at)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let at = self.advance(buf.len() as u64)?;
        self.io.read_at(at, buf)
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(BigEndian::read_u16(&buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(BigEndian::read_u64(&buf))
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.advance(n)?;
        Ok(())
    }

    /// Advances the cursor to the next multiple of `n`.
    pub fn align(&mut self, n: u64) -> Result<()> {
        let rem = self.pos % n;
        if rem != 0 {
            self.skip(n - rem)?;
        }
        Ok(())
    }

    /// Consumes the next `n` bytes and returns an independent reader whose
    /// window is exactly those bytes.
    pub fn sub_reader(&mut self, n: u64) -> Result<SequentialReader<'a>> {
        let at = self.advance(n)?;
        Ok(SequentialReader::new(self.io, at, n))
    }
}

/// Accumulates bytes in memory and writes them in one shot at `commit`.
pub struct SequentialWriter<'a> {
    io: &'a BinaryIo,
    offset: u64,
    buf: Vec<u8>,
}

impl<'a> SequentialWriter<'a> {
    pub fn new(io: &'a BinaryIo, offset: u64) -> SequentialWriter<'a> {
        SequentialWriter {
            io,
            offset,
            buf: Vec::new(),
        }
    }

    /// Size of the uncommitted data.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn write_all(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_u32(&mut self, value: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_u64(&mut self, value: u64) {
        let mut b = [0u8; 8];
        BigEndian::write_u64(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    /// Pads with zeros until the size is a multiple of `n`.
    pub fn align(&mut self, n: usize) {
        let rem = self.buf.len() % n;
        if rem != 0 {
            self.buf.resize(self.buf.len() + n - rem, 0);
        }
    }

    /// Writes the whole buffer to the container in a single call.
    pub fn commit(self) -> Result<()> {
        self.io.write_at(self.offset, &self.buf)
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn test_io() -> BinaryIo {
        BinaryIo::new(TempFile::new().unwrap().into_file())
    }

    #[test]
    fn typed_round_trip() {
        let io = test_io();
        io.write_u64(0, 0x0102_0304_0506_0708).unwrap();
        io.write_u32(8, 0xdead_beef).unwrap();
        io.write_u16(12, 0xcafe).unwrap();
        io.write_u8(14, 0x42).unwrap();
        assert_eq!(io.read_u64(0).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(io.read_u32(8).unwrap(), 0xdead_beef);
        assert_eq!(io.read_u16(12).unwrap(), 0xcafe);
        assert_eq!(io.read_u8(14).unwrap(), 0x42);
        // On-disk order is big-endian.
        assert_eq!(io.read_u8(0).unwrap(), 0x01);
        assert_eq!(io.read_u8(7).unwrap(), 0x08);
    }

    #[test]
    fn zero_and_copy_cross_scratch_boundary() {
        let io = test_io();
        let len = SCRATCH_SIZE as u64 + 100;
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        io.write_at(0, &data).unwrap();
        io.copy(len, 0, len).unwrap();
        let mut copied = vec![0u8; len as usize];
        io.read_at(len, &mut copied).unwrap();
        assert_eq!(copied, data);

        io.zero(0, len).unwrap();
        let mut zeroed = vec![0xffu8; len as usize];
        io.read_at(0, &mut zeroed).unwrap();
        assert!(zeroed.iter().all(|&b| b == 0));
    }

    #[test]
    fn reader_window() {
        let io = test_io();
        io.write_at(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])
            .unwrap();
        let mut r = SequentialReader::new(&io, 2, 8);
        assert_eq!(r.remain(), 8);
        assert_eq!(r.read_u16().unwrap(), 0x0304);
        r.align(4).unwrap();
        assert_eq!(r.position(), 4);
        assert_eq!(r.read_u32().unwrap(), 0x0708_090a);
        // Only two bytes remain; a u32 read must not go through.
        assert!(matches!(r.read_u32().unwrap_err(), Error::ShortRead));
        assert_eq!(r.remain(), 0);
    }

    #[test]
    fn sub_reader_consumes_parent() {
        let io = test_io();
        io.write_at(0, &[0xaa; 16]).unwrap();
        let mut r = SequentialReader::new(&io, 0, 16);
        let mut sub = r.sub_reader(4).unwrap();
        assert_eq!(r.position(), 4);
        assert_eq!(sub.remain(), 4);
        assert_eq!(sub.read_u32().unwrap(), 0xaaaa_aaaa);
        assert!(matches!(sub.read_u8().unwrap_err(), Error::ShortRead));
        assert_eq!(r.remain(), 12);
    }

    #[test]
    fn writer_aligns_and_commits_once() {
        let io = test_io();
        let mut w = SequentialWriter::new(&io, 8);
        w.write_u32(0x1122_3344);
        w.write_u8(0x55);
        w.align(8);
        assert_eq!(w.size(), 8);
        w.write_u16(0x6677);
        w.commit().unwrap();
        assert_eq!(io.read_u32(8).unwrap(), 0x1122_3344);
        assert_eq!(io.read_u8(12).unwrap(), 0x55);
        assert_eq!(io.read_u8(13).unwrap(), 0);
        assert_eq!(io.read_u16(16).unwrap(), 0x6677);
    }
}
