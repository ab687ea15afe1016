//! Stream abstraction: seekable byte sources/sinks, windowed views, raw
//! capture, and the bit-level cursor shared by consecutive bit fields.

use crate::error::{Error, Result};
use std::any::Any;
use std::cell::RefCell;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

/// A random-access byte stream. Anything that is `Read + Write + Seek` (files,
/// `Cursor<Vec<u8>>`, ...) qualifies; `into_any` lets the engine hand an owned
/// stream back to the caller after parsing or emitting.
pub trait Stream: Read + Write + Seek + Any {
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Read + Write + Seek + Any> Stream for T {
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// The stream handle shared by a parse/emit operation and any lazy proxies it
/// leaves behind. Single-threaded by design.
pub(crate) type SharedStream = Rc<RefCell<BitStream>>;

pub(crate) fn share(stream: Box<dyn Stream>) -> SharedStream {
    Rc::new(RefCell::new(BitStream::new(stream)))
}

/// A stream wrapper adding a bit cursor: up to 7 bits are buffered between
/// consecutive bit-field reads or writes, MSB-first within each byte. All
/// byte-level operations insist on byte alignment; a misaligned transition out
/// of a run of bit fields is an error.
pub struct BitStream {
    raw: Box<dyn Stream>,
    /// Bits (0/1) left over from a partially consumed byte, MSB-first.
    read_bits: Vec<u8>,
    /// Bits queued for writing; always fewer than 8 (whole bytes flush).
    write_bits: Vec<u8>,
}

impl BitStream {
    pub fn new(raw: Box<dyn Stream>) -> Self {
        BitStream { raw, read_bits: Vec::new(), write_bits: Vec::new() }
    }

    pub fn into_inner(self) -> Box<dyn Stream> {
        self.raw
    }

    fn check_aligned(&self) -> Result<()> {
        let pending = self.read_bits.len() + self.write_bits.len();
        if pending != 0 {
            return Err(Error::unknown_length(format!(
                "a field following a bit field is misaligned; {} bits still buffered",
                pending
            )));
        }
        Ok(())
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.raw.stream_position()?)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_aligned()?;
        Ok(self.raw.seek(pos)?)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_aligned()?;
        Ok(self.raw.read(buf)?)
    }

    /// Reads up to `n` bytes, looping until `n` are available or the stream
    /// ends. Fewer than `n` returned bytes means end-of-stream.
    pub fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>> {
        self.check_aligned()?;
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = self.raw.read(&mut out[filled..])?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        out.truncate(filled);
        Ok(out)
    }

    pub fn read_until_eof(&mut self) -> Result<Vec<u8>> {
        self.check_aligned()?;
        let mut out = Vec::new();
        self.raw.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_aligned()?;
        self.raw.write_all(buf)?;
        Ok(buf.len())
    }

    /// Reads `count` bits, consuming buffered bits first. Returns the bits as
    /// an MSB-first integer and the number of bytes actually read from the
    /// underlying stream (which may be zero).
    pub fn read_bits(&mut self, count: usize) -> Result<(u64, u64)> {
        if count > 64 {
            return Err(Error::definition(format!(
                "cannot read {} bits into a 64-bit value",
                count
            )));
        }
        let mut result: u64 = 0;
        let mut taken = 0;
        let mut bytes_read = 0u64;
        while taken < count {
            if self.read_bits.is_empty() {
                let mut byte = [0u8; 1];
                let got = self.raw.read(&mut byte)?;
                if got == 0 {
                    return Err(Error::stream_exhausted(
                        "ran out of bytes while reading bits",
                    ));
                }
                bytes_read += 1;
                for i in (0..8).rev() {
                    self.read_bits.push((byte[0] >> i) & 1);
                }
            }
            let take = (count - taken).min(self.read_bits.len());
            for bit in self.read_bits.drain(..take) {
                result = (result << 1) | bit as u64;
            }
            taken += take;
        }
        Ok((result, bytes_read))
    }

    /// Queues `count` bits of `value` for writing; whole bytes are flushed to
    /// the stream as they fill up. Returns the number of bytes written.
    pub fn write_bits(&mut self, value: u64, count: usize) -> Result<u64> {
        if count > 64 {
            return Err(Error::definition(format!(
                "cannot write {} bits from a 64-bit value",
                count
            )));
        }
        for i in (0..count).rev() {
            self.write_bits.push(((value >> i) & 1) as u8);
        }
        let whole = self.write_bits.len() / 8 * 8;
        let bits: Vec<u8> = self.write_bits.drain(..whole).collect();
        self.flush_bit_run(&bits)
    }

    /// Pads any queued write bits with zeros up to a byte boundary and writes
    /// them out. Returns the number of bytes written (zero or one).
    pub fn finalize_bits(&mut self) -> Result<u64> {
        if self.write_bits.is_empty() {
            return Ok(0);
        }
        let mut bits = std::mem::take(&mut self.write_bits);
        while bits.len() % 8 != 0 {
            bits.push(0);
        }
        self.flush_bit_run(&bits)
    }

    /// Drops buffered read bits so the next read starts at the following byte.
    pub fn discard_read_bits(&mut self) {
        self.read_bits.clear();
    }

    pub fn pending_bits(&self) -> usize {
        self.read_bits.len() + self.write_bits.len()
    }

    fn flush_bit_run(&mut self, bits: &[u8]) -> Result<u64> {
        debug_assert!(bits.len() % 8 == 0);
        let mut bytes = Vec::with_capacity(bits.len() / 8);
        for chunk in bits.chunks(8) {
            let mut byte = 0u8;
            for bit in chunk {
                byte = (byte << 1) | bit;
            }
            bytes.push(byte);
        }
        self.raw.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }
}

/// A windowed view of a shared stream: positions are relative to `start` and
/// reads/writes never cross the `length` boundary when one is set. Seeks and
/// reads move the underlying stream cursor, so parent and view stay in step.
pub(crate) struct Substream {
    raw: SharedStream,
    start: u64,
    length: Option<u64>,
}

impl Substream {
    pub fn new(raw: SharedStream, length: Option<u64>) -> Result<Self> {
        let start = raw.borrow_mut().tell()?;
        Ok(Substream { raw, start, length })
    }

    fn position(&self) -> io::Result<u64> {
        let pos = self.raw.borrow_mut().tell().map_err(io::Error::from)?;
        let mut rel = pos.saturating_sub(self.start);
        if let Some(len) = self.length {
            rel = rel.min(len);
        }
        Ok(rel)
    }

    fn cap(&self, rel: u64, wanted: usize) -> usize {
        match self.length {
            None => wanted,
            Some(len) => wanted.min(len.saturating_sub(rel) as usize),
        }
    }
}

impl Read for Substream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rel = self.position()?;
        let cap = self.cap(rel, buf.len());
        if cap == 0 {
            return Ok(0);
        }
        let mut raw = self.raw.borrow_mut();
        raw.seek(SeekFrom::Start(self.start + rel))
            .map_err(io::Error::from)?;
        raw.read(&mut buf[..cap]).map_err(io::Error::from)
    }
}

impl Write for Substream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let rel = self.position()?;
        let cap = self.cap(rel, buf.len());
        if cap < buf.len() {
            return Err(Error::write(format!(
                "attempting to write {} bytes where only {} fit",
                buf.len(),
                cap
            ))
            .into());
        }
        let mut raw = self.raw.borrow_mut();
        raw.seek(SeekFrom::Start(self.start + rel))
            .map_err(io::Error::from)?;
        raw.write(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Substream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let rel = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(off) => {
                let cur = self.position()? as i64;
                (cur + off).max(0) as u64
            }
            SeekFrom::End(off) => match self.length {
                Some(len) => (len as i64 + off).max(0) as u64,
                None => {
                    // Unbounded view: delegate to the end of the raw stream.
                    let abs = self
                        .raw
                        .borrow_mut()
                        .seek(SeekFrom::End(off))
                        .map_err(io::Error::from)?;
                    return Ok(abs.saturating_sub(self.start));
                }
            },
        };
        let rel = match self.length {
            Some(len) => rel.min(len),
            None => rel,
        };
        self.raw
            .borrow_mut()
            .seek(SeekFrom::Start(self.start + rel))
            .map_err(io::Error::from)?;
        Ok(rel)
    }
}

/// A stream wrapper that mirrors every byte read or written into an internal
/// cache at the same offsets, so the raw bytes of a region can be recovered
/// after the fact even when the source cannot be rewound.
pub struct CaptureStream<S> {
    inner: S,
    cache: Cursor<Vec<u8>>,
}

impl<S: Stream> CaptureStream<S> {
    pub fn new(mut inner: S) -> io::Result<Self> {
        let pos = inner.stream_position()?;
        let mut cache = Cursor::new(Vec::new());
        cache.set_position(pos);
        Ok(CaptureStream { inner, cache })
    }

    /// The last `count` bytes that passed through, ending at the current
    /// position.
    pub fn cache_read_last(&mut self, count: usize) -> Vec<u8> {
        let end = self.cache.position() as usize;
        let start = end.saturating_sub(count);
        self.cache.get_ref()[start..end.min(self.cache.get_ref().len())].to_vec()
    }

    /// Forgets everything captured so far and restarts at the current offset.
    pub fn cache_reset(&mut self) -> io::Result<()> {
        let pos = self.inner.stream_position()?;
        self.cache = Cursor::new(Vec::new());
        self.cache.set_position(pos);
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Stream> Read for CaptureStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cache.write_all(&buf[..n])?;
        Ok(n)
    }
}

impl<S: Stream> Write for CaptureStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.cache.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Stream> Seek for CaptureStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let abs = self.inner.seek(pos)?;
        self.cache.set_position(abs);
        Ok(abs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(data: &[u8]) -> SharedStream {
        share(Box::new(Cursor::new(data.to_vec())))
    }

    #[test]
    fn bit_reads_cross_byte_boundaries() {
        let s = shared(&[0b1010_1100, 0b0101_0011]);
        let mut s = s.borrow_mut();
        assert_eq!(s.read_bits(3).unwrap(), (0b101, 1));
        assert_eq!(s.read_bits(10).unwrap(), (0b01_1000_1010, 1));
        assert_eq!(s.pending_bits(), 3);
        assert!(s.read(&mut [0u8; 1]).is_err());
        s.discard_read_bits();
        assert_eq!(s.read(&mut [0u8; 1]).unwrap(), 0);
    }

    #[test]
    fn bit_writes_flush_whole_bytes_and_finalize_pads() {
        let s = shared(&[]);
        {
            let mut s = s.borrow_mut();
            assert_eq!(s.write_bits(0b101, 3).unwrap(), 0);
            assert_eq!(s.write_bits(0b11001, 5).unwrap(), 1);
            assert_eq!(s.write_bits(0b11, 2).unwrap(), 0);
            assert_eq!(s.finalize_bits().unwrap(), 1);
        }
        let inner = Rc::try_unwrap(s).ok().unwrap().into_inner().into_inner();
        let cursor = inner.into_any().downcast::<Cursor<Vec<u8>>>().unwrap();
        assert_eq!(cursor.into_inner(), vec![0b1011_1001, 0b1100_0000]);
    }

    #[test]
    fn substream_caps_reads_and_seeks() {
        let s = shared(b"abcdefgh");
        s.borrow_mut().seek(SeekFrom::Start(2)).unwrap();
        let mut sub = Substream::new(s, Some(3)).unwrap();
        let mut buf = [0u8; 8];
        let n = sub.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"cde");
        assert_eq!(sub.read(&mut buf).unwrap(), 0);
        assert_eq!(sub.seek(SeekFrom::End(-1)).unwrap(), 2);
        assert_eq!(sub.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'e');
    }

    #[test]
    fn substream_rejects_overlong_writes() {
        let s = shared(b"abcdef");
        let mut sub = Substream::new(s, Some(2)).unwrap();
        assert!(sub.write(b"xyz").is_err());
        assert_eq!(sub.write(b"xy").unwrap(), 2);
    }

    #[test]
    fn capture_stream_records_reads() {
        let mut cap = CaptureStream::new(Cursor::new(b"hello world".to_vec())).unwrap();
        let mut buf = [0u8; 5];
        cap.read_exact(&mut buf).unwrap();
        assert_eq!(cap.cache_read_last(5), b"hello");
        cap.seek(SeekFrom::Start(6)).unwrap();
        cap.read_exact(&mut buf).unwrap();
        assert_eq!(cap.cache_read_last(5), b"world");
    }
}
