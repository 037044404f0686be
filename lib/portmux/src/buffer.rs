//! A contiguous byte buffer for the relay pipelines.
//!
//! ```text
//! ...drained...##### pending #####...free...
//!              ^pos            ^pos+cursize
//! ```
//!
//! Callers refill at the tail while `pos == 0` and drain from `pos` with
//! [`write_to`](Buffer::write_to). A sink that reports would-block (or
//! accepts zero bytes) leaves the buffer untouched and is not an error.

use std::io;

#[derive(Debug)]
pub struct Buffer {
    buf: Box<[u8]>,
    pub(crate) pos: usize,
    pub(crate) cursize: usize,
}

impl Buffer {
    pub fn new(maxsize: usize) -> Self {
        Buffer {
            buf: vec![0; maxsize].into_boxed_slice(),
            pos: 0,
            cursize: 0,
        }
    }

    /// A buffer preloaded with `data` (banner/open/close strings).
    pub fn from_vec(data: Vec<u8>) -> Self {
        let cursize = data.len();
        Buffer {
            buf: data.into_boxed_slice(),
            pos: 0,
            cursize,
        }
    }

    pub fn cursize(&self) -> usize {
        self.cursize
    }

    pub fn maxsize(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursize == 0
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.cursize = 0;
    }

    /// The pending bytes, `cursize` of them starting at `pos`.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.pos..self.pos + self.cursize]
    }

    /// Direct access for fill/rescan paths that index the raw storage the
    /// way the pipeline does (fills happen with `pos == 0`).
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    /// Account for `n` bytes appended at `pos + cursize` by a fill.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.pos + self.cursize + n <= self.buf.len());
        self.cursize += n;
    }

    /// Shrink the pending region to `n` bytes (closeon truncation).
    pub fn truncate(&mut self, n: usize) {
        debug_assert!(n <= self.cursize);
        self.cursize = n;
    }

    /// Write as much pending data as the sink takes. A would-block (or a
    /// zero-byte acceptance) is treated as "wrote nothing, try later"; the
    /// buffer is unchanged and `Ok(0)` is returned. Interrupted writes are
    /// retried in place. `pos` rewinds to 0 once the buffer drains.
    pub fn write_to<W: io::Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        if self.cursize == 0 {
            return Ok(0);
        }
        loop {
            match sink.write(&self.buf[self.pos..self.pos + self.cursize]) {
                Ok(n) => {
                    self.pos += n;
                    self.cursize -= n;
                    if self.cursize == 0 {
                        self.pos = 0;
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
