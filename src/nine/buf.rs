//! Buffered reading and writing over single 9P fids.
//!
//! Narrow in application: the Rez/DeRez codec wants cheap sequential
//! byte access with occasional back-patching. Each stream is bound to
//! one fid; the caller lends the stream to an operation together with
//! the client it should do its IO through.
//!
//! The borrow/return protocol: `borrow(min)` hands out a window of at
//! least `min` contiguous bytes (reads past end-of-file appear as
//! zeros, so scanners can stop on NUL); `give_back(n)` advances the
//! logical mark by what was actually consumed or produced. Borrowing
//! twice without returning is a caller bug and panics.

use crate::errors::NineResult;

use super::Client;

/// Read-ahead stream.
pub struct ReadStream {
    fid: u32,
    buf: Vec<u8>,
    valid: bool,
    at: u64,
    seek: u64,
    borrowed: bool,
}

impl ReadStream {
    pub fn new(fid: u32, capacity: usize) -> ReadStream {
        ReadStream {
            fid,
            buf: vec![0; capacity],
            valid: false,
            at: 0,
            seek: 0,
            borrowed: false,
        }
    }

    /// Move the logical mark. Not legal while a borrow is out.
    pub fn seek(&mut self, to: u64) {
        assert!(!self.borrowed, "seek before returning the borrow");
        self.seek = to;
    }

    pub fn tell(&self) -> u64 {
        self.seek
    }

    /// Borrow at least `min` contiguous bytes starting at the mark.
    /// The returned window runs to the end of the internal buffer and
    /// is zero-extended past end-of-file.
    pub async fn borrow<'a>(&'a mut self, nine: &mut Client, min: usize) -> NineResult<&'a [u8]> {
        assert!(!self.borrowed, "borrow while a borrow is outstanding");
        assert!(min > 0 && min <= self.buf.len());

        // Fast path: the window already holds enough
        if self.valid
            && self.seek >= self.at
            && self.seek + min as u64 <= self.at + self.buf.len() as u64
        {
            self.borrowed = true;
            let off = (self.seek - self.at) as usize;
            return Ok(&self.buf[off..]);
        }

        // Salvage what the buffer still covers, moving it left
        let mut salvaged = 0usize;
        if self.valid && self.seek >= self.at && self.at + self.buf.len() as u64 > self.seek {
            let off = (self.seek - self.at) as usize;
            salvaged = self.buf.len() - off;
            self.buf.copy_within(off.., 0);
        }

        // One expensive read call for the rest
        let got = nine
            .read(self.fid, &mut self.buf[salvaged..], self.seek + salvaged as u64)
            .await? as usize;
        for b in &mut self.buf[salvaged + got..] {
            *b = 0; // nulls past EOF keep textual scanning safe
        }

        self.valid = true;
        self.at = self.seek;
        self.borrowed = true;
        Ok(&self.buf[..])
    }

    /// Return a borrow, advancing the mark by `consumed` bytes.
    pub fn give_back(&mut self, consumed: usize) {
        assert!(self.borrowed, "give back without borrowing");
        self.seek += consumed as u64;
        self.borrowed = false;
    }

    /// The byte at the mark (0 past end-of-file).
    pub async fn peek(&mut self, nine: &mut Client) -> NineResult<u8> {
        let b = self.borrow(nine, 1).await?[0];
        self.give_back(0);
        Ok(b)
    }

    /// Consume and return the byte at the mark.
    pub async fn read_byte(&mut self, nine: &mut Client) -> NineResult<u8> {
        let b = self.borrow(nine, 1).await?[0];
        self.give_back(1);
        Ok(b)
    }

    /// Consume the byte at the mark only if it is `want`.
    pub async fn read_if(&mut self, nine: &mut Client, want: u8) -> NineResult<bool> {
        let b = self.borrow(nine, 1).await?[0];
        let hit = b == want;
        self.give_back(hit as usize);
        Ok(hit)
    }
}

/// Write-behind stream.
pub struct WriteStream {
    fid: u32,
    buf: Vec<u8>,
    cnt: usize,
    at: u64,
    seek: u64,
    borrowed: bool,
}

impl WriteStream {
    pub fn new(fid: u32, capacity: usize) -> WriteStream {
        WriteStream {
            fid,
            buf: vec![0; capacity],
            cnt: 0,
            at: 0,
            seek: 0,
            borrowed: false,
        }
    }

    /// Position an empty stream at a file offset.
    pub fn start_at(&mut self, offset: u64) {
        assert!(self.cnt == 0 && !self.borrowed);
        self.at = offset;
        self.seek = offset;
    }

    pub fn tell(&self) -> u64 {
        self.seek
    }

    /// Enlarge the buffer (a read buffer being rededicated to writing).
    pub fn grow(&mut self, capacity: usize) {
        assert!(capacity >= self.buf.len());
        self.buf.resize(capacity, 0);
    }

    /// Buffered write of a byte.
    pub async fn put(&mut self, nine: &mut Client, byte: u8) -> NineResult<()> {
        if self.cnt >= self.buf.len() {
            self.flush(nine).await?;
        }
        self.buf[self.cnt] = byte;
        self.cnt += 1;
        self.seek += 1;
        Ok(())
    }

    /// Buffered write of a slice.
    pub async fn push(&mut self, nine: &mut Client, bytes: &[u8]) -> NineResult<()> {
        if self.cnt + bytes.len() > self.buf.len() {
            self.flush(nine).await?;
        }
        if bytes.len() >= self.buf.len() {
            // Oversized: straight through
            nine.write_all(self.fid, bytes, self.seek).await?;
            self.seek += bytes.len() as u64;
            self.at = self.seek;
            return Ok(());
        }
        self.buf[self.cnt..self.cnt + bytes.len()].copy_from_slice(bytes);
        self.cnt += bytes.len();
        self.seek += bytes.len() as u64;
        Ok(())
    }

    /// Push everything buffered to the remote file.
    pub async fn flush(&mut self, nine: &mut Client) -> NineResult<()> {
        if self.cnt > 0 {
            let (fid, at) = (self.fid, self.at);
            nine.write_all(fid, &self.buf[..self.cnt], at).await?;
        }
        self.at = self.seek;
        self.cnt = 0;
        Ok(())
    }

    /// Back-patch bytes that were already written through this stream,
    /// whether or not they have been flushed yet. The only operation
    /// allowed to modify previously written bytes.
    pub async fn overwrite(&mut self, nine: &mut Client, at: u64, bytes: &[u8]) -> NineResult<()> {
        let mut patched = 0usize;
        for (i, &b) in bytes.iter().enumerate() {
            let pos = at + i as u64;
            if pos >= self.at && pos < self.at + self.cnt as u64 {
                self.buf[(pos - self.at) as usize] = b;
                patched += 1;
            }
        }

        // Bytes already flushed need an out-of-band write
        if patched < bytes.len() {
            nine.write_all(self.fid, bytes, at).await?;
        }
        Ok(())
    }

    /// Borrow at least `min` bytes of buffer space to produce into.
    pub async fn borrow<'a>(&'a mut self, nine: &mut Client, min: usize) -> NineResult<&'a mut [u8]> {
        assert!(!self.borrowed, "borrow while a borrow is outstanding");
        assert!(min > 0 && min <= self.buf.len());
        if self.buf.len() - self.cnt < min {
            self.flush(nine).await?;
        }
        self.borrowed = true;
        Ok(&mut self.buf[self.cnt..])
    }

    /// Return a write borrow, committing `produced` bytes.
    pub fn give_back(&mut self, produced: usize) {
        assert!(self.borrowed, "give back without borrowing");
        self.cnt += produced;
        self.seek += produced as u64;
        assert!(self.cnt <= self.buf.len(), "wrote past end of buffer");
        self.borrowed = false;
    }
}
