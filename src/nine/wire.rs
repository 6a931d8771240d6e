//! Typed marshalling of 9P message bodies.
//!
//! Requests are assembled by a chaining builder and replies read back
//! field-by-field, one method per wire primitive (byte, word, dword,
//! qword, counted string, qid). Large payloads never pass through
//! here; they ride as separately-staged trailer buffers.

use byteorder::{ByteOrder, LittleEndian};

use super::{MsgType, Qid, MAX_NAME, STRMAX};

/// Builder for a request body. The 7-byte `size | type | tag` header is
/// prepended by [`Req::finish`], with `size` covering any trailer.
pub struct Req {
    t: MsgType,
    body: Vec<u8>,
}

impl Req {
    pub fn new(t: MsgType) -> Req {
        Req { t, body: Vec::with_capacity(64) }
    }

    pub fn msg_type(&self) -> MsgType {
        self.t
    }

    pub fn b(mut self, v: u8) -> Req {
        self.body.push(v);
        self
    }

    pub fn w(mut self, v: u16) -> Req {
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn d(mut self, v: u32) -> Req {
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn q(mut self, v: u64) -> Req {
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// A counted string: 2-byte length then bytes, no terminator.
    pub fn s(mut self, v: &str) -> Req {
        assert!(v.len() <= MAX_NAME, "string too long for a 9P request");
        self.body.extend_from_slice(&(v.len() as u16).to_le_bytes());
        self.body.extend_from_slice(v.as_bytes());
        self
    }

    /// Header + body. `trailer_len` is the length of the trailer that
    /// will be chained behind these bytes on the wire.
    pub fn finish(self, tag: u16, trailer_len: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.body.len());
        let size = 7 + self.body.len() as u32 + trailer_len;
        out.extend_from_slice(&size.to_le_bytes());
        out.push(self.t as u8);
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Field-by-field reader over a reply buffer, positioned after the
/// 7-byte header. The buffer is allocated to the reply's worst-case
/// shape and zero-filled, so a well-formed reply can never run the
/// reader off the end.
pub struct Reply {
    buf: Vec<u8>,
    pos: usize,
}

impl Reply {
    pub fn new(buf: Vec<u8>) -> Reply {
        Reply { buf, pos: 7 }
    }

    pub fn msg_type(&self) -> u8 {
        self.buf[4]
    }

    pub fn b(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    pub fn w(&mut self) -> u16 {
        let v = LittleEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        v
    }

    pub fn d(&mut self) -> u32 {
        let v = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        v
    }

    pub fn q(&mut self) -> u64 {
        let v = LittleEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        v
    }

    pub fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    /// A counted string, clamped to [`STRMAX`] bytes.
    pub fn s(&mut self) -> String {
        let len = self.w() as usize;
        let take = len.min(STRMAX).min(self.buf.len() - self.pos);
        let s = String::from_utf8_lossy(&self.buf[self.pos..self.pos + take]).into_owned();
        self.pos += len.min(self.buf.len() - self.pos);
        s
    }

    pub fn qid(&mut self) -> Qid {
        let typ = self.b();
        let version = self.d();
        let path = self.q();
        Qid { typ, version, path }
    }
}

/// Parse a 13-byte qid out of a raw buffer (walk replies carry them in
/// a trailer).
pub fn qid_at(buf: &[u8], at: usize) -> Qid {
    Qid {
        typ: buf[at],
        version: LittleEndian::read_u32(&buf[at + 1..]),
        path: LittleEndian::read_u64(&buf[at + 5..]),
    }
}
