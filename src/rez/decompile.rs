//! Binary resource fork to Rez text.
//!
//! The map is read whole (it is small); bodies stream through a
//! buffered reader and come out as 16-byte hex rows with an ASCII
//! gloss. The gloss dodges `*/` sequences so it can never terminate
//! its own comment.

use byteorder::{BigEndian, ByteOrder};

use crate::errors::{Errno, NineResult};
use crate::nine::buf::{ReadStream, WriteStream};
use crate::nine::Client;

use super::ATTR_NAMES;

const RB: usize = 32 * 1024;
const WB: usize = 32 * 1024;

/// Decompile the resource fork image open on `fork_fid` into Rez text
/// on `text_fid`.
pub async fn derez(nine: &mut Client, fork_fid: u32, text_fid: u32) -> NineResult<()> {
    let mut head = [0u8; 16];
    if nine.read(fork_fid, &mut head, 0).await? < 16 {
        return Ok(()); // an empty fork decompiles to nothing
    }
    let data_off = BigEndian::read_u32(&head[0..]) as u64;
    let map_off = BigEndian::read_u32(&head[4..]) as u64;
    let map_len = BigEndian::read_u32(&head[12..]) as usize;

    let mut map = vec![0u8; map_len];
    let mut got = 0usize;
    while got < map_len {
        let n = nine.read(fork_fid, &mut map[got..], map_off + got as u64).await? as usize;
        if n == 0 {
            panic!("resource map truncated");
        }
        got += n;
    }

    let type_list = BigEndian::read_u16(&map[24..]) as usize;
    let name_list = BigEndian::read_u16(&map[26..]) as usize;
    let ntype = BigEndian::read_u16(&map[type_list..]).wrapping_add(1) as usize;

    let mut rs = ReadStream::new(fork_fid, RB);
    let mut ws = WriteStream::new(text_fid, WB);

    for t in 0..ntype {
        let te = type_list + 2 + 8 * t;
        let fourcc = &map[te..te + 4];
        let count = BigEndian::read_u16(&map[te + 4..]) as usize + 1;
        let refs = type_list + BigEndian::read_u16(&map[te + 6..]) as usize;

        for r in 0..count {
            let re = refs + 12 * r;
            let id = BigEndian::read_i16(&map[re..]);
            let nameoff = BigEndian::read_u16(&map[re + 2..]);
            let attrandoff = BigEndian::read_u32(&map[re + 4..]);
            let attrib = (attrandoff >> 24) as u8;
            let body_off = (attrandoff & 0xff_ffff) as u64;

            let name = if nameoff != 0xffff {
                let at = name_list + nameoff as usize;
                let len = map[at] as usize;
                Some(map[at + 1..at + 1 + len].to_vec())
            } else {
                None
            };

            let mut lenbuf = [0u8; 4];
            if nine.read(fork_fid, &mut lenbuf, data_off + body_off).await? < 4 {
                return Err(Errno::EIO);
            }
            let body_len = BigEndian::read_u32(&lenbuf);

            header_line(nine, &mut ws, attrib, fourcc, id, name.as_deref()).await?;
            rs.seek(data_off + body_off + 4);
            body_rows(nine, &mut rs, &mut ws, body_len).await?;
            ws.push(nine, b"};\n\n").await?;
        }
    }

    ws.flush(nine).await
}

/// `data 'TYPE' (id, "name", attrs) {`
async fn header_line(
    nine: &mut Client,
    ws: &mut WriteStream,
    attrib: u8,
    fourcc: &[u8],
    id: i16,
    name: Option<&[u8]>,
) -> NineResult<()> {
    let mut line: Vec<u8> = Vec::with_capacity(128);
    line.extend_from_slice(b"data '");
    for &b in fourcc {
        escape_into(&mut line, b, b'\'');
    }
    line.extend_from_slice(b"' (");
    line.extend_from_slice(id.to_string().as_bytes());

    if let Some(n) = name {
        line.extend_from_slice(b", \"");
        for &b in n {
            escape_into(&mut line, b, b'"');
        }
        line.push(b'"');
    }

    if attrib & 0x83 != 0 {
        line.extend_from_slice(format!(", ${:02X}", attrib).as_bytes());
    } else {
        for &(bit, word) in ATTR_NAMES {
            if attrib & bit != 0 {
                line.extend_from_slice(b", ");
                line.extend_from_slice(word.as_bytes());
            }
        }
    }

    line.extend_from_slice(b") {\n");
    ws.push(nine, &line).await
}

/// 16 bytes per row: tab, `$"`, space-grouped hex pairs, then the
/// ASCII gloss in a comment column.
async fn body_rows(
    nine: &mut Client,
    rs: &mut ReadStream,
    ws: &mut WriteStream,
    mut len: u32,
) -> NineResult<()> {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    const COMOFF: usize = 58;

    while len > 0 {
        let n = len.min(16) as usize;

        let mut line = [b' '; COMOFF + 16 + 4];
        line[0] = b'\t';
        line[1] = b'$';
        line[2] = b'"';
        line[55] = b'/';
        line[56] = b'*';

        let mut hexoff = 2usize;
        let mut comoff = COMOFF;
        let mut space = true;
        let mut noslash = false;

        for _ in 0..n {
            let c = rs.read_byte(nine).await?;

            if space {
                hexoff += 1;
            }
            space = !space;
            line[hexoff] = HEX[(c >> 4) as usize];
            line[hexoff + 1] = HEX[(c & 0xf) as usize];
            hexoff += 2;

            if c == b'*' {
                line[comoff] = b'*';
                noslash = true;
            } else if c == b'/' {
                line[comoff] = if noslash { b'.' } else { b'/' };
            } else if c < 32 {
                line[comoff] = b'.';
                // a control char leaves noslash alone
            } else if c >= 127 {
                line[comoff] = b'.';
                noslash = false;
            } else {
                line[comoff] = c;
                noslash = false;
            }
            comoff += 1;
        }

        line[hexoff] = b'"';
        line[comoff..comoff + 4].copy_from_slice(b" */\n");

        len -= n as u32;
        ws.push(nine, &line[..comoff + 4]).await?;
    }

    Ok(())
}

/// One byte of a quoted run, escaped for the given quote mark.
fn escape_into(out: &mut Vec<u8>, b: u8, mark: u8) {
    if b == mark {
        out.push(b'\\');
        out.push(b);
        return;
    }
    match b {
        8 => out.extend_from_slice(b"\\b"),
        9 => out.extend_from_slice(b"\\t"),
        10 => out.extend_from_slice(b"\\r"), // CR/LF swapped in this dialect
        11 => out.extend_from_slice(b"\\v"),
        12 => out.extend_from_slice(b"\\f"),
        13 => out.extend_from_slice(b"\\n"),
        127 => out.extend_from_slice(b"\\?"),
        b'\\' => out.extend_from_slice(b"\\\\"),
        0x20..=0x7E => out.push(b),
        other => out.extend_from_slice(format!("\\0x{:02X}", other).as_bytes()),
    }
}
