//! Rez text to binary resource fork.
//!
//! The text is slurped sequentially through a buffered reader while the
//! binary is produced through a buffered writer positioned past the
//! 256-byte header. Each resource body is emitted behind a placeholder
//! length that is back-patched once its true size is known; the file
//! header itself is written last of all.

use crate::errors::NineResult;
use crate::nine::buf::{ReadStream, WriteStream};
use crate::nine::Client;

use super::{hex_value, is_ws, MAX_RESOURCES, NAME_LIST_MAX};

const WB: usize = 8 * 1024;
const RB: usize = 32 * 1024;

struct Res {
    type_: u32,
    id: i16,
    nameoff: u16,
    attrandoff: u32,
}

enum Header {
    Eof,
    Res { attrib: u8, type_: u32, id: i16, name: Option<Vec<u8>> },
}

/// Compile the Rez text open on `text_fid` into a resource fork image
/// on `fork_fid`. Returns the total image size. Malformed text is a
/// panic; the sidecar formats are under our own control.
pub async fn rez(nine: &mut Client, text_fid: u32, fork_fid: u32) -> NineResult<u32> {
    let mut rs = ReadStream::new(text_fid, RB);
    let mut ws = WriteStream::new(fork_fid, WB);
    ws.start_at(256);

    let mut resources: Vec<Res> = Vec::new();
    let mut namelist: Vec<u8> = Vec::new();

    loop {
        let (attrib, type_, id, name) = match parse_header(nine, &mut rs).await? {
            Header::Eof => break,
            Header::Res { attrib, type_, id, name } => (attrib, type_, id, name),
        };

        if resources.len() >= MAX_RESOURCES {
            panic!("too many resources in file");
        }

        // 4-byte align the resource, then a length placeholder
        while ws.tell() % 4 != 0 {
            ws.put(nine, 0).await?;
        }
        let attrandoff = ((ws.tell() - 256) as u32) | (attrib as u32) << 24;
        let lenpos = ws.tell();
        ws.push(nine, &[0; 4]).await?;

        parse_body(nine, &mut rs, &mut ws).await?;

        let bodylen = (ws.tell() - lenpos - 4) as u32;
        ws.overwrite(nine, lenpos, &bodylen.to_be_bytes()).await?;

        let nameoff = match name {
            Some(n) => {
                if namelist.len() + 1 + n.len() > NAME_LIST_MAX {
                    panic!("filled name buffer");
                }
                let off = namelist.len() as u16;
                namelist.push(n.len() as u8);
                namelist.extend_from_slice(&n);
                off
            }
            None => 0xffff,
        };

        resources.push(Res { type_, id, nameoff, attrandoff });
    }
    let contentsize = (ws.tell() - 256) as u32;

    // The read buffer is done with; give its memory to the writer
    ws.grow(WB + RB);

    // Group resources of the same type together
    resources.sort_by_key(|r| (r.type_, r.id));
    let mut ntype = 0usize;
    for i in 0..resources.len() {
        if i == 0 || resources[i - 1].type_ != resources[i].type_ {
            ntype += 1;
        }
    }
    let nres = resources.len();

    let mut map: Vec<u8> = Vec::with_capacity(30 + 8 * ntype + 12 * nres + namelist.len());
    // zeroed header copy, reserved, file-ref, attrs
    map.extend_from_slice(&[0; 24]);
    map.extend_from_slice(&28u16.to_be_bytes()); // offset to type list
    map.extend_from_slice(&((28 + 2 + 8 * ntype + 12 * nres) as u16).to_be_bytes());
    map.extend_from_slice(&(ntype.wrapping_sub(1) as u16).to_be_bytes());

    // Type list: per type, fourcc, count-1, ref-list offset from the
    // start of the type list
    let mut base = 2 + 8 * ntype;
    let mut of_type = 0usize;
    for i in 0..nres {
        if i == nres - 1 || resources[i].type_ != resources[i + 1].type_ {
            map.extend_from_slice(&resources[i].type_.to_be_bytes());
            map.extend_from_slice(&(of_type as u16).to_be_bytes());
            map.extend_from_slice(&(base as u16).to_be_bytes());
            base += 12 * (of_type + 1);
            of_type = 0;
        } else {
            of_type += 1;
        }
    }

    // Reference list
    for r in &resources {
        map.extend_from_slice(&r.id.to_be_bytes());
        map.extend_from_slice(&r.nameoff.to_be_bytes());
        map.extend_from_slice(&r.attrandoff.to_be_bytes());
        map.extend_from_slice(&[0; 4]);
    }

    map.extend_from_slice(&namelist);

    ws.push(nine, &map).await?;
    ws.flush(nine).await?;

    // Finally the file header, straight to offset zero
    let maplen = (28 + 2 + 8 * ntype + 12 * nres + namelist.len()) as u32;
    let mut head = [0u8; 16];
    head[0..4].copy_from_slice(&256u32.to_be_bytes());
    head[4..8].copy_from_slice(&(256 + contentsize).to_be_bytes());
    head[8..12].copy_from_slice(&contentsize.to_be_bytes());
    head[12..16].copy_from_slice(&maplen.to_be_bytes());
    nine.write_all(fork_fid, &head, 0).await?;

    Ok(256 + contentsize + maplen)
}

/// Parse one `data 'TYPE' (id, "name", attrs)` directive, or detect
/// end-of-file. Works inside a single borrowed window; a resource
/// header comfortably fits one.
async fn parse_header(nine: &mut Client, rs: &mut ReadStream) -> NineResult<Header> {
    let win = rs.borrow(nine, 2048).await?;
    let mut i = 0usize;

    macro_rules! strip_ws {
        () => {
            while is_ws(win[i]) {
                i += 1;
            }
        };
    }

    strip_ws!();
    if win[i] == 0 {
        rs.give_back(0);
        return Ok(Header::Eof);
    }
    if !win[i..].starts_with(b"data") {
        panic!("resource header: expected 'data'");
    }
    i += 4;
    strip_ws!();

    let type_bytes = quote(win, &mut i, b'\'', 4, 4);
    let type_ = u32::from_be_bytes(type_bytes[..4].try_into().unwrap());
    strip_ws!();

    if win[i] != b'(' {
        panic!("resource header: expected '('");
    }
    i += 1;
    strip_ws!();

    let id_long = integer(win, &mut i);
    if !(-0x8000..=0x7fff).contains(&id_long) {
        panic!("resource header: id out of range");
    }
    let id = id_long as i16;
    strip_ws!();

    let mut name = None;
    let mut attrib: u8 = 0;

    'fields: {
        if win[i] != b',' {
            break 'fields;
        }
        i += 1;
        strip_ws!();

        if win[i] == b'"' {
            name = Some(quote(win, &mut i, b'"', 0, 255));
            strip_ws!();
            if win[i] != b',' {
                break 'fields;
            }
            i += 1;
            strip_ws!();
        }

        if win[i] == b'$' {
            i += 1;
            let hi = hex_value(win[i]).unwrap_or_else(|| panic!("bad $ attribute"));
            let lo = hex_value(win[i + 1]).unwrap_or_else(|| panic!("bad $ attribute"));
            i += 2;
            attrib = hi << 4 | lo;
            strip_ws!();
            break 'fields;
        }

        loop {
            let mut matched = false;
            for &(bit, word) in super::ATTR_NAMES {
                if win[i..].starts_with(word.as_bytes()) {
                    i += word.len();
                    attrib |= bit;
                    matched = true;
                    break;
                }
            }
            if !matched {
                break;
            }
            strip_ws!();
            if win[i] != b',' {
                break 'fields;
            }
            i += 1;
            strip_ws!();
        }
    }

    if win[i] != b')' {
        panic!("resource header: expected ')'");
    }
    i += 1;

    rs.give_back(i);
    Ok(Header::Res { attrib, type_, id, name })
}

/// The body: `{ $"hex..." /* comments */ ... };` streamed through
/// borrowed read and write windows, re-borrowed as either side runs
/// dry.
async fn parse_body(nine: &mut Client, rs: &mut ReadStream, ws: &mut WriteStream) -> NineResult<()> {
    #[derive(Copy, Clone, PartialEq)]
    enum S {
        OpenBrace,
        Stem,
        ExpectStar,
        InComment,
        CommentStar,
        ExpectQuote,
        HexFirst,
        HexSecond(u8),
        AfterBrace,
        Done,
    }

    let mut state = S::OpenBrace;
    'windows: loop {
        let rwin = rs.borrow(nine, 1024).await?;
        let mut i = 0usize;
        let rend = rwin.len();
        // Stash produced bytes locally so the read and write borrows
        // don't have to interleave
        let mut out: Vec<u8> = Vec::with_capacity(512);

        while i < rend {
            let c = rwin[i];
            i += 1;
            state = match state {
                S::OpenBrace => {
                    if is_ws(c) {
                        S::OpenBrace
                    } else if c == b'{' {
                        S::Stem
                    } else {
                        panic!("resource body: expected '{{'");
                    }
                }
                S::Stem => match c {
                    _ if is_ws(c) => S::Stem,
                    b'/' => S::ExpectStar,
                    b'$' => S::ExpectQuote,
                    b'}' => S::AfterBrace,
                    0 => panic!("resource body: unexpected EOF"),
                    _ => panic!("resource body: unexpected char"),
                },
                S::ExpectStar => {
                    if c == b'*' {
                        S::InComment
                    } else {
                        panic!("resource body: expected comment star");
                    }
                }
                S::InComment => match c {
                    b'*' => S::CommentStar,
                    0 => panic!("resource body: unexpected EOF"),
                    _ => S::InComment,
                },
                S::CommentStar => match c {
                    b'/' => S::Stem,
                    b'*' => S::CommentStar,
                    0 => panic!("resource body: unexpected EOF"),
                    _ => S::InComment,
                },
                S::ExpectQuote => {
                    if c == b'"' {
                        S::HexFirst
                    } else {
                        panic!("resource body: expected '\"'");
                    }
                }
                S::HexFirst => {
                    if c == b' ' {
                        S::HexFirst
                    } else if c == b'"' {
                        S::Stem
                    } else if let Some(hi) = hex_value(c) {
                        S::HexSecond(hi)
                    } else {
                        panic!("resource body: bad hex");
                    }
                }
                S::HexSecond(hi) => {
                    let lo = hex_value(c).unwrap_or_else(|| panic!("resource body: bad hex"));
                    out.push(hi << 4 | lo);
                    S::HexFirst
                }
                S::AfterBrace => {
                    if is_ws(c) {
                        S::AfterBrace
                    } else if c == b';' {
                        S::Done
                    } else {
                        panic!("resource body: expected ';' after '}}'");
                    }
                }
                S::Done => unreachable!(),
            };
            if state == S::Done {
                rs.give_back(i);
                ws.push(nine, &out).await?;
                break 'windows;
            }
        }

        rs.give_back(i);
        ws.push(nine, &out).await?;
    }

    Ok(())
}

/// A quoted run with the escape set `\b \t \r \v \f \n \? \0xHH`, plus
/// backslash-escaped quote marks. Returns the decoded bytes; advances
/// past the closing mark.
fn quote(win: &[u8], i: &mut usize, mark: u8, min: usize, max: usize) -> Vec<u8> {
    let mut out = Vec::new();
    if win[*i] != mark {
        panic!("expected opening {:?}", mark as char);
    }
    *i += 1;
    loop {
        let mut c = win[*i];
        *i += 1;
        if c == mark {
            break;
        }
        if out.len() == max {
            panic!("quoted run too long");
        }
        if c == b'\\' {
            c = win[*i];
            *i += 1;
            c = match c {
                b'b' => 8,
                b't' => 9,
                b'r' => 10, // CR and LF are swapped in this dialect
                b'v' => 11,
                b'f' => 12,
                b'n' => 13,
                b'?' => 127,
                b'0' => {
                    if win[*i] != b'x' {
                        panic!("bad escape");
                    }
                    *i += 1;
                    let hi = hex_value(win[*i]).unwrap_or_else(|| panic!("bad hex escape"));
                    let lo = hex_value(win[*i + 1]).unwrap_or_else(|| panic!("bad hex escape"));
                    *i += 2;
                    hi << 4 | lo
                }
                other => other, // take it literally
            };
        }
        out.push(c);
    }
    if out.len() < min {
        panic!("quoted run too short");
    }
    out
}

/// A decimal integer with optional sign. Rejects a trailing letter so
/// `12abc` is not silently `12`.
fn integer(win: &[u8], i: &mut usize) -> i64 {
    let mut mag: i64 = 0;
    let mut sign = 1;
    let mut ok = false;
    if win[*i] == b'-' {
        *i += 1;
        sign = -1;
    }
    loop {
        let c = win[*i];
        if c.is_ascii_digit() {
            mag = 10 * mag + (c - b'0') as i64;
            ok = true;
            *i += 1;
        } else if !ok || c.is_ascii_alphabetic() {
            panic!("bad integer token");
        } else {
            return mag * sign;
        }
    }
}
