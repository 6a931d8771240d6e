//! The Rez/DeRez codec: translation between a binary resource-fork
//! image and the line-oriented textual sidecar format.
//!
//! Binary layout (big-endian throughout):
//!
//! ```text
//! header (256 bytes): data-offset[4] map-offset[4] data-length[4] map-length[4] padding
//! data section: per resource, length[4] then body, 4-byte aligned
//! map:
//!     zeroed copy of header (16)   reserved (4)   file-ref (2)   fileattrs (2)
//!     type-list-offset (2, = 28, from start of map)
//!     name-list-offset (2, from start of map)
//!     type list: count-1 (2), then per type: fourcc (4) count-1 (2) ref-offset (2)
//!     reference list: per resource: id (2) name-offset-or-FFFF (2)
//!                     attr<<24|data-offset (4) reserved (4)
//!     name list: length-prefixed names
//! ```
//!
//! Textual layout, one resource per `data` block:
//!
//! ```text
//! data 'TYPE' (id, "optional name", attr-spec) {
//!     $"0001 0203 ..."  /* gloss */
//! };
//! ```

mod compile;
mod decompile;

pub use compile::rez;
pub use decompile::derez;

/// File System Manager limit on resources per file.
pub const MAX_RESOURCES: usize = 2727;

/// The packed name list tops out at 64 KiB.
pub const NAME_LIST_MAX: usize = 0x10000;

/// Named attribute bits; anything in 0x83 forces the `$HH` spelling.
pub(crate) const ATTR_NAMES: &[(u8, &str)] = &[
    (0x40, "sysheap"),
    (0x20, "purgeable"),
    (0x10, "locked"),
    (0x08, "protected"),
    (0x04, "preload"),
];

pub(crate) fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

pub(crate) fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}
