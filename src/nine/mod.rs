//! Enough of the 9P2000.L protocol to support the catalog bridge.
//!
//! A deliberately narrow client: one transaction tag, one request in
//! flight, every call synchronous from the caller's point of view
//! (the future completes when the virtqueue does).

pub mod buf;
mod client;
pub mod wire;

pub use client::{Client, DirEntry, DirStream};

use num_derive::{FromPrimitive, ToPrimitive};

/// Longest string accepted in a reply, not counting any terminator.
pub const STRMAX: usize = 127;

/// Longest host file name we will traffic in, bytes.
pub const MAX_NAME: usize = 255;

/// 9P2000.L message types (requests even, replies odd = request + 1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MsgType {
    Rlerror = 7,
    Tstatfs = 8,
    Tlopen = 12,
    Tlcreate = 14,
    Tgetattr = 24,
    Tsetattr = 26,
    Txattrwalk = 30,
    Txattrcreate = 32,
    Treaddir = 40,
    Tfsync = 50,
    Tmkdir = 72,
    Trenameat = 74,
    Tunlinkat = 76,
    Tversion = 100,
    Tattach = 104,
    Twalk = 110,
    Tread = 116,
    Twrite = 118,
    Tclunk = 120,
    Tremove = 122,
}

/// The remote file system's 13-byte identity.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Qid {
    pub typ: u8,
    pub version: u32,
    pub path: u64,
}

/// Qid type bit: directory.
pub const QTDIR: u8 = 0x80;

impl Qid {
    pub fn is_dir(&self) -> bool {
        self.typ & QTDIR != 0
    }
}

/// The type field of an `Rreaddir` qid is unpopulated; reconstitute it
/// from the listing's own type byte before trusting it.
pub fn qid_type_fix(mut qid: Qid, linux_type: u8) -> Qid {
    qid.typ = if linux_type == DT_DIR { QTDIR } else { 0 };
    qid
}

/// Rgetattr contents (and Tsetattr input, which reuses the time and
/// size fields).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stat {
    pub valid: u64,
    pub qid: Qid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: i64,
    pub atime_nsec: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u64,
    pub ctime_sec: i64,
    pub ctime_nsec: u64,
}

/// Rstatfs contents.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Statfs {
    pub typ: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

// Tgetattr request mask bits
pub const STAT_MODE: u64 = 0x1;
pub const STAT_NLINK: u64 = 0x2;
pub const STAT_UID: u64 = 0x4;
pub const STAT_GID: u64 = 0x8;
pub const STAT_RDEV: u64 = 0x10;
pub const STAT_ATIME: u64 = 0x20;
pub const STAT_MTIME: u64 = 0x40;
pub const STAT_CTIME: u64 = 0x80;
pub const STAT_INO: u64 = 0x100;
pub const STAT_SIZE: u64 = 0x200;
pub const STAT_BLOCKS: u64 = 0x400;
pub const STAT_BASIC: u64 = 0x7ff;

// Tsetattr valid bits
pub const SET_MODE: u32 = 0x1;
pub const SET_UID: u32 = 0x2;
pub const SET_GID: u32 = 0x4;
pub const SET_SIZE: u32 = 0x8;
pub const SET_ATIME: u32 = 0x10;
pub const SET_MTIME: u32 = 0x20;
pub const SET_CTIME: u32 = 0x40;
pub const SET_ATIME_SET: u32 = 0x80;
pub const SET_MTIME_SET: u32 = 0x100;

// Lopen/Lcreate flags (Linux generic values)
pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 0x1;
pub const O_RDWR: u32 = 0x2;
pub const O_CREAT: u32 = 0x40;
pub const O_EXCL: u32 = 0x80;
pub const O_TRUNC: u32 = 0x200;
pub const O_DIRECTORY: u32 = 0x10000;

/// Tunlinkat: remove a directory rather than a file.
pub const AT_REMOVEDIR: u32 = 0x200;

// Readdir entry type bytes (d_type values)
pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;

/// No-auth afid for Tattach.
pub const NOFID: u32 = !0;

/// Reserved indexes in the FID space.
///
/// FIDs 0-31 form the auto-reusable pool: installing a new value into
/// one implicitly clunks the previous value. Within the pool, ranges
/// are parcelled out to named owners by convention, and only the owner
/// touches its own FIDs. FIDs from [`fid::FIRST_OPEN`] up are per-open
/// -fork handles (`FIRST_OPEN + refnum`) and are never auto-clunked.
pub mod fid {
    /// The attach point (volume root).
    pub const ROOT: u32 = 0;
    /// The hidden housekeeping directory under the root.
    pub const DOTDIR: u32 = 1;
    // volume façade scratch
    pub const VOL_A: u32 = 2;
    pub const VOL_B: u32 = 3;
    pub const VOL_C: u32 = 4;
    // catalog
    pub const CATALOG: u32 = 8;
    pub const CATALOG_TMP: u32 = 9;
    // multifork
    pub const MF_DIR: u32 = 10;
    pub const MF_RESFORK: u32 = 11;
    pub const MF_CLEANREC: u32 = 12;
    pub const MF_REZ: u32 = 13;
    pub const MF_FINFO: u32 = 14;
    pub const MF_TMP: u32 = 15;
    pub const MF_PARENT: u32 = 16;
    // sorted enumeration
    pub const SORT_DIR: u32 = 17;
    pub const SORT_LIST: u32 = 18;
    pub const SORT_NAV: u32 = 19;

    /// First per-open-fork FID; add the FCB refnum.
    pub const FIRST_OPEN: u32 = 32;
}
