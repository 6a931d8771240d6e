//! Multifork strategies: presenting the guest's (data fork, resource
//! fork, Finder metadata) view of a file on top of plain host files.
//!
//! Two strategies ship. The three-file format keeps ancillary data in
//! `NAME.idump` / `NAME.rdump` siblings and is the right choice for
//! development trees; the one-file format maps forks onto the extended
//! attributes a Darwin host exposes. The façade picks one at mount
//! time from the volume-name hint and never changes its mind.

pub mod flags;
mod one_file;
mod three_file;

pub use one_file::{OneFile, DEFAULT_RESOURCE_LIMIT};
pub use three_file::ThreeFile;

use async_trait::async_trait;

use crate::catalog::Catalog;
use crate::errors::NineResult;
use crate::fcb::FcbTable;
use crate::nine::{fid, Client};

// Field-select bits for the attribute calls
pub const MF_DSIZE: u32 = 1;
pub const MF_RSIZE: u32 = 2;
pub const MF_TIME: u32 = 4;
pub const MF_FINFO: u32 = 8;

/// File metadata at the compromise point between the remote (Unix)
/// and guest views. Times are Unix seconds, signed; the layer above
/// translates to the guest epoch. Sizes can only change through
/// `set_eof` on an open fork.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MfAttr {
    pub dsize: u64,
    pub rsize: u64,
    pub unixtime: i64,
    pub finfo: [u8; 16],
    pub fxinfo: [u8; 16],
}

/// Borrowed slices of the volume's state that strategy calls may need:
/// the wire, the CNID database, and the open-fork table.
pub struct Ctx<'a> {
    pub nine: &'a mut Client,
    pub catalog: &'a mut Catalog,
    pub fcbs: &'a mut FcbTable,
}

/// The FID a given open fork does its IO through.
pub fn fid_of(refnum: u16) -> u32 {
    fid::FIRST_OPEN + refnum as u32
}

/// A fork-mapping strategy. `fid` arguments have been walked to the
/// file in question by the caller; `name` is its host-side leaf name.
#[async_trait]
pub trait Multifork: Send {
    fn name(&self) -> &'static str;

    /// One-time setup after attach (private cache directories etc).
    async fn init(&mut self, ctx: Ctx<'_>) -> NineResult<()>;

    /// Open the fork described by the (already allocated) FCB.
    async fn open(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        cnid: i32,
        fid: u32,
        name: &str,
    ) -> NineResult<()>;

    async fn close(&mut self, ctx: Ctx<'_>, refnum: u16) -> NineResult<()>;

    async fn read(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        buf: &mut [u8],
        offset: u64,
    ) -> NineResult<u32>;

    async fn write(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        buf: &[u8],
        offset: u64,
    ) -> NineResult<u32>;

    async fn get_eof(&mut self, ctx: Ctx<'_>, refnum: u16) -> NineResult<u64>;

    async fn set_eof(&mut self, ctx: Ctx<'_>, refnum: u16, len: u64) -> NineResult<()>;

    /// Fetch the selected `MF_*` fields for a file.
    async fn fget_attr(
        &mut self,
        ctx: Ctx<'_>,
        cnid: i32,
        fid: u32,
        name: &str,
        fields: u32,
    ) -> NineResult<MfAttr>;

    async fn fset_attr(
        &mut self,
        ctx: Ctx<'_>,
        cnid: i32,
        fid: u32,
        name: &str,
        fields: u32,
        attr: &MfAttr,
    ) -> NineResult<()>;

    /// Directory metadata (may be benignly absent in a strategy).
    async fn dget_attr(
        &mut self,
        ctx: Ctx<'_>,
        cnid: i32,
        fid: u32,
        name: &str,
        fields: u32,
    ) -> NineResult<MfAttr>;

    async fn dset_attr(
        &mut self,
        ctx: Ctx<'_>,
        cnid: i32,
        fid: u32,
        name: &str,
        fields: u32,
        attr: &MfAttr,
    ) -> NineResult<()>;

    /// Rename/move, carrying any sidecars along.
    async fn rename(
        &mut self,
        ctx: Ctx<'_>,
        fid1: u32,
        name1: &str,
        fid2: u32,
        name2: &str,
    ) -> NineResult<()>;

    /// Delete, including any sidecars. `fid` is on the victim itself.
    async fn delete(&mut self, ctx: Ctx<'_>, fid: u32, name: &str, is_dir: bool) -> NineResult<()>;

    /// Is this host name one of the strategy's own metadata files?
    /// Such names are hidden from every directory listing.
    fn is_sidecar(&self, name: &str) -> bool;
}

/// Pick a strategy from the mount-tag hint.
pub fn choose(hint: &str) -> Box<dyn Multifork> {
    match hint {
        "1" => Box::new(OneFile::new(DEFAULT_RESOURCE_LIMIT)),
        _ => Box::new(ThreeFile::new()),
    }
}
