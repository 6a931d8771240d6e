//! The driver façade: one mounted volume, translating the guest's
//! catalog operations into catalog walks, multifork calls and remote
//! IO. The guest-side dispatcher that turns its own call records into
//! these operations lives outside this crate; everything here is
//! operation-oriented.

mod info;
mod io;
mod namespace;
mod wd;

pub use info::{CatInfo, FsSpec, InfoTarget, VolInfo, VolParams};
pub use io::{Fork, IoOutcome, SeekMode};
pub use wd::{WdEntry, WdTable, WDHI, WDLO};

use std::sync::Arc;

use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::errors::{Errno, FsError, FsResult};
use crate::fcb::FcbTable;
use crate::multifork::{self, Ctx, Multifork};
use crate::nine::{fid, Client};
use crate::sortdir::SortedDirCache;
use crate::virtio::{negotiate, GuestRam, Transport};

/// The hidden housekeeping directory under the volume root. Spill
/// files and fork caches live beneath it; its spelling is shared with
/// every other implementation of this on-disk format.
pub const DOTDIR_NAME: &str = ".classicvirtio.nosync.noindex";

/// Open-fork table size.
const FCB_CAPACITY: usize = 348;

/// Working-directory table size.
const WD_CAPACITY: usize = 40;

/// Descriptor budget requested from the queue.
const QUEUE_BUFS: u16 = 256;

pub struct Volume {
    pub(crate) nine: Client,
    pub(crate) catalog: Catalog,
    pub(crate) fcbs: FcbTable,
    pub(crate) mf: Box<dyn Multifork>,
    pub(crate) sort: SortedDirCache,
    pub(crate) wd: WdTable,
    /// Displayable volume name from the mount tag.
    pub name: String,
    /// Stable volume "creation date" stamp, derived from the root
    /// inode and used pervasively as an identifier.
    pub create_date: u32,
    /// Guest timezone offset applied to timestamps, seconds.
    pub tz_offset: i32,
    /// The volume's own (negative) reference number.
    pub vref: i16,
}

impl Volume {
    /// Bring the whole stack up: negotiate the transport, start the
    /// 9P layer, attach, prepare the housekeeping tree, parse the
    /// mount tag, and initialise the chosen multifork strategy.
    pub async fn mount(ram: GuestRam, mut transport: Box<dyn Transport>) -> FsResult<Volume> {
        if negotiate(&mut *transport).is_err() {
            return Err(FsError::OpenFailed);
        }

        let mut nine = Client::connect(ram, transport, QUEUE_BUFS)
            .await
            .map_err(|_| FsError::OpenFailed)?;

        let root_qid = nine
            .attach(fid::ROOT, None, "", "", 0)
            .await
            .map_err(|_| FsError::OpenFailed)?;

        // The housekeeping directory for catalog spill and fork caches
        match nine.mkdir(fid::ROOT, 0o777, 0, DOTDIR_NAME).await {
            Ok(_) | Err(Errno::EEXIST) => {}
            Err(e) => panic!("could not create the housekeeping directory: {:?}", e),
        }
        nine.walk_path(fid::ROOT, fid::DOTDIR, DOTDIR_NAME)
            .await
            .expect("failed walk to the housekeeping directory");

        let mut catalog = Catalog::init(&mut nine, root_qid).await;

        // The mount tag carries the volume name, optionally suffixed
        // with a multifork format hint
        let cfg = nine.device_config();
        let (name, hint) = parse_mount_tag(&cfg);
        info!(volume = %name, "mounting");
        catalog.set(&mut nine, 2, 1, &name, true).await;

        // A unique, stable creation date from the root inode number
        let create_date = 0x8000_0000u32
            ^ (root_qid.path & 0x3fff_ffff) as u32
            ^ ((root_qid.path >> 30) & 0x3fff_ffff) as u32
            ^ ((root_qid.path >> 60) & 0xf) as u32;

        let mut fcbs = FcbTable::new(FCB_CAPACITY);
        let mut mf = multifork::choose(&hint);
        debug!(format = mf.name(), "fork format");
        mf.init(Ctx { nine: &mut nine, catalog: &mut catalog, fcbs: &mut fcbs })
            .await
            .map_err(|_| FsError::MemFull)?;

        Ok(Volume {
            nine,
            catalog,
            fcbs,
            mf,
            sort: SortedDirCache::new(),
            wd: WdTable::new(WD_CAPACITY),
            name,
            create_date,
            tz_offset: 0,
            vref: -1,
        })
    }

    /// Convenience: mount over an in-process loopback device.
    pub async fn mount_loopback(
        fs: Arc<std::sync::Mutex<crate::loopback::HostFs>>,
        mount_tag: &str,
    ) -> FsResult<Volume> {
        let ram = GuestRam::new(8 << 20);
        let device = crate::loopback::LoopbackDevice::new(&ram, fs, mount_tag);
        Volume::mount(ram, Box::new(device)).await
    }

    /// Divine the directory a (vref, dirID) pair names: an explicit
    /// dirID wins, then a working-directory alias, then the root.
    pub fn resolve_dir(&self, vref: i16, dir_id: i32) -> i32 {
        if dir_id != 0 {
            return dir_id;
        }
        if vref <= WDHI || vref == 0 {
            if let Some(dir) = self.wd.dir_of(vref) {
                return dir;
            }
        }
        2
    }

    /// Split the strategy and a context over the remaining state, so a
    /// method can hand both to a strategy call.
    pub(crate) fn mf_ctx(&mut self) -> (&mut dyn Multifork, Ctx<'_>) {
        (
            self.mf.as_mut(),
            Ctx {
                nine: &mut self.nine,
                catalog: &mut self.catalog,
                fcbs: &mut self.fcbs,
            },
        )
    }

    /// Stable, collated enumeration: entry `index` (1-based) under
    /// `parent`, directories included only when `dirs_ok`.
    pub async fn read_dir_sorted(
        &mut self,
        parent: i32,
        index: i32,
        dirs_ok: bool,
    ) -> FsResult<(i32, String)> {
        let Volume { nine, catalog, sort, mf, .. } = self;
        let mf = &**mf;
        crate::sortdir::read_dir_sorted(
            sort,
            nine,
            catalog,
            &|n| mf.is_sidecar(n),
            fid::SORT_NAV,
            parent,
            index,
            dirs_ok,
        )
        .await
    }

    /// Ask the host to commit everything it has from us.
    pub async fn flush(&mut self) -> FsResult<()> {
        self.nine.fsync(fid::ROOT).await.map_err(FsError::from)
    }

    /// The hardware interrupt entry point: drains the queues with the
    /// disarm/rearm discipline. Harmless to call spuriously.
    pub fn service_interrupt(&mut self) {
        self.nine.service_interrupt();
    }

    /// Is this host name invisible to the guest (dotfile or strategy
    /// sidecar)?
    pub(crate) fn vis_name(&self, name: &str) -> bool {
        !name.starts_with('.') && !self.mf.is_sidecar(name)
    }

    pub(crate) fn to_guest_time(&self, unix: i64) -> u32 {
        crate::timeconv::to_guest(unix, self.tz_offset)
    }
}

/// `len[2] name-bytes`, with an optional `_hint` suffix carving off a
/// multifork format hint.
fn parse_mount_tag(cfg: &[u8]) -> (String, String) {
    let mut name = String::new();
    if cfg.len() >= 2 {
        let len = (u16::from_le_bytes([cfg[0], cfg[1]]) as usize).min(127).min(cfg.len() - 2);
        name = String::from_utf8_lossy(&cfg[2..2 + len]).into_owned();
    }

    match name.find('_') {
        Some(at) => {
            let hint = name[at + 1..].to_owned();
            name.truncate(at);
            (name, hint)
        }
        None => (name, String::new()),
    }
}

/// Split the leaf off a guest path, ignoring a trailing colon.
pub(crate) fn path_split_leaf(path: &[u8]) -> (&[u8], &[u8]) {
    let mut dirlen = path.len();
    if dirlen > 0 && path[dirlen - 1] == b':' {
        dirlen -= 1;
    }
    let mut namelen = 0;
    while dirlen > 0 && path[dirlen - 1] != b':' {
        dirlen -= 1;
        namelen += 1;
    }
    (&path[..dirlen], &path[dirlen..dirlen + namelen])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_tag_hint_is_split_off() {
        let mut cfg = 7u16.to_le_bytes().to_vec();
        cfg.extend_from_slice(b"Disk_3x");
        assert_eq!(parse_mount_tag(&cfg), ("Disk".into(), "3x".into()));

        let mut cfg = 4u16.to_le_bytes().to_vec();
        cfg.extend_from_slice(b"Disk");
        assert_eq!(parse_mount_tag(&cfg), ("Disk".into(), "".into()));
    }

    #[test]
    fn leaf_splitting() {
        assert_eq!(path_split_leaf(b"A:B:C"), (&b"A:B:"[..], &b"C"[..]));
        assert_eq!(path_split_leaf(b"A:B:"), (&b"A:"[..], &b"B"[..]));
        assert_eq!(path_split_leaf(b"C"), (&b""[..], &b"C"[..]));
        assert_eq!(path_split_leaf(b""), (&b""[..], &b""[..]));
    }
}
