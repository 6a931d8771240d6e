//! Metadata: volume info, file/directory info, FSSpec resolution and
//! file-ID references.

use crate::catalog::Catalog;
use crate::charset;
use crate::errors::{FsError, FsResult};
use crate::multifork::{MF_DSIZE, MF_FINFO, MF_RSIZE, MF_TIME};
use crate::nine::{fid, DT_DIR, O_DIRECTORY, O_RDONLY, STAT_MTIME};

use super::Volume;

/// Volume-level facts, sizes clipped the way 16/32-bit callers expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolInfo {
    pub name: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// 32 KiB allocation blocks covering the (clipped) volume.
    pub blocks_total: u16,
    pub blocks_free: u16,
    pub alloc_block_size: u32,
    pub num_files: u16,
    pub mod_date: u32,
    pub create_date: u32,
}

/// What a lookup learned about one file or directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatInfo {
    pub cnid: i32,
    pub parent: i32,
    pub name: String,
    pub is_dir: bool,
    pub finfo: [u8; 16],
    pub fxinfo: [u8; 16],
    pub data_len: u32,
    pub data_phys: u32,
    pub rsrc_len: u32,
    pub rsrc_phys: u32,
    pub cr_date: u32,
    pub md_date: u32,
    /// Directories: contained (visible) entries.
    pub valence: u16,
    /// Files: whether either fork is open, and by which refnum.
    pub open_refnum: u16,
    pub open_data: bool,
    pub open_rsrc: bool,
}

/// Volume capability attributes (the v1 part of the parameter
/// buffer). Bit numbers follow the classic definitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VolParams {
    pub version: i16,
    pub attributes: u32,
    pub server_addr: u32,
}

const B_HAS_FILE_IDS: u32 = 1 << 6;
const B_HAS_EXT_FS_VOL: u32 = 1 << 16;
const B_TRSH_OFF_LINE: u32 = 1 << 26;
const B_NO_LCL_SYNC: u32 = 1 << 27;
const B_NO_MINI_FNDR: u32 = 1 << 29;
const B_LOCAL_W_LIST: u32 = 1 << 30;

/// A resolved-or-resolvable name: the would-be parent and leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsSpec {
    pub parent: i32,
    /// Leaf name in guest (roman) bytes.
    pub name: Vec<u8>,
    pub exists: bool,
}

/// How a caller names the target of an info request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InfoTarget<'a> {
    /// Resolve a path (which may be empty) against the base directory.
    Named(&'a [u8]),
    /// The Nth visible child of the base directory, collation order.
    Indexed(i32),
    /// The base directory itself, ignoring any path argument.
    DirOnly,
}

impl Volume {
    /// Volume statistics; `dir` is the directory whose files are
    /// counted (the root, or a working directory posing as a volume).
    pub async fn vol_info(&mut self, dir: i32) -> FsResult<VolInfo> {
        let statfs = self.nine.statfs(fid::ROOT).await.map_err(FsError::from)?;
        let total_bytes = statfs.blocks * statfs.bsize as u64;
        let free_bytes = statfs.bavail * statfs.bsize as u64;

        // Clip to under 2 GB, reported as 32 KiB blocks
        let clipped_total = total_bytes.min(0x7fff_ffff);
        let clipped_free = free_bytes.min(0x7fff_ffff);

        let stat = self
            .nine
            .getattr(fid::ROOT, STAT_MTIME)
            .await
            .map_err(FsError::from)?;
        let mod_date = self.to_guest_time(stat.mtime_sec);

        // No remote call counts a directory; list it
        let mut num_files = 0u16;
        self.catalog.walk(&mut self.nine, fid::VOL_A, dir, b"").await?;
        if self.nine.lopen(fid::VOL_A, O_RDONLY | O_DIRECTORY).await.is_ok() {
            let mut stream = self.nine.readdir_stream(fid::VOL_A, 4096);
            while let Some(entry) = self
                .nine
                .readdir_next(&mut stream)
                .await
                .map_err(FsError::from)?
            {
                if entry.typ != DT_DIR && self.vis_name(&entry.name) {
                    num_files = num_files.saturating_add(1);
                }
            }
        }

        Ok(VolInfo {
            name: self.name.clone(),
            total_bytes,
            free_bytes,
            blocks_total: (clipped_total >> 15) as u16,
            blocks_free: (clipped_free >> 15) as u16,
            alloc_block_size: 32 * 1024,
            num_files,
            mod_date,
            create_date: self.create_date,
        })
    }

    /// The volume's fixed capability word.
    pub fn vol_params(&self) -> VolParams {
        VolParams {
            version: 1,
            attributes: B_HAS_FILE_IDS
                | B_NO_MINI_FNDR
                | B_NO_LCL_SYNC
                | B_TRSH_OFF_LINE
                | B_HAS_EXT_FS_VOL
                | B_LOCAL_W_LIST,
            server_addr: 0,
        }
    }

    /// The metadata workhorse behind GetFileInfo/GetCatInfo. With
    /// [`InfoTarget::Indexed`], directories are only visible to the
    /// catalog flavour of the call (`catalog_call`); files-only
    /// enumeration skips them without consuming indexes.
    pub async fn get_info(
        &mut self,
        base: i32,
        target: InfoTarget<'_>,
        catalog_call: bool,
    ) -> FsResult<CatInfo> {
        let (cnid, parent, name, attr_fid) = match target {
            InfoTarget::Indexed(index) => {
                let (cnid, name) = self.read_dir_sorted(base, index, catalog_call).await?;
                let parent = self.sort.current_dir();
                self.catalog.set(&mut self.nine, cnid, parent, &name, true).await;
                (cnid, parent, name, fid::SORT_NAV)
            }
            InfoTarget::Named(path) => {
                let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;
                (hit.cnid, hit.parent, hit.name, fid::VOL_A)
            }
            InfoTarget::DirOnly => {
                let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, b"").await?;
                (hit.cnid, hit.parent, hit.name, fid::VOL_A)
            }
        };

        if Catalog::is_dir(cnid) {
            if !catalog_call {
                return Err(FsError::NotFound); // GetFileInfo predates directories
            }
            self.dir_info(cnid, parent, name, attr_fid).await
        } else {
            self.file_info(cnid, parent, name, attr_fid).await
        }
    }

    async fn dir_info(
        &mut self,
        cnid: i32,
        parent: i32,
        name: String,
        attr_fid: u32,
    ) -> FsResult<CatInfo> {
        // Count the contents while we are here
        let mut valence = 0u16;
        self.nine
            .walk_path(attr_fid, fid::VOL_B, "")
            .await
            .map_err(FsError::from)?;
        if self.nine.lopen(fid::VOL_B, O_RDONLY | O_DIRECTORY).await.is_ok() {
            let mut stream = self.nine.readdir_stream(fid::VOL_B, 4096);
            while let Some(entry) = self
                .nine
                .readdir_next(&mut stream)
                .await
                .map_err(FsError::from)?
            {
                if self.vis_name(&entry.name) && valence < 0x7fff {
                    valence += 1;
                }
            }
            let _ = self.nine.clunk(fid::VOL_B).await;
        }

        let (mf, ctx) = self.mf_ctx();
        let attr = mf
            .dget_attr(ctx, cnid, attr_fid, &name, MF_FINFO)
            .await
            .unwrap_or_default();

        let when = self.to_guest_time(attr.unixtime);
        Ok(CatInfo {
            cnid,
            parent,
            name,
            is_dir: true,
            finfo: attr.finfo,
            fxinfo: attr.fxinfo,
            valence,
            cr_date: when,
            md_date: when,
            ..CatInfo::default()
        })
    }

    async fn file_info(
        &mut self,
        cnid: i32,
        parent: i32,
        name: String,
        attr_fid: u32,
    ) -> FsResult<CatInfo> {
        let (mf, ctx) = self.mf_ctx();
        let attr = mf
            .fget_attr(ctx, cnid, attr_fid, &name, MF_DSIZE | MF_RSIZE | MF_TIME | MF_FINFO)
            .await
            .map_err(FsError::from)?;

        let mut info = CatInfo {
            cnid,
            parent,
            name,
            is_dir: false,
            finfo: attr.finfo,
            fxinfo: attr.fxinfo,
            data_len: attr.dsize.min(u32::MAX as u64) as u32,
            rsrc_len: attr.rsize.min(u32::MAX as u64) as u32,
            ..CatInfo::default()
        };
        info.data_phys = (info.data_len + 511) & !511;
        info.rsrc_phys = (info.rsrc_len + 511) & !511;
        info.cr_date = self.to_guest_time(attr.unixtime);
        info.md_date = info.cr_date;

        // Report whether the file is open right now
        if let Some(r) = self.fcbs.first(cnid, true) {
            info.open_rsrc = true;
            info.open_refnum = r;
        }
        if let Some(r) = self.fcbs.first(cnid, false) {
            info.open_data = true;
            info.open_refnum = r;
        }

        Ok(info)
    }

    /// Set creator/type and flags; times are accepted and ignored.
    pub async fn set_info(
        &mut self,
        base: i32,
        path: &[u8],
        finfo: [u8; 16],
        fxinfo: [u8; 16],
    ) -> FsResult<()> {
        let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;

        let attr = crate::multifork::MfAttr { finfo, fxinfo, ..Default::default() };
        let (mf, ctx) = self.mf_ctx();
        if Catalog::is_dir(hit.cnid) {
            mf.dset_attr(ctx, hit.cnid, fid::VOL_A, &hit.name, MF_FINFO, &attr)
                .await
                .map_err(FsError::from)
        } else {
            mf.fset_attr(ctx, hit.cnid, fid::VOL_A, &hit.name, MF_FINFO, &attr)
                .await
                .map_err(FsError::from)
        }
    }

    /// Resolve a path into (parent, leaf) whether or not the leaf
    /// exists yet; the caller builds its FSSpec from this.
    pub async fn make_fs_spec(&mut self, base: i32, path: &[u8]) -> FsResult<FsSpec> {
        match self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await {
            Ok(hit) => {
                if hit.cnid == 2 {
                    return Ok(FsSpec { parent: 2, name: Vec::new(), exists: true });
                }
                let name = charset::host_name_to_roman(&hit.name, charset::ROMAN_MAX)
                    .unwrap_or_default();
                Ok(FsSpec { parent: hit.parent, name, exists: true })
            }
            Err(FsError::NotFound) => {
                // The target doesn't (yet) exist; its parent must
                let (dir, leaf) = super::path_split_leaf(path);
                if leaf.is_empty() {
                    return Err(FsError::DirNotFound);
                }
                let hit = self
                    .catalog
                    .walk(&mut self.nine, fid::VOL_A, base, dir)
                    .await
                    .map_err(|_| FsError::DirNotFound)?;
                Ok(FsSpec { parent: hit.cnid, name: leaf.to_vec(), exists: false })
            }
            Err(e) => Err(e),
        }
    }

    /// A file-ID reference is just the CNID; directories report
    /// themselves but are not files.
    pub async fn create_file_id_ref(&mut self, base: i32, path: &[u8]) -> FsResult<(i32, bool)> {
        let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;
        Ok((hit.cnid, !Catalog::is_dir(hit.cnid)))
    }

    /// The reverse mapping, straight out of the catalog.
    pub async fn resolve_file_id_ref(&mut self, file_id: i32) -> FsResult<(i32, String)> {
        self.catalog
            .get(&mut self.nine, file_id)
            .await
            .map_err(|_| FsError::FileIdNotFound)
    }
}
