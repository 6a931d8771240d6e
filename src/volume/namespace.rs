//! Namespace mutations: create, delete, rename, move, and the
//! working-directory calls.

use crate::catalog::Catalog;
use crate::charset;
use crate::errors::{Errno, FsError, FsResult};
use crate::nine::{fid, O_CREAT, O_EXCL, O_WRONLY};

use super::{path_split_leaf, Volume};

impl Volume {
    /// Create an empty file (exclusively; an existing name is a
    /// duplicate, never truncated).
    pub async fn create(&mut self, base: i32, path: &[u8]) -> FsResult<()> {
        let (dir, leaf) = path_split_leaf(path);
        if leaf.is_empty() {
            return Err(FsError::BadName);
        }
        let name = charset::roman_to_host_name(leaf);

        let parent = self.catalog.walk(&mut self.nine, fid::VOL_A, base, dir).await?;
        if !Catalog::is_dir(parent.cnid) {
            return Err(FsError::DirNotFound);
        }

        match self
            .nine
            .lcreate(fid::VOL_A, &name, O_WRONLY | O_CREAT | O_EXCL, 0o666, 0)
            .await
        {
            Ok(_) => {
                self.sort.invalidate();
                Ok(())
            }
            Err(Errno::EEXIST) => Err(FsError::DuplicateName),
            Err(_) => Err(FsError::Io),
        }
    }

    /// Create a directory and return its new CNID (callers hand it
    /// straight back to the guest, so the catalog learns it here).
    pub async fn dir_create(&mut self, base: i32, path: &[u8]) -> FsResult<i32> {
        let (dir, leaf) = path_split_leaf(path);
        if leaf.is_empty() {
            return Err(FsError::BadName);
        }
        let name = charset::roman_to_host_name(leaf);

        let parent = self.catalog.walk(&mut self.nine, fid::VOL_A, base, dir).await?;
        if !Catalog::is_dir(parent.cnid) {
            return Err(FsError::DirNotFound);
        }

        let qid = match self.nine.mkdir(fid::VOL_A, 0o777, 0, &name).await {
            Ok(qid) => qid,
            Err(Errno::EEXIST) => return Err(FsError::DuplicateName),
            Err(_) => return Err(FsError::Io),
        };

        let cnid = self.catalog.qid_to_cnid(qid);
        self.catalog.set(&mut self.nine, cnid, parent.cnid, &name, true).await;
        self.sort.invalidate();
        Ok(cnid)
    }

    /// Delete a file (with its sidecars) or an empty directory.
    pub async fn delete(&mut self, base: i32, path: &[u8]) -> FsResult<()> {
        let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;

        // Removal of open files is refused
        if self.fcbs.first(hit.cnid, true).is_some() || self.fcbs.first(hit.cnid, false).is_some() {
            return Err(FsError::FileBusy);
        }

        let is_dir = Catalog::is_dir(hit.cnid);
        let (mf, ctx) = self.mf_ctx();
        match mf.delete(ctx, fid::VOL_A, &hit.name, is_dir).await {
            Ok(()) => {
                self.sort.invalidate();
                Ok(())
            }
            Err(Errno::EEXIST) | Err(Errno::ENOTEMPTY) => Err(FsError::FileBusy),
            Err(_) => Err(FsError::Io),
        }
    }

    /// Rename in place. Unlike a host rename this must never replace
    /// an existing file, so the new name is reserved with an exclusive
    /// create first. Renaming the volume itself is the special case.
    pub async fn rename(&mut self, base: i32, path: &[u8], newname: &[u8]) -> FsResult<()> {
        let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;

        // Strip extraneous colons off the new name
        let (_, leaf) = path_split_leaf(newname);
        if leaf.is_empty() || leaf.len() > charset::ROMAN_MAX {
            return Err(FsError::BadName);
        }
        let new_host = charset::roman_to_host_name(leaf);

        if hit.cnid == 2 {
            // The disk itself
            if leaf.len() > charset::VOLUME_ROMAN_MAX {
                return Err(FsError::BadName);
            }
            self.name = new_host.clone();
            self.catalog.set(&mut self.nine, 2, 1, &new_host, true).await;
            return Ok(());
        }

        // We actually want the parent, plus a junk fid to play with
        self.nine
            .walk_path(fid::VOL_A, fid::VOL_A, "..")
            .await
            .map_err(FsError::from)?;
        self.nine
            .walk_path(fid::VOL_A, fid::VOL_B, "")
            .await
            .map_err(FsError::from)?;

        // Reserve the new name atomically
        if self
            .nine
            .lcreate(fid::VOL_B, &new_host, O_WRONLY | O_CREAT | O_EXCL, 0o644, 0)
            .await
            .is_err()
        {
            return Err(FsError::DuplicateName);
        }
        let _ = self.nine.clunk(fid::VOL_B).await;

        let (mf, ctx) = self.mf_ctx();
        if mf
            .rename(ctx, fid::VOL_A, &hit.name, fid::VOL_A, &new_host)
            .await
            .is_err()
        {
            return Err(FsError::Io); // it really should have worked
        }

        self.catalog.set(&mut self.nine, hit.cnid, hit.parent, &new_host, true).await;
        self.sort.invalidate();
        Ok(())
    }

    /// Move a file or directory into another directory, keeping its
    /// name. Also never replaces an existing entry.
    pub async fn cat_move(
        &mut self,
        base: i32,
        path: &[u8],
        new_base: i32,
        new_path: &[u8],
    ) -> FsResult<()> {
        let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;
        if hit.cnid == 2 {
            return Err(FsError::BadName); // can't move the root
        }

        let dest = self
            .catalog
            .walk(&mut self.nine, fid::VOL_B, new_base, new_path)
            .await?;
        if !Catalog::is_dir(dest.cnid) {
            return Err(FsError::BadName);
        }

        // Claim the destination name exclusively
        self.nine
            .walk_path(fid::VOL_B, fid::VOL_C, "")
            .await
            .map_err(FsError::from)?;
        match self
            .nine
            .lcreate(fid::VOL_C, &hit.name, O_WRONLY | O_CREAT | O_EXCL, 0o666, 0)
            .await
        {
            Ok(_) => {}
            Err(Errno::EEXIST) => return Err(FsError::DuplicateName),
            Err(_) => return Err(FsError::Io),
        }
        let _ = self.nine.clunk(fid::VOL_C).await;

        // The strategy expects the source parent fid
        self.nine
            .walk_path(fid::VOL_A, fid::VOL_A, "..")
            .await
            .map_err(FsError::from)?;

        let (mf, ctx) = self.mf_ctx();
        match mf.rename(ctx, fid::VOL_A, &hit.name, fid::VOL_B, &hit.name).await {
            Ok(()) => {}
            Err(Errno::EINVAL) => return Err(FsError::BadMove),
            Err(_) => return Err(FsError::Io),
        }

        self.catalog.set(&mut self.nine, hit.cnid, dest.cnid, &hit.name, true).await;
        self.sort.invalidate();
        Ok(())
    }

    /// Open a working directory: a synthetic volume refnum standing
    /// for a directory. The root needs no alias.
    pub async fn open_wd(&mut self, base: i32, path: &[u8], proc_id: u32) -> FsResult<i16> {
        let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;
        if !Catalog::is_dir(hit.cnid) {
            return Err(FsError::NotFound);
        }

        if hit.cnid == 2 {
            return Ok(self.vref);
        }

        self.wd.open(hit.cnid, proc_id).ok_or(FsError::TooManyWorkingDirs)
    }

    pub fn close_wd(&mut self, vref: i16) -> FsResult<()> {
        self.wd.close(vref);
        Ok(())
    }

    /// Make a directory the default ("current") one. With a path this
    /// is the hierarchical form and the directory must exist; without,
    /// the base is taken on faith (it came from a WD record).
    pub async fn set_vol(&mut self, base: i32, path: Option<&[u8]>) -> FsResult<()> {
        let dir = match path {
            Some(p) => {
                let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, p).await?;
                if !Catalog::is_dir(hit.cnid) {
                    return Err(FsError::DirNotFound);
                }
                hit.cnid
            }
            None => base,
        };
        self.wd.set_current(dir, 0);
        Ok(())
    }
}
