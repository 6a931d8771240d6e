//! The one-file multifork format: the forks and metadata a Darwin
//! host already exposes, one host file per guest file.
//!
//! The resource fork is the `com.apple.ResourceFork` extended
//! attribute and Finder info is `com.apple.FinderInfo` (first 16 bytes
//! `finfo`, next 16 `fxinfo`). Extended attributes cannot be written
//! piecemeal, so resource-fork writes land in a bounded in-memory
//! scratch that is written back whole when the file is closed or when
//! a different file's fork needs the scratch.

use async_trait::async_trait;
use tracing::trace;

use crate::errors::{Errno, NineResult};
use crate::nine::{fid, Client, Stat, AT_REMOVEDIR, O_RDONLY, O_RDWR, SET_SIZE, STAT_MTIME, STAT_SIZE};

use super::{fid_of, Ctx, MfAttr, Multifork, MF_DSIZE, MF_FINFO, MF_RSIZE, MF_TIME};

const XATTR_RESOURCE: &str = "com.apple.ResourceFork";
const XATTR_FINDER: &str = "com.apple.FinderInfo";

/// Ceiling on a bufferable resource fork.
pub const DEFAULT_RESOURCE_LIMIT: usize = 17 * 1024 * 1024;

pub struct OneFile {
    limit: usize,
    /// Which open fork the scratch mirrors (0 = none).
    scratch_fid: u32,
    dirty: bool,
    data: Vec<u8>,
}

impl OneFile {
    pub fn new(limit: usize) -> OneFile {
        OneFile { limit, scratch_fid: 0, dirty: false, data: Vec::new() }
    }

    /// Write the scratch back as one whole extended attribute.
    async fn flush_scratch(&mut self, nine: &mut Client) -> NineResult<()> {
        if self.scratch_fid == 0 || !self.dirty {
            return Ok(());
        }

        if nine.walk(self.scratch_fid, fid::MF_TMP, &[]).await.is_err() {
            panic!("saved resource fork fid went bad");
        }
        nine.xattrcreate(fid::MF_TMP, XATTR_RESOURCE, self.data.len() as u64, 0)
            .await
            .expect("xattr create failed on flush");
        let mut at = 0usize;
        while at < self.data.len() {
            let n = (self.data.len() - at).min(nine.max_message as usize);
            nine.write_all(fid::MF_TMP, &self.data[at..at + n], at as u64)
                .await
                .expect("xattr write failed on flush");
            at += n;
        }
        self.dirty = false;
        let _ = nine.clunk(fid::MF_TMP).await;
        Ok(())
    }

    /// Make the scratch hold `fid9`'s resource fork, flushing whatever
    /// was there before.
    async fn slurp(&mut self, nine: &mut Client, fid9: u32) -> NineResult<()> {
        if self.scratch_fid == fid9 {
            return Ok(());
        }
        self.flush_scratch(nine).await?;

        self.scratch_fid = fid9;
        self.dirty = false;
        self.data.clear();

        let size = match nine.xattrwalk(fid9, fid::MF_TMP, XATTR_RESOURCE).await {
            Ok(size) => size,
            Err(Errno::ENODATA) => return Ok(()), // no fork yet
            Err(e) => return Err(e),
        };
        if size as usize > self.limit {
            let _ = nine.clunk(fid::MF_TMP).await;
            return Err(Errno::E2BIG);
        }

        self.data.resize(size as usize, 0);
        let mut got = 0usize;
        while got < size as usize {
            let want = (size as usize - got).min(nine.max_message as usize);
            let n = nine
                .read(fid::MF_TMP, &mut self.data[got..got + want], got as u64)
                .await? as usize;
            if n == 0 {
                break;
            }
            got += n;
        }
        self.data.truncate(got);
        let _ = nine.clunk(fid::MF_TMP).await;
        trace!(bytes = got, "slurped resource fork");
        Ok(())
    }
}

#[async_trait]
impl Multifork for OneFile {
    fn name(&self) -> &'static str {
        "1:1 Darwin metadata"
    }

    async fn init(&mut self, _ctx: Ctx<'_>) -> NineResult<()> {
        Ok(())
    }

    async fn open(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        _cnid: i32,
        fid9: u32,
        _name: &str,
    ) -> NineResult<()> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let (resource, writable) = {
            let fcb = fcbs.must(refnum);
            (fcb.resource, fcb.writable)
        };
        let my = fid_of(refnum);

        nine.walk(fid9, my, &[]).await?;
        if resource {
            // Defer actually fetching the fork until a transfer call
            return Ok(());
        }

        if writable {
            if nine.lopen(my, O_RDWR).await.is_ok() {
                return Ok(());
            }
        }
        nine.lopen(my, O_RDONLY).await.map(|_| ())
    }

    async fn close(&mut self, ctx: Ctx<'_>, refnum: u16) -> NineResult<()> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let my = fid_of(refnum);
        let resource = fcbs.must(refnum).resource;

        if resource && self.scratch_fid == my {
            self.flush_scratch(nine).await?;
            self.scratch_fid = 0;
            self.data = Vec::new();
        }
        nine.clunk(my).await
    }

    async fn read(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        buf: &mut [u8],
        offset: u64,
    ) -> NineResult<u32> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let my = fid_of(refnum);

        if !fcbs.must(refnum).resource {
            return nine.read(my, buf, offset).await;
        }

        self.slurp(nine, my).await?;
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let at = offset as usize;
        let take = buf.len().min(self.data.len() - at);
        buf[..take].copy_from_slice(&self.data[at..at + take]);
        Ok(take as u32)
    }

    async fn write(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        buf: &[u8],
        offset: u64,
    ) -> NineResult<u32> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let my = fid_of(refnum);

        if !fcbs.must(refnum).resource {
            return nine.write(my, buf, offset).await;
        }

        self.slurp(nine, my).await?;
        let end = offset as usize + buf.len();
        if end > self.limit {
            return Err(Errno::E2BIG); // the fork ceiling is a hard stop
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(buf);
        self.dirty = true;
        Ok(buf.len() as u32)
    }

    async fn get_eof(&mut self, ctx: Ctx<'_>, refnum: u16) -> NineResult<u64> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let my = fid_of(refnum);

        if !fcbs.must(refnum).resource {
            let stat = nine.getattr(my, STAT_SIZE).await?;
            return Ok(stat.size);
        }

        if self.scratch_fid == my {
            return Ok(self.data.len() as u64);
        }
        match nine.xattrwalk(my, fid::MF_TMP, XATTR_RESOURCE).await {
            Ok(size) => {
                let _ = nine.clunk(fid::MF_TMP).await;
                Ok(size)
            }
            Err(Errno::ENODATA) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn set_eof(&mut self, ctx: Ctx<'_>, refnum: u16, len: u64) -> NineResult<()> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let my = fid_of(refnum);

        if !fcbs.must(refnum).resource {
            return nine
                .setattr(my, SET_SIZE, Stat { size: len, ..Stat::default() })
                .await;
        }

        self.slurp(nine, my).await?;
        if len as usize > self.limit {
            return Err(Errno::E2BIG);
        }
        self.data.resize(len as usize, 0);
        self.dirty = true;
        Ok(())
    }

    async fn fget_attr(
        &mut self,
        ctx: Ctx<'_>,
        _cnid: i32,
        fid9: u32,
        _name: &str,
        fields: u32,
    ) -> NineResult<MfAttr> {
        let nine = ctx.nine;
        let mut attr = MfAttr::default();

        if fields & (MF_DSIZE | MF_TIME) != 0 {
            let mask = if fields & MF_DSIZE != 0 { STAT_SIZE } else { 0 }
                | if fields & MF_TIME != 0 { STAT_MTIME } else { 0 };
            let dstat = nine.getattr(fid9, mask).await?;
            attr.dsize = dstat.size;
            attr.unixtime = dstat.mtime_sec;
        }

        if fields & MF_RSIZE != 0 {
            if self.scratch_fid != 0 && fid9 == self.scratch_fid {
                attr.rsize = self.data.len() as u64;
            } else {
                match nine.xattrwalk(fid9, fid::MF_TMP, XATTR_RESOURCE).await {
                    Ok(size) => {
                        attr.rsize = size;
                        let _ = nine.clunk(fid::MF_TMP).await;
                    }
                    Err(Errno::ENODATA) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if fields & MF_FINFO != 0 {
            if nine.xattrwalk(fid9, fid::MF_TMP, XATTR_FINDER).await.is_ok() {
                let mut blob = [0u8; 32];
                let _ = nine.read(fid::MF_TMP, &mut blob, 0).await;
                let _ = nine.clunk(fid::MF_TMP).await;
                attr.finfo.copy_from_slice(&blob[0..16]);
                attr.fxinfo.copy_from_slice(&blob[16..32]);
            }
        }

        Ok(attr)
    }

    async fn fset_attr(
        &mut self,
        ctx: Ctx<'_>,
        _cnid: i32,
        fid9: u32,
        _name: &str,
        fields: u32,
        attr: &MfAttr,
    ) -> NineResult<()> {
        let nine = ctx.nine;

        if fields & MF_FINFO != 0 {
            nine.walk(fid9, fid::MF_TMP, &[]).await?;
            nine.xattrcreate(fid::MF_TMP, XATTR_FINDER, 32, 0).await?;
            let mut blob = [0u8; 32];
            blob[0..16].copy_from_slice(&attr.finfo);
            blob[16..32].copy_from_slice(&attr.fxinfo);
            let result = nine.write_all(fid::MF_TMP, &blob, 0).await;
            let _ = nine.clunk(fid::MF_TMP).await;
            result?;
        }

        Ok(())
    }

    async fn dget_attr(
        &mut self,
        _ctx: Ctx<'_>,
        _cnid: i32,
        _fid: u32,
        _name: &str,
        _fields: u32,
    ) -> NineResult<MfAttr> {
        // Benignly unimplemented
        Ok(MfAttr::default())
    }

    async fn dset_attr(
        &mut self,
        _ctx: Ctx<'_>,
        _cnid: i32,
        _fid: u32,
        _name: &str,
        _fields: u32,
        _attr: &MfAttr,
    ) -> NineResult<()> {
        // Benignly unimplemented
        Ok(())
    }

    async fn rename(
        &mut self,
        ctx: Ctx<'_>,
        fid1: u32,
        name1: &str,
        fid2: u32,
        name2: &str,
    ) -> NineResult<()> {
        ctx.nine.renameat(fid1, name1, fid2, name2).await
    }

    async fn delete(&mut self, ctx: Ctx<'_>, fid9: u32, name: &str, is_dir: bool) -> NineResult<()> {
        let nine = ctx.nine;
        nine.walk_exact(fid9, fid::MF_TMP, &[".."]).await?;
        let flags = if is_dir { AT_REMOVEDIR } else { 0 };
        nine.unlinkat(fid::MF_TMP, name, flags).await
    }

    fn is_sidecar(&self, _name: &str) -> bool {
        false
    }
}
