//! Open files: the open/close/read/write/EOF half of the façade.

use tracing::trace;

use crate::catalog::Catalog;
use crate::errors::{Errno, FsError, FsResult};
use crate::multifork::MF_FINFO;
use crate::nine::fid;

use super::Volume;

/// Which fork of a file an open names.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fork {
    Data,
    Resource,
}

/// Positioning mode for a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SeekMode {
    AtMark,
    FromStart,
    FromLeof,
    FromMark,
}

/// What a transfer accomplished. `hit_eof` reports the short-read
/// condition the guest distinguishes from success.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IoOutcome {
    pub actual: u32,
    pub pos: u32,
    pub hit_eof: bool,
}

/// Sizes the guest's 32-bit fields cannot exceed.
const MAX_GUEST_LEN: u64 = 0xffff_fd00;

impl Volume {
    /// Open a fork of the file at `path`, returning its refnum.
    pub async fn open(
        &mut self,
        base: i32,
        path: &[u8],
        fork: Fork,
        writable: bool,
    ) -> FsResult<u16> {
        let Some(refnum) = self.fcbs.allocate() else {
            return Err(FsError::TooManyOpenFiles);
        };

        let result = self.open_inner(refnum, base, path, fork, writable).await;
        if result.is_err() {
            self.fcbs.free(refnum); // don't leak the record
        }
        result.map(|()| refnum)
    }

    async fn open_inner(
        &mut self,
        refnum: u16,
        base: i32,
        path: &[u8],
        fork: Fork,
        writable: bool,
    ) -> FsResult<()> {
        let hit = self.catalog.walk(&mut self.nine, fid::VOL_A, base, path).await?;
        if Catalog::is_dir(hit.cnid) {
            return Err(FsError::NotFound);
        }

        let (mf, ctx) = self.mf_ctx();
        let attr = mf
            .fget_attr(ctx, hit.cnid, fid::VOL_A, &hit.name, MF_FINFO)
            .await
            .unwrap_or_default();

        {
            let fcb = self.fcbs.claim_mut(refnum);
            fcb.cnid = hit.cnid;
            fcb.resource = fork == Fork::Resource;
            fcb.writable = writable;
            fcb.dir_id = hit.parent;
            fcb.ftype.copy_from_slice(&attr.finfo[0..4]);
            fcb.name = hit.name.clone();
        }

        let (mf, ctx) = self.mf_ctx();
        match mf.open(ctx, refnum, hit.cnid, fid::VOL_A, &hit.name).await {
            Ok(()) => {}
            Err(Errno::EPERM) => return Err(FsError::Permission),
            Err(Errno::ENOENT) => return Err(FsError::NotFound),
            Err(_) => return Err(FsError::Io),
        }

        self.fcbs.enlist(refnum);

        let (mf, ctx) = self.mf_ctx();
        let size = mf.get_eof(ctx, refnum).await.unwrap_or(0).min(MAX_GUEST_LEN);
        self.update_known_length(refnum, size as u32);

        trace!(refnum, cnid = %format_args!("{:08x}", hit.cnid), "opened");
        Ok(())
    }

    pub async fn close(&mut self, refnum: u16) -> FsResult<()> {
        if self.fcbs.get(refnum).is_none() {
            return Err(FsError::BadParameter);
        }
        self.fcbs.delist(refnum);
        let (mf, ctx) = self.mf_ctx();
        let _ = mf.close(ctx, refnum).await;
        self.fcbs.free(refnum);
        Ok(())
    }

    /// Read into `buf` at the position `mode`/`offset` describe. Seek
    /// and tell are the zero-length cases of this call.
    pub async fn read(
        &mut self,
        refnum: u16,
        mode: SeekMode,
        offset: i32,
        buf: &mut [u8],
    ) -> FsResult<IoOutcome> {
        let Some(fcb) = self.fcbs.get(refnum) else {
            return Err(FsError::BadParameter);
        };
        let mark = fcb.mark;
        let mut eof = fcb.eof;

        if mode == SeekMode::FromLeof {
            // Re-check the on-disk EOF for concurrent modification
            let (mf, ctx) = self.mf_ctx();
            let cur = mf.get_eof(ctx, refnum).await.map_err(|_| FsError::Io)?;
            eof = cur.min(MAX_GUEST_LEN) as u32;
            self.update_known_length(refnum, eof);
        }

        let start = match mode {
            SeekMode::AtMark => mark as i64,
            SeekMode::FromStart => offset as i64,
            SeekMode::FromLeof => eof as i64 + offset as i64,
            SeekMode::FromMark => mark as i64 + offset as i64,
        };

        // Cannot position before the start of the file
        if start < 0 {
            return Err(FsError::BadPosition);
        }
        let start = start as u32;
        let end = start as u64 + buf.len() as u64;

        // Zero-length transfers are seek/tell
        if buf.is_empty() {
            return if start > eof {
                self.fcbs.must(refnum).mark = eof;
                Ok(IoOutcome { actual: 0, pos: eof, hit_eof: true })
            } else {
                self.fcbs.must(refnum).mark = start;
                Ok(IoOutcome { actual: 0, pos: start, hit_eof: false })
            };
        }

        let chunk = self.nine.max_message as usize;
        let mut pos = start as u64;
        while pos != end {
            let want = ((end - pos) as usize).min(chunk);
            let at = (pos - start as u64) as usize;
            let (mf, ctx) = self.mf_ctx();
            let got = mf
                .read(ctx, refnum, &mut buf[at..at + want], pos)
                .await
                .map_err(|_| FsError::Io)? as usize;
            pos += got as u64;
            if got != want {
                break;
            }
        }

        // The file proved longer or shorter than we believed
        if pos > eof as u64 || pos < end {
            self.update_known_length(refnum, pos.min(MAX_GUEST_LEN) as u32);
        }

        let fcb = self.fcbs.must(refnum);
        fcb.mark = pos as u32;
        Ok(IoOutcome {
            actual: (pos - start as u64) as u32,
            pos: pos as u32,
            hit_eof: pos != end,
        })
    }

    /// Write `buf` at the position `mode`/`offset` describe.
    pub async fn write(
        &mut self,
        refnum: u16,
        mode: SeekMode,
        offset: i32,
        buf: &[u8],
    ) -> FsResult<IoOutcome> {
        let Some(fcb) = self.fcbs.get(refnum) else {
            return Err(FsError::BadParameter);
        };
        if !fcb.writable {
            return Err(FsError::Permission);
        }
        let mark = fcb.mark;
        let mut eof = fcb.eof;

        if mode == SeekMode::FromLeof {
            let (mf, ctx) = self.mf_ctx();
            let cur = mf.get_eof(ctx, refnum).await.map_err(|_| FsError::Io)?;
            eof = cur.min(MAX_GUEST_LEN) as u32;
            self.update_known_length(refnum, eof);
        }

        let start = match mode {
            SeekMode::AtMark => mark as i64,
            SeekMode::FromStart => offset as i64,
            SeekMode::FromLeof => eof as i64 + offset as i64,
            SeekMode::FromMark => mark as i64 + offset as i64,
        };
        if start < 0 {
            return Err(FsError::BadPosition);
        }
        let start = start as u32;
        let end = start as u64 + buf.len() as u64;

        let chunk = self.nine.max_message as usize;
        let mut pos = start as u64;
        while pos != end {
            let want = ((end - pos) as usize).min(chunk);
            let at = (pos - start as u64) as usize;
            let (mf, ctx) = self.mf_ctx();
            let got = mf
                .write(ctx, refnum, &buf[at..at + want], pos)
                .await
                .map_err(FsError::from)? as usize;
            pos += got as u64;
            if got != want {
                panic!("write call incomplete"); // upstream already promised these bytes
            }
        }

        if pos > eof as u64 {
            self.update_known_length(refnum, pos.min(MAX_GUEST_LEN) as u32);
        }

        let fcb = self.fcbs.must(refnum);
        fcb.mark = pos as u32;
        Ok(IoOutcome {
            actual: (pos - start as u64) as u32,
            pos: pos as u32,
            hit_eof: false,
        })
    }

    pub async fn get_pos(&mut self, refnum: u16) -> FsResult<u32> {
        Ok(self.read(refnum, SeekMode::AtMark, 0, &mut []).await?.pos)
    }

    pub async fn set_pos(&mut self, refnum: u16, mode: SeekMode, offset: i32) -> FsResult<u32> {
        let outcome = self.read(refnum, mode, offset, &mut []).await?;
        if outcome.hit_eof {
            return Err(FsError::Eof);
        }
        Ok(outcome.pos)
    }

    pub async fn get_eof(&mut self, refnum: u16) -> FsResult<u32> {
        if self.fcbs.get(refnum).is_none() {
            return Err(FsError::BadParameter);
        }
        let (mf, ctx) = self.mf_ctx();
        let size = mf.get_eof(ctx, refnum).await.map_err(|_| FsError::Io)?;
        let size = size.min(MAX_GUEST_LEN) as u32;
        self.fcbs.must(refnum).eof = size;
        Ok(size)
    }

    pub async fn set_eof(&mut self, refnum: u16, len: u32) -> FsResult<()> {
        if self.fcbs.get(refnum).is_none() {
            return Err(FsError::BadParameter);
        }
        let (mf, ctx) = self.mf_ctx();
        mf.set_eof(ctx, refnum, len as u64).await.map_err(FsError::from)?;
        self.update_known_length(refnum, len);
        Ok(())
    }

    /// Propagate a discovered length to every duplicate FCB of the
    /// same fork.
    pub(crate) fn update_known_length(&mut self, refnum: u16, length: u32) {
        let (cnid, resource) = {
            let fcb = self.fcbs.must(refnum);
            (fcb.cnid, fcb.resource)
        };
        self.fcbs.for_each(cnid, resource, |fcb| {
            fcb.eof = length;
            fcb.plen = (length + 511) & !511;
        });
    }
}
