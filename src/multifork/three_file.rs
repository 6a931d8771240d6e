//! The three-file multifork format (best for development trees):
//!
//! ```text
//! FILE       = data fork
//! FILE.rdump = resource fork in Rez text
//! FILE.idump = type/creator and Finder flags as text
//! ```
//!
//! Directory metadata is discarded.
//!
//! Because the guest wants random access to a *binary* resource fork,
//! each recently-touched fork is kept compiled in a private cache
//! directory, with a "clean record" holding the (size, mtime) of the
//! Rez sidecar the binary was built from. While the sidecar still
//! matches its record the binary is reused; otherwise it is rebuilt
//! via [`crate::rez::rez`]. A fork dirtied by guest writes is
//! decompiled back to text on close, staged as `.rdump.tmp`, and
//! renamed over the sidecar atomically.

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::errors::{Errno, NineResult};
use crate::fcb::FcbTable;
use crate::nine::{
    fid, Client, Stat, AT_REMOVEDIR, O_CREAT, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY, SET_MTIME,
    SET_MTIME_SET, STAT_MTIME, STAT_SIZE,
};
use crate::rez::{derez, rez};

use super::flags::{flags_to_text, text_to_flags};
use super::{fid_of, Ctx, MfAttr, Multifork, MF_DSIZE, MF_FINFO, MF_RSIZE, MF_TIME};

/// Strategy-private FCB bit: fork bytes newer than the sidecar.
const DIRTY: u8 = 1;

pub struct ThreeFile;

impl ThreeFile {
    pub fn new() -> ThreeFile {
        ThreeFile
    }
}

impl Default for ThreeFile {
    fn default() -> ThreeFile {
        ThreeFile::new()
    }
}

fn forkname(cnid: i32) -> String {
    format!("{:08x}", cnid as u32)
}

fn rsname(cnid: i32) -> String {
    format!("{:08x}-rezstat", cnid as u32)
}

fn sidecarname(name: &str) -> String {
    format!("{}.rdump", name)
}

/// The clean record: sidecar size and mtime at the moment the cached
/// binary was last in agreement with it.
fn clean_record(stat: &Stat) -> [u8; 24] {
    let mut rec = [0u8; 24];
    rec[0..8].copy_from_slice(&stat.size.to_le_bytes());
    rec[8..16].copy_from_slice(&(stat.mtime_sec as u64).to_le_bytes());
    rec[16..24].copy_from_slice(&stat.mtime_nsec.to_le_bytes());
    rec
}

fn parse_clean_record(rec: &[u8; 24]) -> Stat {
    Stat {
        size: u64::from_le_bytes(rec[0..8].try_into().unwrap()),
        mtime_sec: u64::from_le_bytes(rec[8..16].try_into().unwrap()) as i64,
        mtime_nsec: u64::from_le_bytes(rec[16..24].try_into().unwrap()),
        ..Stat::default()
    }
}

#[async_trait]
impl Multifork for ThreeFile {
    fn name(&self) -> &'static str {
        ".idump/.rdump"
    }

    async fn init(&mut self, ctx: Ctx<'_>) -> NineResult<()> {
        let nine = ctx.nine;

        // Essentially mkdir -p of the fork cache parent
        loop {
            match nine.walk_path(fid::DOTDIR, fid::MF_DIR, "resforks").await {
                Ok(()) => break,
                Err(Errno::ENOENT) => {}
                Err(e) => panic!("unexpected cache-walk error: {:?}", e),
            }
            match nine.mkdir(fid::DOTDIR, 0o777, 0, "resforks").await {
                Ok(_) | Err(Errno::EEXIST) => {}
                Err(e) => panic!("unexpected cache-mkdir error: {:?}", e),
            }
        }

        // Linear-search a free per-boot directory name
        // TODO: delete stale sibling directories from earlier boots
        for i in 0u32.. {
            let name = i.to_string();
            if nine.mkdir(fid::MF_DIR, 0o777, 0, &name).await.is_ok() {
                nine.walk_path(fid::MF_DIR, fid::MF_DIR, &name)
                    .await
                    .expect("fresh cache directory went missing");
                debug!(dir = %name, "resource fork cache ready");
                break;
            }
        }

        Ok(())
    }

    async fn open(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        cnid: i32,
        fid9: u32,
        name: &str,
    ) -> NineResult<()> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let (resource, writable) = {
            let fcb = fcbs.must(refnum);
            (fcb.resource, fcb.writable)
        };
        let my = fid_of(refnum);

        if resource {
            let _ = nine.walk_path(fid9, fid::MF_PARENT, "..").await;
            stat_resource_fork(nine, fcbs, cnid, fid::MF_PARENT, name).await?;

            if nine.walk_path(fid::MF_DIR, my, &forkname(cnid)).await.is_err() {
                panic!("could not open even a stattable resource fork");
            }
        } else {
            // The data fork is simple: the file can only be opened if
            // it exists
            nine.walk_path(fid9, my, "").await?;
        }

        if writable {
            if nine.lopen(my, O_RDWR).await.is_ok() {
                return Ok(());
            }
        }
        nine.lopen(my, O_RDONLY).await.map(|_| ())
    }

    async fn close(&mut self, ctx: Ctx<'_>, refnum: u16) -> NineResult<()> {
        let Ctx { nine, catalog, fcbs } = ctx;
        let (cnid, resource, dirty) = {
            let fcb = fcbs.must(refnum);
            (fcb.cnid, fcb.resource, fcb.mf_flags & DIRTY != 0)
        };

        if resource && dirty {
            fcbs.for_each(cnid, true, |fcb| fcb.mf_flags &= !DIRTY);

            let (parent, name) = catalog
                .get(nine, cnid)
                .await
                .unwrap_or_else(|_| panic!("file was deleted while open"));
            if catalog.walk(nine, fid::MF_PARENT, parent, b"").await.is_err() {
                panic!("file went missing while open");
            }
            push_resource_fork(nine, cnid, fid::MF_PARENT, &name).await?;
        }

        nine.clunk(fid_of(refnum)).await
    }

    async fn read(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        buf: &mut [u8],
        offset: u64,
    ) -> NineResult<u32> {
        ctx.nine.read(fid_of(refnum), buf, offset).await
    }

    async fn write(
        &mut self,
        ctx: Ctx<'_>,
        refnum: u16,
        buf: &[u8],
        offset: u64,
    ) -> NineResult<u32> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let (cnid, resource, dirty) = {
            let fcb = fcbs.must(refnum);
            (fcb.cnid, fcb.resource, fcb.mf_flags & DIRTY != 0)
        };
        if resource && !dirty {
            fcbs.for_each(cnid, true, |fcb| fcb.mf_flags |= DIRTY);
        }
        nine.write(fid_of(refnum), buf, offset).await
    }

    async fn get_eof(&mut self, ctx: Ctx<'_>, refnum: u16) -> NineResult<u64> {
        let stat = ctx.nine.getattr(fid_of(refnum), STAT_SIZE).await?;
        Ok(stat.size)
    }

    async fn set_eof(&mut self, ctx: Ctx<'_>, refnum: u16, len: u64) -> NineResult<()> {
        let Ctx { nine, catalog, fcbs } = ctx;
        nine.setattr(fid_of(refnum), crate::nine::SET_SIZE, Stat { size: len, ..Stat::default() })
            .await?;

        // Take this as a promise that the resource data is consistent,
        // and an opportunity to write it out
        let (cnid, resource, dirty) = {
            let fcb = fcbs.must(refnum);
            (fcb.cnid, fcb.resource, fcb.mf_flags & DIRTY != 0)
        };
        if resource && (dirty || len == 0) {
            fcbs.for_each(cnid, true, |fcb| fcb.mf_flags &= !DIRTY);

            let (parent, name) = catalog
                .get(nine, cnid)
                .await
                .unwrap_or_else(|_| panic!("file was deleted while open"));
            if catalog.walk(nine, fid::MF_PARENT, parent, b"").await.is_err() {
                panic!("file went missing while open");
            }
            push_resource_fork(nine, cnid, fid::MF_PARENT, &name).await?;
        }
        Ok(())
    }

    async fn fget_attr(
        &mut self,
        ctx: Ctx<'_>,
        cnid: i32,
        fid9: u32,
        name: &str,
        fields: u32,
    ) -> NineResult<MfAttr> {
        let Ctx { nine, catalog: _, fcbs } = ctx;
        let mut attr = MfAttr::default();

        // Costly: stat the data fork. It is the essential part, so it
        // alone can fail the call.
        if fields & (MF_DSIZE | MF_TIME) != 0 {
            let mask = if fields & MF_DSIZE != 0 { STAT_SIZE } else { 0 }
                | if fields & MF_TIME != 0 { STAT_MTIME } else { 0 };
            let dstat = nine.getattr(fid9, mask).await?;
            attr.dsize = dstat.size;
            attr.unixtime = dstat.mtime_sec;
        }

        if fields & (MF_RSIZE | MF_TIME | MF_FINFO) != 0 {
            let _ = nine.walk_path(fid9, fid::MF_PARENT, "..").await;
        }

        // Very costly: make sure the resource fork has been compiled
        // into the cache, then stat that
        if fields & (MF_RSIZE | MF_TIME) != 0 {
            let rstat = stat_resource_fork(nine, fcbs, cnid, fid::MF_PARENT, name).await?;
            attr.rsize = rstat.size;
            if attr.unixtime < rstat.mtime_sec {
                attr.unixtime = rstat.mtime_sec;
            }
        }

        // Costly: read the Finder info sidecar
        if fields & MF_FINFO != 0 {
            let ipath = format!("../{}.idump", name);
            if nine.walk_path(fid9, fid::MF_FINFO, &ipath).await.is_ok()
                && nine.lopen(fid::MF_FINFO, O_RDONLY).await.is_ok()
            {
                let mut text = [0u8; 512];
                let got = nine.read(fid::MF_FINFO, &mut text, 0).await.unwrap_or(0) as usize;
                let _ = nine.clunk(fid::MF_FINFO).await;
                let (finfo, fxinfo) = text_to_flags(&text[..got]);
                attr.finfo = finfo;
                attr.fxinfo = fxinfo;
            }
        }

        Ok(attr)
    }

    async fn fset_attr(
        &mut self,
        ctx: Ctx<'_>,
        _cnid: i32,
        fid9: u32,
        name: &str,
        fields: u32,
        attr: &MfAttr,
    ) -> NineResult<()> {
        let nine = ctx.nine;

        // Time-setting stays unimplemented, like everything else that
        // would teach MPW to mark files corrupt.

        if fields & MF_FINFO != 0 {
            nine.walk_path(fid9, fid::MF_FINFO, "..")
                .await
                .expect("dot-dot should never fail");

            let iname = format!("{}.idump", name);
            nine.lcreate(fid::MF_FINFO, &iname, O_WRONLY | O_TRUNC | O_CREAT, 0o666, 0)
                .await?;
            let text = flags_to_text(&attr.finfo, &attr.fxinfo);
            nine.write_all(fid::MF_FINFO, &text, 0).await?;
            let _ = nine.clunk(fid::MF_FINFO).await;
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
        let nine = ctx.nine;
        nine.renameat(fid1, name1, fid2, name2).await?;

        let mut worst = Ok(());
        for suffix in [".rdump", ".idump"] {
            let old = format!("{}{}", name1, suffix);
            let new = format!("{}{}", name2, suffix);
            match nine.renameat(fid1, &old, fid2, &new).await {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => worst = Err(e),
            }
        }
        worst
    }

    async fn delete(&mut self, ctx: Ctx<'_>, fid9: u32, name: &str, is_dir: bool) -> NineResult<()> {
        let nine = ctx.nine;
        let _ = nine.walk_path(fid9, fid::MF_TMP, "..").await;

        if is_dir {
            return nine.unlinkat(fid::MF_TMP, name, AT_REMOVEDIR).await;
        }

        // The main file must go; the sidecars go best-effort
        nine.unlinkat(fid::MF_TMP, name, 0).await?;
        for suffix in [".rdump", ".idump"] {
            let side = format!("{}{}", name, suffix);
            let _ = nine.unlinkat(fid::MF_TMP, &side, 0).await;
        }
        Ok(())
    }

    fn is_sidecar(&self, name: &str) -> bool {
        name.ends_with(".rdump.tmp") || name.ends_with(".rdump") || name.ends_with(".idump")
    }
}

/// Bring the cached binary fork up to date with the sidecar and stat
/// it. Idempotent.
async fn stat_resource_fork(
    nine: &mut Client,
    fcbs: &mut FcbTable,
    cnid: i32,
    parentfid: u32,
    name: &str,
) -> NineResult<Stat> {
    // Delightfully quick case: an open fork makes the cache
    // authoritative
    if let Some(open) = fcbs.first(cnid, true) {
        trace!(cnid = %format_args!("{:08x}", cnid), "fork cache authoritative because open");
        return nine.getattr(fid_of(open), STAT_SIZE | STAT_MTIME).await;
    }

    if nine.walk_path(fid::MF_DIR, fid::MF_CLEANREC, &rsname(cnid)).await.is_err() {
        trace!("no clean record yet");
        return pull_resource_fork(nine, cnid, parentfid, name).await;
    }

    if nine.lopen(fid::MF_CLEANREC, O_RDONLY).await.is_err() {
        panic!("could not open an existing clean record");
    }
    let mut rec = [0u8; 24];
    let recsize = nine.read(fid::MF_CLEANREC, &mut rec, 0).await? as usize;
    let _ = nine.clunk(fid::MF_CLEANREC).await;

    let no_sidecar = nine
        .walk_path(parentfid, fid::MF_REZ, &sidecarname(name))
        .await
        .is_err();

    if recsize == 0 && no_sidecar {
        trace!("fork cache agreed empty");
        return Ok(Stat::default());
    } else if recsize == 0 {
        trace!("sidecar newly created");
        return pull_resource_fork(nine, cnid, parentfid, name).await;
    } else if no_sidecar {
        trace!("sidecar newly deleted");
        return pull_resource_fork(nine, cnid, parentfid, name).await;
    }

    let expect = parse_clean_record(&rec);
    let scstat = nine.getattr(fid::MF_REZ, STAT_SIZE | STAT_MTIME).await?;
    if scstat.size != expect.size
        || scstat.mtime_sec != expect.mtime_sec
        || scstat.mtime_nsec != expect.mtime_nsec
    {
        trace!("sidecar stat mismatch");
        return pull_resource_fork(nine, cnid, parentfid, name).await;
    }

    trace!("fork cache up to date");
    nine.walk_path(fid::MF_DIR, fid::MF_RESFORK, &forkname(cnid)).await?;
    let mut stat = nine.getattr(fid::MF_RESFORK, STAT_SIZE).await?;
    stat.mtime_sec = expect.mtime_sec;
    stat.mtime_nsec = expect.mtime_nsec;
    Ok(stat)
}

/// Rebuild the cached binary fork from the sidecar (or record it as
/// empty) and refresh the clean record.
async fn pull_resource_fork(
    nine: &mut Client,
    cnid: i32,
    parentfid: u32,
    name: &str,
) -> NineResult<Stat> {
    debug!(cnid = %format_args!("{:08x}", cnid), name, "pull resource fork");

    let empty = nine
        .walk_path(parentfid, fid::MF_REZ, &sidecarname(name))
        .await
        .is_err();

    if empty {
        nine.walk_path(fid::MF_DIR, fid::MF_RESFORK, "").await?;
        nine.lcreate(fid::MF_RESFORK, &forkname(cnid), O_WRONLY | O_TRUNC, 0o666, 0).await?;
        let _ = nine.clunk(fid::MF_RESFORK).await;

        nine.walk_path(fid::MF_DIR, fid::MF_CLEANREC, "").await?;
        if nine
            .lcreate(fid::MF_CLEANREC, &rsname(cnid), O_WRONLY | O_TRUNC, 0o666, 0)
            .await
            .is_err()
        {
            panic!("failed to create an empty clean record");
        }
        let _ = nine.clunk(fid::MF_CLEANREC).await;

        return Ok(Stat::default());
    }

    let scstat = nine.getattr(fid::MF_REZ, STAT_SIZE | STAT_MTIME).await?;
    if nine.lopen(fid::MF_REZ, O_RDONLY).await.is_err() {
        panic!("failed to open an extant sidecar");
    }

    nine.walk_path(fid::MF_DIR, fid::MF_RESFORK, "").await?;
    if nine
        .lcreate(fid::MF_RESFORK, &forkname(cnid), O_WRONLY | O_TRUNC, 0o666, 0)
        .await
        .is_err()
    {
        panic!("failed to create the fork cache file");
    }

    let size = rez(nine, fid::MF_REZ, fid::MF_RESFORK).await?;
    nine.setattr(fid::MF_RESFORK, SET_MTIME | SET_MTIME_SET, scstat).await?;

    nine.walk_path(fid::MF_DIR, fid::MF_CLEANREC, "").await?;
    if nine
        .lcreate(fid::MF_CLEANREC, &rsname(cnid), O_WRONLY | O_TRUNC, 0o666, 0)
        .await
        .is_err()
    {
        panic!("failed to create the clean record");
    }
    nine.write_all(fid::MF_CLEANREC, &clean_record(&scstat), 0).await?;

    let _ = nine.clunk(fid::MF_REZ).await;
    let _ = nine.clunk(fid::MF_RESFORK).await;
    let _ = nine.clunk(fid::MF_CLEANREC).await;

    Ok(Stat {
        size: size as u64,
        mtime_sec: scstat.mtime_sec,
        mtime_nsec: scstat.mtime_nsec,
        ..Stat::default()
    })
}

/// Decompile the cached binary fork back over the sidecar, staging the
/// text as `.rdump.tmp` and renaming it into place. A zero-byte fork
/// deletes the sidecar instead.
async fn push_resource_fork(
    nine: &mut Client,
    cnid: i32,
    parentfid: u32,
    name: &str,
) -> NineResult<()> {
    if nine.walk_path(fid::MF_DIR, fid::MF_RESFORK, &forkname(cnid)).await.is_err() {
        panic!("no cached fork to push");
    }
    let forkstat = nine.getattr(fid::MF_RESFORK, STAT_SIZE).await?;

    if forkstat.size == 0 {
        debug!(name, "push resource fork: empty");
        nine.walk_path(fid::MF_DIR, fid::MF_CLEANREC, "").await?;
        if nine
            .lcreate(fid::MF_CLEANREC, &rsname(cnid), O_WRONLY | O_TRUNC, 0o666, 0)
            .await
            .is_err()
        {
            panic!("failed to create the clean record");
        }
        let _ = nine.clunk(fid::MF_CLEANREC).await;
        let _ = nine.unlinkat(parentfid, &sidecarname(name), 0).await; // no sidecar for an empty fork
        return Ok(());
    }

    debug!(name, size = forkstat.size, "push resource fork");
    let tmpname = format!("{}.rdump.tmp", name);
    nine.walk_path(parentfid, fid::MF_REZ, "").await?;
    if nine.lcreate(fid::MF_REZ, &tmpname, O_WRONLY | O_TRUNC, 0o666, 0).await.is_err() {
        panic!("unable to create the staging sidecar");
    }
    let _ = nine.lopen(fid::MF_RESFORK, O_RDONLY).await;

    derez(nine, fid::MF_RESFORK, fid::MF_REZ).await?;
    let scstat = nine.getattr(fid::MF_REZ, STAT_SIZE | STAT_MTIME).await?;
    let _ = nine.clunk(fid::MF_REZ).await;
    let _ = nine.clunk(fid::MF_RESFORK).await;

    nine.renameat(parentfid, &tmpname, parentfid, &sidecarname(name)).await?;

    nine.walk_path(fid::MF_DIR, fid::MF_CLEANREC, "").await?;
    if nine
        .lcreate(fid::MF_CLEANREC, &rsname(cnid), O_WRONLY | O_TRUNC, 0o666, 0)
        .await
        .is_err()
    {
        panic!("failed to create the clean record");
    }
    nine.write_all(fid::MF_CLEANREC, &clean_record(&scstat), 0).await?;
    let _ = nine.clunk(fid::MF_CLEANREC).await;

    Ok(())
}
