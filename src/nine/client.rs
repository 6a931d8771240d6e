//! The 9P2000.L client proper.
//!
//! One transaction tag, one request in flight: `transact` publishes a
//! descriptor chain, rings the doorbell, then polls the virtqueue until
//! its completion comes back, yielding to the runtime between polls.
//! Request and reply bytes are staged through dedicated regions of
//! guest memory, chained to the device in page-sized pieces with the
//! transmit ranges first.

use tracing::trace;

use crate::errors::{Errno, NineResult};
use crate::virtio::{service_interrupt, GuestRam, PhysAddr, Transport, Virtqueue, PAGE};

use super::wire::{qid_at, Reply, Req};
use super::{MsgType, Qid, Stat, Statfs, AT_REMOVEDIR, NOFID, STRMAX};

/// All replies carry the one tag the client ever issues.
const ONLY_TAG: u16 = 0;

/// Worst-case packed names in one Twalk, bytes.
const WALK_PACK_MAX: usize = 1024;

/// Protocol ceiling on names per Twalk.
const WALK_BATCH: usize = 16;

pub struct Client {
    ram: GuestRam,
    transport: Box<dyn Transport>,
    queue: Virtqueue,
    tx_hdr: PhysAddr,
    rx_hdr: PhysAddr,
    tx_big: PhysAddr,
    rx_big: PhysAddr,
    big_capacity: usize,
    /// Negotiated maximum message size.
    pub max_message: u32,
    openfids: u32,
    next_token: u64,
    done_token: Option<u64>,
}

/// Cursor state for streaming one directory's entries.
pub struct DirStream {
    fid: u32,
    next_request: u64,
    capacity: u32,
    data: Vec<u8>,
    used: usize,
}

/// One Rreaddir record.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub qid: Qid,
    pub typ: u8,
    pub name: String,
}

impl Client {
    /// Bring up the 9P layer over an already-negotiated transport:
    /// initialise queue 0, stage buffers, and exchange Tversion.
    /// `bufs` is the requested descriptor budget (clamped to the ring).
    pub async fn connect(
        ram: GuestRam,
        mut transport: Box<dyn Transport>,
        bufs: u16,
    ) -> NineResult<Client> {
        let queue = Virtqueue::init(&ram, &mut *transport, 0, bufs).ok_or(Errno::ENODEV)?;
        if queue.size() < 8 {
            return Err(Errno::ENODEV); // too few descriptors to be useful
        }

        let bufs = queue.size() as usize;
        // Enough room that any message fits in page-sized chunks with
        // header descriptors to spare.
        let big_pages = bufs - 4;
        let max_message = (PAGE * big_pages) as u32;

        let tx_hdr = ram.alloc_pages(1);
        let rx_hdr = ram.alloc_pages(1);
        let tx_big = ram.alloc_pages(big_pages);
        let rx_big = ram.alloc_pages(big_pages);

        let mut client = Client {
            ram,
            transport,
            queue,
            tx_hdr,
            rx_hdr,
            tx_big,
            rx_big,
            big_capacity: PAGE * big_pages,
            max_message,
            openfids: 0,
            next_token: 0,
            done_token: None,
        };

        // size[4] Tversion tag[2] msize[4] version[s]
        // size[4] Rversion tag[2] msize[4] version[s]
        let req = Req::new(MsgType::Tversion).d(client.max_message).s("9P2000.L");
        let mut reply = client.transact(req, 7 + 4 + 2 + STRMAX, &[], None).await?;
        let msize = reply.d();
        let proto = reply.s();
        if proto != "9P2000.L" {
            return Err(Errno::EPROTONOSUPPORT);
        }
        client.max_message = client.max_message.min(msize);

        Ok(client)
    }

    /// The device config area (mount tag lives there).
    pub fn device_config(&mut self) -> Vec<u8> {
        self.transport.config()
    }

    /// The interrupt entry point: disarm, drain, rearm, drain again.
    /// Any completion observed is remembered for the in-flight
    /// `transact`, which may be what this interrupt unblocks.
    pub fn service_interrupt(&mut self) {
        let Client { queue, transport, done_token, .. } = self;
        service_interrupt(
            std::slice::from_mut(queue),
            &mut **transport,
            &mut |_q, _len, tag| *done_token = Some(tag),
        );
    }

    /// Issue one request and wait for its reply.
    ///
    /// `rx_fixed` is the worst-case size of the reply's fixed part
    /// including the 7-byte header; it is grown to 11 bytes so an
    /// `Rlerror` always fits somewhere. `tx_trailer` and `rx_trailer`
    /// are the large payloads, staged separately and chained after the
    /// header descriptors.
    async fn transact(
        &mut self,
        req: Req,
        rx_fixed: usize,
        tx_trailer: &[u8],
        mut rx_trailer: Option<&mut [u8]>,
    ) -> NineResult<Reply> {
        let t = req.msg_type();
        let expect = t as u8 + 1;

        let rx_trailer_len = rx_trailer.as_ref().map_or(0, |b| b.len());
        let mut rs = rx_fixed;
        if rs < 11 && rx_trailer_len == 0 {
            rs = 11; // room for Rlerror
        }
        assert!(rs <= PAGE && tx_trailer.len() <= self.big_capacity);
        assert!(rx_trailer_len <= self.big_capacity);

        let tx = req.finish(ONLY_TAG, tx_trailer.len() as u32);
        assert!(tx.len() <= PAGE, "request header overflow");

        self.ram.write(self.tx_hdr, &tx);
        self.ram.write(self.tx_big, tx_trailer);
        self.ram.write(self.rx_hdr, &vec![0u8; rs]);

        // Gather the scatter list, transmit ranges first, big buffers
        // cut into page-sized extents.
        let mut addrs: Vec<PhysAddr> = Vec::with_capacity(8);
        let mut lens: Vec<u32> = Vec::with_capacity(8);
        addrs.push(self.tx_hdr);
        lens.push(tx.len() as u32);
        chunk_pages(self.tx_big, tx_trailer.len(), &mut addrs, &mut lens);
        let n_out = addrs.len();
        addrs.push(self.rx_hdr);
        lens.push(rs as u32);
        chunk_pages(self.rx_big, rx_trailer_len, &mut addrs, &mut lens);
        let n_in = addrs.len() - n_out;

        let token = self.next_token;
        self.next_token += 1;

        trace!(cmd = ?t, tx = tx.len(), trailer = tx_trailer.len(), "transact");

        self.done_token = None;
        self.queue.send(n_out, n_in, &addrs, &lens, token);
        self.queue.notify(&mut *self.transport);

        // Spin until our completion arrives. The poll is the event
        // pump; yielding keeps the rest of the world turning.
        loop {
            let Client { queue, done_token, .. } = self;
            queue.poll(&mut |_q, _len, tag| *done_token = Some(tag));
            if self.done_token == Some(token) {
                self.done_token = None;
                break;
            }
            tokio::task::yield_now().await;
        }

        let fixed = self.ram.read_vec(self.rx_hdr, rs);

        if fixed[4] == MsgType::Rlerror as u8 {
            // size[4] Rlerror tag[2] errno[4] -- the errno may be split
            // between the fixed buffer and the trailer
            let mut err = 0u32;
            for i in 0..4 {
                let at = 7 + i;
                let byte = if at < rs {
                    fixed[at]
                } else {
                    self.ram.read_vec(self.rx_big + (at - rs) as u32, 1)[0]
                };
                err |= (byte as u32) << (8 * i);
            }
            trace!(cmd = ?t, errno = err, "remote error");
            return Err(Errno(err));
        }

        if fixed[4] != expect {
            panic!("expected reply type {} got {}", expect, fixed[4]);
        }

        if let Some(buf) = rx_trailer.as_deref_mut() {
            self.ram.read(self.rx_big, buf);
        }

        Ok(Reply::new(fixed))
    }

    /// size[4] Tattach tag[2] fid[4] afid[4] uname[s] aname[s] n_uname[4]
    /// size[4] Rattach tag[2] qid[13]
    pub async fn attach(
        &mut self,
        fid: u32,
        afid: Option<u32>,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> NineResult<Qid> {
        let req = Req::new(MsgType::Tattach)
            .d(fid)
            .d(afid.unwrap_or(NOFID))
            .s(uname)
            .s(aname)
            .d(n_uname);
        let mut reply = self.transact(req, 7 + 13, &[], None).await?;
        Ok(reply.qid())
    }

    /// size[4] Tstatfs tag[2] fid[4]
    /// size[4] Rstatfs tag[2] type[4] bsize[4] blocks[8] bfree[8]
    ///                 bavail[8] files[8] ffree[8] fsid[8] namelen[4]
    pub async fn statfs(&mut self, fid: u32) -> NineResult<Statfs> {
        let req = Req::new(MsgType::Tstatfs).d(fid);
        let mut r = self.transact(req, 7 + 8 + 48 + 4, &[], None).await?;
        Ok(Statfs {
            typ: r.d(),
            bsize: r.d(),
            blocks: r.q(),
            bfree: r.q(),
            bavail: r.q(),
            files: r.q(),
            ffree: r.q(),
            fsid: r.q(),
            namelen: r.d(),
        })
    }

    /// size[4] Twalk tag[2] fid[4] newfid[4] nwname[2] nwname*(wname[s])
    /// size[4] Rwalk tag[2] nwqid[2] nwqid*(wqid[13])
    ///
    /// Respects the protocol's 16-component maximum by batching. Call
    /// with no names to duplicate a fid. The returned qids may be fewer
    /// than asked: a short vector is how the caller learns which
    /// component failed. `newfid` is only installed on full success.
    pub async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> NineResult<Vec<Qid>> {
        if newfid < 32 && fid != newfid && self.openfids & (1 << newfid) != 0 {
            let _ = self.clunk(newfid).await;
        }

        let mut qids: Vec<Qid> = Vec::with_capacity(names.len());
        let mut done = 0;
        loop {
            let mut pack = Vec::new();
            let mut willdo = 0usize;
            while done + willdo < names.len() && willdo < WALK_BATCH {
                let name = names[done + willdo].as_bytes();
                if pack.len() + 2 + name.len() >= WALK_PACK_MAX {
                    break;
                }
                pack.extend_from_slice(&(name.len() as u16).to_le_bytes());
                pack.extend_from_slice(name);
                willdo += 1;
            }

            // Failed to pack even one name? (The zero-name case is the
            // legitimate fid duplication.)
            if willdo == 0 && !names.is_empty() {
                return Err(Errno::ENOMEM);
            }

            // Later batches continue in place from where the first
            // one left the new fid
            let from = if done == 0 { fid } else { newfid };

            let mut qbuf = [0u8; WALK_BATCH * 13];
            let req = Req::new(MsgType::Twalk).d(from).d(newfid).w(willdo as u16);
            let mut reply = match self.transact(req, 7 + 2, &pack, Some(&mut qbuf)).await {
                Ok(r) => r,
                // A first-component miss comes back as an error rather
                // than a short Rwalk; both mean "stopped here"
                Err(Errno::ENOENT) => return Ok(qids),
                Err(e) => return Err(e),
            };

            let ok = reply.w() as usize;
            for i in 0..ok.min(WALK_BATCH) {
                qids.push(qid_at(&qbuf, 13 * i));
            }
            done += ok;

            if ok < willdo {
                return Ok(qids); // partial: not found somewhere
            }

            // The server has installed the new fid now
            if newfid < 32 {
                self.openfids |= 1 << newfid;
            }
            if done >= names.len() {
                break;
            }
        }

        Ok(qids)
    }

    /// Like [`Client::walk`] but failing cleanly unless every component
    /// resolved.
    pub async fn walk_exact(&mut self, fid: u32, newfid: u32, names: &[&str]) -> NineResult<Vec<Qid>> {
        let qids = self.walk(fid, newfid, names).await?;
        if qids.len() < names.len() {
            return Err(Errno::ENOENT);
        }
        Ok(qids)
    }

    /// Walk a slash-separated path in a single message. Panics past 16
    /// components or 1 KiB of packed names; callers pre-validate.
    pub async fn walk_path(&mut self, fid: u32, newfid: u32, path: &str) -> NineResult<()> {
        if newfid < 32 && fid != newfid && self.openfids & (1 << newfid) != 0 {
            let _ = self.clunk(newfid).await;
        }

        let mut pack = Vec::new();
        let mut components = 0u16;
        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }
            if pack.len() + 2 + part.len() > WALK_PACK_MAX {
                panic!("walk_path: too many characters");
            }
            if components == WALK_BATCH as u16 {
                panic!("walk_path: too many components");
            }
            pack.extend_from_slice(&(part.len() as u16).to_le_bytes());
            pack.extend_from_slice(part.as_bytes());
            components += 1;
        }

        let mut qbuf = [0u8; WALK_BATCH * 13];
        let req = Req::new(MsgType::Twalk).d(fid).d(newfid).w(components);
        let result = self.transact(req, 7 + 2, &pack, Some(&mut qbuf)).await;
        let mut reply = match result {
            Ok(r) => r,
            Err(e) => {
                if components == 0 {
                    panic!("a walk of zero components should never fail");
                }
                return Err(e);
            }
        };

        if reply.w() != components {
            return Err(Errno::ENOENT);
        }
        if newfid < 32 {
            self.openfids |= 1 << newfid;
        }
        Ok(())
    }

    /// size[4] Tlopen tag[2] fid[4] flags[4]
    /// size[4] Rlopen tag[2] qid[13] iounit[4]
    pub async fn lopen(&mut self, fid: u32, flags: u32) -> NineResult<(Qid, u32)> {
        let req = Req::new(MsgType::Tlopen).d(fid).d(flags);
        let mut r = self.transact(req, 7 + 13 + 4, &[], None).await?;
        Ok((r.qid(), r.d()))
    }

    /// size[4] Tlcreate tag[2] fid[4] name[s] flags[4] mode[4] gid[4]
    /// size[4] Rlcreate tag[2] qid[13] iounit[4]
    pub async fn lcreate(
        &mut self,
        fid: u32,
        name: &str,
        flags: u32,
        mode: u32,
        gid: u32,
    ) -> NineResult<(Qid, u32)> {
        let req = Req::new(MsgType::Tlcreate).d(fid).s(name).d(flags).d(mode).d(gid);
        let mut r = self.transact(req, 7 + 13 + 4, &[], None).await?;
        Ok((r.qid(), r.d()))
    }

    /// size[4] Txattrwalk tag[2] fid[4] newfid[4] name[s]
    /// size[4] Rxattrwalk tag[2] size[8]
    pub async fn xattrwalk(&mut self, fid: u32, newfid: u32, name: &str) -> NineResult<u64> {
        if newfid < 32 && fid != newfid && self.openfids & (1 << newfid) != 0 {
            let _ = self.clunk(newfid).await;
        }
        let req = Req::new(MsgType::Txattrwalk).d(fid).d(newfid).s(name);
        let mut r = self.transact(req, 7 + 8, &[], None).await?;
        if newfid < 32 {
            self.openfids |= 1 << newfid;
        }
        Ok(r.q())
    }

    /// size[4] Txattrcreate tag[2] fid[4] name[s] attr_size[8] flags[4]
    /// size[4] Rxattrcreate tag[2]
    pub async fn xattrcreate(&mut self, fid: u32, name: &str, size: u64, flags: u32) -> NineResult<()> {
        let req = Req::new(MsgType::Txattrcreate).d(fid).s(name).q(size).d(flags);
        self.transact(req, 7, &[], None).await?;
        Ok(())
    }

    /// size[4] Tremove tag[2] fid[4]
    pub async fn remove(&mut self, fid: u32) -> NineResult<()> {
        if fid < 32 {
            self.openfids &= !(1 << fid);
        }
        let req = Req::new(MsgType::Tremove).d(fid);
        self.transact(req, 7, &[], None).await?;
        Ok(())
    }

    /// size[4] Tunlinkat tag[2] dirfd[4] name[s] flags[4]
    /// The only flag is [`AT_REMOVEDIR`].
    pub async fn unlinkat(&mut self, dirfid: u32, name: &str, flags: u32) -> NineResult<()> {
        debug_assert!(flags == 0 || flags == AT_REMOVEDIR);
        let req = Req::new(MsgType::Tunlinkat).d(dirfid).s(name).d(flags);
        self.transact(req, 7, &[], None).await?;
        Ok(())
    }

    /// size[4] Trenameat tag[2] olddirfid[4] oldname[s] newdirfid[4] newname[s]
    pub async fn renameat(
        &mut self,
        olddirfid: u32,
        oldname: &str,
        newdirfid: u32,
        newname: &str,
    ) -> NineResult<()> {
        let req = Req::new(MsgType::Trenameat).d(olddirfid).s(oldname).d(newdirfid).s(newname);
        self.transact(req, 7, &[], None).await?;
        Ok(())
    }

    /// size[4] Tmkdir tag[2] dfid[4] name[s] mode[4] gid[4]
    /// size[4] Rmkdir tag[2] qid[13]
    pub async fn mkdir(&mut self, dfid: u32, mode: u32, gid: u32, name: &str) -> NineResult<Qid> {
        let req = Req::new(MsgType::Tmkdir).d(dfid).s(name).d(mode).d(gid);
        let mut r = self.transact(req, 7 + 13, &[], None).await?;
        Ok(r.qid())
    }

    /// size[4] Tgetattr tag[2] fid[4] request_mask[8]
    /// size[4] Rgetattr tag[2] valid[8] qid[13] mode[4] uid[4] gid[4]
    ///                  nlink[8] rdev[8] size[8] blksize[8] blocks[8]
    ///                  atime[8+8] mtime[8+8] ctime[8+8] btime[8+8]
    ///                  gen[8] data_version[8]
    pub async fn getattr(&mut self, fid: u32, request_mask: u64) -> NineResult<Stat> {
        let req = Req::new(MsgType::Tgetattr).d(fid).q(request_mask);
        let mut r = self.transact(req, 7 + 8 + 13 + 12 + 8 * 15, &[], None).await?;
        Ok(Stat {
            valid: r.q(),
            qid: r.qid(),
            mode: r.d(),
            uid: r.d(),
            gid: r.d(),
            nlink: r.q(),
            rdev: r.q(),
            size: r.q(),
            blksize: r.q(),
            blocks: r.q(),
            atime_sec: r.q() as i64,
            atime_nsec: r.q(),
            mtime_sec: r.q() as i64,
            mtime_nsec: r.q(),
            ctime_sec: r.q() as i64,
            ctime_nsec: r.q(),
            // btime, gen and data_version are discarded
        })
    }

    /// size[4] Tsetattr tag[2] fid[4] valid[4] mode[4] uid[4] gid[4]
    ///                  size[8] atime[8+8] mtime[8+8]
    pub async fn setattr(&mut self, fid: u32, valid: u32, to: Stat) -> NineResult<()> {
        let req = Req::new(MsgType::Tsetattr)
            .d(fid)
            .d(valid)
            .d(to.mode)
            .d(to.uid)
            .d(to.gid)
            .q(to.size)
            .q(to.atime_sec as u64)
            .q(to.atime_nsec)
            .q(to.mtime_sec as u64)
            .q(to.mtime_nsec);
        self.transact(req, 7, &[], None).await?;
        Ok(())
    }

    /// size[4] Tclunk tag[2] fid[4]
    pub async fn clunk(&mut self, fid: u32) -> NineResult<()> {
        if fid < 32 {
            self.openfids &= !(1 << fid);
        }
        let req = Req::new(MsgType::Tclunk).d(fid);
        self.transact(req, 7, &[], None).await?;
        Ok(())
    }

    /// size[4] Tread tag[2] fid[4] offset[8] count[4]
    /// size[4] Rread tag[2] count[4] data[count]
    ///
    /// A short count is normal (EOF). Bytes beyond the returned count
    /// are unspecified.
    pub async fn read(&mut self, fid: u32, buf: &mut [u8], offset: u64) -> NineResult<u32> {
        let count = buf.len() as u32;
        let req = Req::new(MsgType::Tread).d(fid).q(offset).d(count);
        let mut r = self.transact(req, 7 + 4, &[], Some(buf)).await?;
        Ok(r.d())
    }

    /// size[4] Twrite tag[2] fid[4] offset[8] count[4] data[count]
    /// size[4] Rwrite tag[2] count[4]
    pub async fn write(&mut self, fid: u32, buf: &[u8], offset: u64) -> NineResult<u32> {
        let req = Req::new(MsgType::Twrite).d(fid).q(offset).d(buf.len() as u32);
        let mut r = self.transact(req, 7 + 4, buf, None).await?;
        Ok(r.d())
    }

    /// Write that treats a short count as the failure it is: the caller
    /// has already committed to these bytes existing.
    pub async fn write_all(&mut self, fid: u32, buf: &[u8], offset: u64) -> NineResult<()> {
        let n = self.write(fid, buf, offset).await?;
        if n as usize != buf.len() {
            panic!("short 9P write: {} of {}", n, buf.len());
        }
        Ok(())
    }

    /// size[4] Tfsync tag[2] fid[4]
    pub async fn fsync(&mut self, fid: u32) -> NineResult<()> {
        let req = Req::new(MsgType::Tfsync).d(fid);
        self.transact(req, 7, &[], None).await?;
        Ok(())
    }

    /// Begin streaming directory entries from an open directory fid.
    pub fn readdir_stream(&self, fid: u32, capacity: u32) -> DirStream {
        DirStream {
            fid,
            next_request: 0,
            capacity: capacity.min(self.max_message - 24),
            data: Vec::new(),
            used: 0,
        }
    }

    /// size[4] Treaddir tag[2] fid[4] offset[8] count[4]
    /// size[4] Rreaddir tag[2] count[4] data[count]
    ///   data = qid[13] offset[8] type[1] name[s] ...
    ///
    /// Returns `None` at the end of the directory.
    pub async fn readdir_next(&mut self, st: &mut DirStream) -> NineResult<Option<DirEntry>> {
        if st.used >= st.data.len() {
            let mut buf = vec![0u8; st.capacity as usize];
            let req = Req::new(MsgType::Treaddir).d(st.fid).q(st.next_request).d(st.capacity);
            let mut r = self.transact(req, 7 + 4, &[], Some(&mut buf)).await?;
            let recvd = r.d() as usize;
            if recvd == 0 {
                return Ok(None);
            }
            buf.truncate(recvd.min(st.capacity as usize));
            st.data = buf;
            st.used = 0;
        }

        let rec = &st.data[st.used..];
        let qid = qid_at(rec, 0);
        let offset = u64::from_le_bytes(rec[13..21].try_into().unwrap());
        let typ = rec[21];
        let nlen = u16::from_le_bytes(rec[22..24].try_into().unwrap()) as usize;
        let name = String::from_utf8_lossy(&rec[24..24 + nlen]).into_owned();

        st.next_request = offset;
        st.used += 24 + nlen;

        Ok(Some(DirEntry { qid, typ, name }))
    }
}

/// Split `[base, base+len)` into page-sized extents.
fn chunk_pages(base: PhysAddr, len: usize, addrs: &mut Vec<PhysAddr>, lens: &mut Vec<u32>) {
    let mut at = 0usize;
    while at < len {
        let piece = (len - at).min(PAGE);
        addrs.push(base + at as u32);
        lens.push(piece as u32);
        at += piece;
    }
}
