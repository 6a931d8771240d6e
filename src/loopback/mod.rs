//! An in-process virtio-9p device.
//!
//! Implements [`Transport`] over an in-memory host tree, servicing
//! queue 0 synchronously inside `notify`: descriptor chains are parsed
//! straight out of guest memory, the request is executed against the
//! tree, and the reply is scattered back before the doorbell returns.
//! That keeps the driver's poll loop honest (the completion really
//! does arrive through the used ring) while letting tests run with no
//! hardware and no host filesystem.

mod fs;

pub use fs::{HostFs, Node, NodeKind, ROOT_INO};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;
use tracing::trace;

use crate::errors::Errno;
use crate::nine::{
    MsgType, AT_REMOVEDIR, O_EXCL, O_TRUNC, QTDIR, SET_MTIME, SET_MTIME_SET, SET_SIZE,
};
use crate::virtio::{GuestRam, PhysAddr, Transport, FEATURE_MOUNT_TAG, FEATURE_VERSION_1};

const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;

#[derive(Debug, Clone)]
enum FidKind {
    Node { ino: u64, open: bool },
    XattrRead(Vec<u8>),
    XattrCreate { ino: u64, name: String, size: u64, buf: Vec<u8> },
}

#[derive(Default, Copy, Clone)]
struct QueueCfg {
    size: u16,
    desc: PhysAddr,
    avail: PhysAddr,
    used: PhysAddr,
}

pub struct LoopbackDevice {
    ram: GuestRam,
    fs: Arc<Mutex<HostFs>>,
    mount_tag: String,
    queue: QueueCfg,
    last_avail: u16,
    fids: HashMap<u32, FidKind>,
    msize: u32,
    pub failed: bool,
}

impl LoopbackDevice {
    pub fn new(ram: &GuestRam, fs: Arc<Mutex<HostFs>>, mount_tag: &str) -> LoopbackDevice {
        LoopbackDevice {
            ram: ram.clone(),
            fs,
            mount_tag: mount_tag.to_owned(),
            queue: QueueCfg::default(),
            last_avail: 0,
            fids: HashMap::new(),
            msize: 1 << 20,
            failed: false,
        }
    }

    /// Shared handle to the tree, for test assertions.
    pub fn tree(&self) -> Arc<Mutex<HostFs>> {
        self.fs.clone()
    }

    fn service(&mut self) {
        if self.queue.size == 0 {
            return;
        }
        let q = self.queue;
        let mask = q.size - 1;

        loop {
            let avail_idx = self.ram.read_u16(q.avail + 2);
            if self.last_avail == avail_idx {
                break;
            }
            let head = self
                .ram
                .read_u16(q.avail + 4 + 2 * (self.last_avail & mask) as u32);
            self.last_avail = self.last_avail.wrapping_add(1);

            // Gather the chain: readable extents become the request,
            // writable ones receive the reply
            let mut request: Vec<u8> = Vec::new();
            let mut sinks: Vec<(PhysAddr, u32)> = Vec::new();
            let mut at = head;
            loop {
                let d = q.desc + 16 * at as u32;
                let addr = self.ram.read_u64(d) as PhysAddr;
                let len = self.ram.read_u32(d + 8);
                let flags = self.ram.read_u16(d + 12);
                let next = self.ram.read_u16(d + 14);

                if flags & DESC_F_WRITE != 0 {
                    sinks.push((addr, len));
                } else {
                    request.extend_from_slice(&self.ram.read_vec(addr, len as usize));
                }

                if flags & DESC_F_NEXT == 0 {
                    break;
                }
                at = next;
            }

            let reply = self.handle(&request);

            // Scatter the reply
            let mut written = 0usize;
            for (addr, len) in sinks {
                if written >= reply.len() {
                    break;
                }
                let take = (reply.len() - written).min(len as usize);
                self.ram.write(addr, &reply[written..written + take]);
                written += take;
            }

            // Publish in the used ring
            let used_idx = self.ram.read_u16(q.used + 2);
            let slot = q.used + 4 + 8 * (used_idx & mask) as u32;
            self.ram.write_u32(slot, head as u32);
            self.ram.write_u32(slot + 4, written as u32);
            self.ram.write_u16(q.used + 2, used_idx.wrapping_add(1));
        }
    }

    fn handle(&mut self, msg: &[u8]) -> Vec<u8> {
        let mut p = Parse { buf: msg, pos: 0 };
        let _size = p.d();
        let t = p.b();
        let tag = p.w();

        let result = self.dispatch(t, &mut p);
        match result {
            Ok(body) => {
                let mut out = Vec::with_capacity(7 + body.len());
                out.extend_from_slice(&(7 + body.len() as u32).to_le_bytes());
                out.push(t + 1);
                out.extend_from_slice(&tag.to_le_bytes());
                out.extend_from_slice(&body);
                out
            }
            Err(errno) => {
                trace!(msg_type = t, errno = errno.0, "loopback error reply");
                let mut out = Vec::with_capacity(11);
                out.extend_from_slice(&11u32.to_le_bytes());
                out.push(MsgType::Rlerror as u8);
                out.extend_from_slice(&tag.to_le_bytes());
                out.extend_from_slice(&errno.0.to_le_bytes());
                out
            }
        }
    }

    fn node_fid(&self, fid: u32) -> Result<u64, Errno> {
        match self.fids.get(&fid) {
            Some(FidKind::Node { ino, .. }) => Ok(*ino),
            _ => Err(Errno::EINVAL),
        }
    }

    fn dispatch(&mut self, t: u8, p: &mut Parse<'_>) -> Result<Vec<u8>, Errno> {
        let Some(msg) = MsgType::from_u8(t) else {
            return Err(Errno::EINVAL);
        };
        match msg {
            MsgType::Rlerror => Err(Errno::EINVAL),
            MsgType::Tversion => {
                // Tversion msize[4] version[s]
                let msize = p.d();
                let version = p.s();
                if version != "9P2000.L" {
                    return Err(Errno::EPROTONOSUPPORT);
                }
                self.fids.clear();
                self.msize = self.msize.min(msize);
                let mut body = self.msize.to_le_bytes().to_vec();
                put_s(&mut body, "9P2000.L");
                Ok(body)
            }
            MsgType::Tattach => {
                // Tattach fid afid uname aname n_uname
                let fid = p.d();
                let _afid = p.d();
                let _uname = p.s();
                let _aname = p.s();
                let _n_uname = p.d();
                self.fids.insert(fid, FidKind::Node { ino: ROOT_INO, open: false });
                let fs = self.fs.lock().unwrap();
                Ok(qid_bytes(fs.node(ROOT_INO).unwrap()))
            }
            MsgType::Tstatfs => {
                // Tstatfs fid
                let _fid = p.d();
                let mut body = Vec::new();
                body.extend_from_slice(&0x0102_1997u32.to_le_bytes()); // type
                body.extend_from_slice(&4096u32.to_le_bytes()); // bsize
                for v in [1u64 << 20, 1 << 19, 1 << 19, 1 << 16, 1 << 15, 0x3970] {
                    body.extend_from_slice(&v.to_le_bytes());
                }
                body.extend_from_slice(&255u32.to_le_bytes()); // namelen
                Ok(body)
            }
            MsgType::Twalk => self.t_walk(p),
            MsgType::Tlopen => {
                // Tlopen fid flags
                let fid = p.d();
                let flags = p.d();
                let ino = self.node_fid(fid)?;
                let mut fs = self.fs.lock().unwrap();
                let node = fs.node(ino).ok_or(Errno::ENOENT)?;
                let qid = qid_bytes(node);
                if flags & O_TRUNC != 0 && !node.is_dir() {
                    fs.truncate(ino, 0)?;
                }
                drop(fs);
                self.fids.insert(fid, FidKind::Node { ino, open: true });
                let mut body = qid;
                body.extend_from_slice(&0u32.to_le_bytes()); // iounit
                Ok(body)
            }
            MsgType::Tlcreate => {
                // Tlcreate fid name flags mode gid
                let fid = p.d();
                let name = p.s();
                let flags = p.d();
                let _mode = p.d();
                let _gid = p.d();
                let dir = self.node_fid(fid)?;
                let mut fs = self.fs.lock().unwrap();
                let ino = match fs.lookup(dir, &name) {
                    Some(existing) => {
                        if flags & O_EXCL != 0 {
                            return Err(Errno::EEXIST);
                        }
                        if flags & O_TRUNC != 0 {
                            fs.truncate(existing, 0)?;
                        }
                        existing
                    }
                    None => fs.create_file(dir, &name)?,
                };
                let qid = qid_bytes(fs.node(ino).unwrap());
                drop(fs);
                self.fids.insert(fid, FidKind::Node { ino, open: true });
                let mut body = qid;
                body.extend_from_slice(&0u32.to_le_bytes());
                Ok(body)
            }
            MsgType::Tgetattr => {
                // Tgetattr fid request_mask
                let fid = p.d();
                let mask = p.q();
                let ino = self.node_fid(fid)?;
                let fs = self.fs.lock().unwrap();
                let node = fs.node(ino).ok_or(Errno::ENOENT)?;

                let mut body = Vec::with_capacity(160 - 7);
                body.extend_from_slice(&mask.to_le_bytes()); // valid: all asked
                body.extend_from_slice(&qid_bytes(node));
                let mode: u32 = if node.is_dir() { 0o040_755 } else { 0o100_644 };
                body.extend_from_slice(&mode.to_le_bytes());
                body.extend_from_slice(&0u32.to_le_bytes()); // uid
                body.extend_from_slice(&0u32.to_le_bytes()); // gid
                body.extend_from_slice(&1u64.to_le_bytes()); // nlink
                body.extend_from_slice(&0u64.to_le_bytes()); // rdev
                body.extend_from_slice(&node.size().to_le_bytes());
                body.extend_from_slice(&4096u64.to_le_bytes()); // blksize
                body.extend_from_slice(&node.size().div_ceil(512).to_le_bytes());
                for _ in 0..2 {
                    // atime mirrors mtime
                    body.extend_from_slice(&(node.mtime_sec as u64).to_le_bytes());
                    body.extend_from_slice(&node.mtime_nsec.to_le_bytes());
                }
                body.extend_from_slice(&(node.mtime_sec as u64).to_le_bytes()); // ctime
                body.extend_from_slice(&node.mtime_nsec.to_le_bytes());
                for _ in 0..2 {
                    body.extend_from_slice(&0u64.to_le_bytes()); // btime
                }
                body.extend_from_slice(&0u64.to_le_bytes()); // gen
                body.extend_from_slice(&0u64.to_le_bytes()); // data_version
                Ok(body)
            }
            MsgType::Tsetattr => {
                // Tsetattr fid valid mode uid gid size atime mtime
                let fid = p.d();
                let valid = p.d();
                let _mode = p.d();
                let _uid = p.d();
                let _gid = p.d();
                let size = p.q();
                let _atime_sec = p.q();
                let _atime_nsec = p.q();
                let mtime_sec = p.q();
                let mtime_nsec = p.q();
                let ino = self.node_fid(fid)?;
                let mut fs = self.fs.lock().unwrap();
                if valid & SET_SIZE != 0 {
                    fs.truncate(ino, size)?;
                }
                if valid & SET_MTIME != 0 {
                    if valid & SET_MTIME_SET != 0 {
                        fs.set_mtime(ino, mtime_sec as i64, mtime_nsec);
                    }
                    // else: "now", which the write above already set
                }
                Ok(Vec::new())
            }
            MsgType::Txattrwalk => {
                // Txattrwalk fid newfid name
                let fid = p.d();
                let newfid = p.d();
                let name = p.s();
                let ino = self.node_fid(fid)?;
                if self.fids.contains_key(&newfid) && newfid != fid {
                    return Err(Errno::EINVAL);
                }
                let fs = self.fs.lock().unwrap();
                let node = fs.node(ino).ok_or(Errno::ENOENT)?;
                let value = node.xattrs.get(&name).ok_or(Errno::ENODATA)?.clone();
                drop(fs);
                let size = value.len() as u64;
                self.fids.insert(newfid, FidKind::XattrRead(value));
                Ok(size.to_le_bytes().to_vec())
            }
            MsgType::Txattrcreate => {
                // Txattrcreate fid name attr_size flags
                let fid = p.d();
                let name = p.s();
                let size = p.q();
                let _flags = p.d();
                let ino = self.node_fid(fid)?;
                self.fids
                    .insert(fid, FidKind::XattrCreate { ino, name, size, buf: Vec::new() });
                Ok(Vec::new())
            }
            MsgType::Treaddir => self.t_readdir(p),
            MsgType::Tfsync => {
                // Tfsync fid
                let _fid = p.d();
                Ok(Vec::new())
            }
            MsgType::Tmkdir => {
                // Tmkdir dfid name mode gid
                let fid = p.d();
                let name = p.s();
                let _mode = p.d();
                let _gid = p.d();
                let dir = self.node_fid(fid)?;
                let mut fs = self.fs.lock().unwrap();
                let ino = fs.create_dir(dir, &name)?;
                Ok(qid_bytes(fs.node(ino).unwrap()))
            }
            MsgType::Trenameat => {
                // Trenameat olddirfid oldname newdirfid newname
                let f1 = p.d();
                let n1 = p.s();
                let f2 = p.d();
                let n2 = p.s();
                let d1 = self.node_fid(f1)?;
                let d2 = self.node_fid(f2)?;
                self.fs.lock().unwrap().rename(d1, &n1, d2, &n2)?;
                Ok(Vec::new())
            }
            MsgType::Tunlinkat => {
                // Tunlinkat dirfd name flags
                let fid = p.d();
                let name = p.s();
                let flags = p.d();
                let dir = self.node_fid(fid)?;
                self.fs.lock().unwrap().unlink(dir, &name, flags & AT_REMOVEDIR != 0)?;
                Ok(Vec::new())
            }
            MsgType::Tread => {
                // Tread fid offset count
                let fid = p.d();
                let offset = p.q();
                let count = p.d() as usize;
                let data = match self.fids.get(&fid) {
                    Some(FidKind::Node { ino, .. }) => {
                        self.fs.lock().unwrap().read(*ino, offset, count)?
                    }
                    Some(FidKind::XattrRead(value)) => {
                        let at = (offset as usize).min(value.len());
                        let take = count.min(value.len() - at);
                        value[at..at + take].to_vec()
                    }
                    _ => return Err(Errno::EINVAL),
                };
                let mut body = (data.len() as u32).to_le_bytes().to_vec();
                body.extend_from_slice(&data);
                Ok(body)
            }
            MsgType::Twrite => {
                // Twrite fid offset count data
                let fid = p.d();
                let offset = p.q();
                let count = p.d() as usize;
                let data = p.take(count);
                let written = match self.fids.get_mut(&fid) {
                    Some(FidKind::Node { ino, .. }) => {
                        let ino = *ino;
                        self.fs.lock().unwrap().write(ino, offset, &data)?
                    }
                    Some(FidKind::XattrCreate { buf, .. }) => {
                        let end = offset as usize + data.len();
                        if end > buf.len() {
                            buf.resize(end, 0);
                        }
                        buf[offset as usize..end].copy_from_slice(&data);
                        data.len() as u32
                    }
                    _ => return Err(Errno::EINVAL),
                };
                Ok(written.to_le_bytes().to_vec())
            }
            MsgType::Tclunk => {
                // Tclunk fid
                let fid = p.d();
                match self.fids.remove(&fid) {
                    Some(FidKind::XattrCreate { ino, name, size, mut buf }) => {
                        buf.resize(size as usize, 0);
                        let mut fs = self.fs.lock().unwrap();
                        if let Some(node) = fs.node_mut(ino) {
                            node.xattrs.insert(name, buf);
                        }
                    }
                    Some(_) => {}
                    None => return Err(Errno::EINVAL),
                }
                Ok(Vec::new())
            }
            MsgType::Tremove => {
                // Tremove fid
                let fid = p.d();
                let ino = self.node_fid(fid)?;
                self.fids.remove(&fid);
                let mut fs = self.fs.lock().unwrap();
                let parent = fs.node(ino).ok_or(Errno::ENOENT)?.parent;
                let name = match &fs.node(parent).ok_or(Errno::ENOENT)?.kind {
                    NodeKind::Dir(children) => children
                        .iter()
                        .find(|(_, &i)| i == ino)
                        .map(|(n, _)| n.clone())
                        .ok_or(Errno::ENOENT)?,
                    NodeKind::File(_) => return Err(Errno::ENOTDIR),
                };
                let is_dir = fs.node(ino).unwrap().is_dir();
                fs.unlink(parent, &name, is_dir)?;
                Ok(Vec::new())
            }
        }
    }

    fn t_walk(&mut self, p: &mut Parse<'_>) -> Result<Vec<u8>, Errno> {
        let fid = p.d();
        let newfid = p.d();
        let nwname = p.w() as usize;

        let mut ino = self.node_fid(fid)?;
        if self.fids.contains_key(&newfid) && newfid != fid {
            return Err(Errno::EINVAL);
        }

        let fs = self.fs.lock().unwrap();
        let mut qids: Vec<u8> = Vec::new();
        let mut nwqid = 0u16;
        for i in 0..nwname {
            let name = p.s();
            let node = fs.node(ino).ok_or(Errno::ENOENT)?;
            if !node.is_dir() {
                if i == 0 {
                    return Err(Errno::ENOTDIR);
                }
                break;
            }
            match fs.lookup(ino, &name) {
                Some(child) => {
                    ino = child;
                    qids.extend_from_slice(&qid_bytes(fs.node(child).unwrap()));
                    nwqid += 1;
                }
                None => {
                    if i == 0 {
                        return Err(Errno::ENOENT);
                    }
                    break;
                }
            }
        }
        drop(fs);

        if nwqid as usize == nwname {
            self.fids.insert(newfid, FidKind::Node { ino, open: false });
        }

        let mut body = nwqid.to_le_bytes().to_vec();
        body.extend_from_slice(&qids);
        Ok(body)
    }

    fn t_readdir(&mut self, p: &mut Parse<'_>) -> Result<Vec<u8>, Errno> {
        let fid = p.d();
        let offset = p.q();
        let count = p.d() as usize;

        let (ino, open) = match self.fids.get(&fid) {
            Some(FidKind::Node { ino, open }) => (*ino, *open),
            _ => return Err(Errno::EINVAL),
        };
        if !open {
            return Err(Errno::EINVAL);
        }

        let fs = self.fs.lock().unwrap();
        let node = fs.node(ino).ok_or(Errno::ENOENT)?;
        let NodeKind::Dir(children) = &node.kind else {
            return Err(Errno::ENOTDIR);
        };

        // Entry list: dot, dot-dot, then children in name order
        let mut entries: Vec<(&str, u64, u8)> = Vec::with_capacity(children.len() + 2);
        entries.push((".", ino, 4));
        entries.push(("..", node.parent, 4));
        for (name, &child) in children {
            let typ = if fs.node(child).is_some_and(|n| n.is_dir()) { 4 } else { 8 };
            entries.push((name.as_str(), child, typ));
        }

        let mut data = Vec::new();
        for (idx, &(name, child, typ)) in entries.iter().enumerate().skip(offset as usize) {
            let rec = 13 + 8 + 1 + 2 + name.len();
            if data.len() + rec > count {
                break;
            }
            let child_node = fs.node(child).ok_or(Errno::ENOENT)?;
            data.extend_from_slice(&qid_bytes(child_node));
            data.extend_from_slice(&((idx + 1) as u64).to_le_bytes());
            data.push(typ);
            put_s(&mut data, name);
        }

        let mut body = (data.len() as u32).to_le_bytes().to_vec();
        body.extend_from_slice(&data);
        Ok(body)
    }
}

impl Transport for LoopbackDevice {
    fn get_device_feature(&mut self, bit: u32) -> bool {
        bit == FEATURE_VERSION_1 || bit == FEATURE_MOUNT_TAG
    }

    fn set_driver_feature(&mut self, _bit: u32, _on: bool) {}

    fn features_ok(&mut self) -> bool {
        true
    }

    fn driver_ok(&mut self) {}

    fn fail(&mut self) {
        self.failed = true;
    }

    fn rearm(&mut self) {}

    fn queue_max_size(&mut self, q: u16) -> u16 {
        if q == 0 {
            256
        } else {
            0
        }
    }

    fn queue_set(&mut self, q: u16, size: u16, desc: PhysAddr, avail: PhysAddr, used: PhysAddr) {
        if q == 0 {
            self.queue = QueueCfg { size, desc, avail, used };
        }
    }

    fn notify(&mut self, q: u16) {
        if q == 0 {
            self.service();
        }
    }

    fn config(&mut self) -> Vec<u8> {
        let mut cfg = (self.mount_tag.len() as u16).to_le_bytes().to_vec();
        cfg.extend_from_slice(self.mount_tag.as_bytes());
        cfg
    }
}

struct Parse<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Parse<'_> {
    fn b(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }
    fn w(&mut self) -> u16 {
        let v = LittleEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        v
    }
    fn d(&mut self) -> u32 {
        let v = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        v
    }
    fn q(&mut self) -> u64 {
        let v = LittleEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        v
    }
    fn s(&mut self) -> String {
        let len = self.w() as usize;
        let s = String::from_utf8_lossy(&self.buf[self.pos..self.pos + len]).into_owned();
        self.pos += len;
        s
    }
    fn take(&mut self, n: usize) -> Vec<u8> {
        let v = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        v
    }
}

fn qid_bytes(node: &Node) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(if node.is_dir() { QTDIR } else { 0 });
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&node.ino.to_le_bytes());
    out
}

fn put_s(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}
