//! Stable, collated, indexed directory enumeration.
//!
//! Background: the guest asks for "entry N under parent P" with N
//! counting up, and expects a collation-ordered answer. The remote
//! protocol lists directories in arbitrary order, directories can be
//! too large for memory, and a listing's size cannot be known without
//! reading all of it.
//!
//! So, to list a directory:
//!
//! 1. Read the entire remote listing into a bounded sorted collection
//!    (a skiplist "leaderboard"); as space runs out, evict the
//!    collation-latest entries.
//! 2. Compress the sorted run into a small persistent replay buffer by
//!    prefix-sharing consecutive ids and names.
//! 3. Unpack entries one at a time as indexes are requested.
//! 4. When the replay buffer runs dry, relist with the last returned
//!    name as the threshold, so everything at or before it is skipped.
//! 5. Repeat until a relist fits entirely, which sets the complete
//!    flag; then a dry buffer means "no more entries".
//!
//! A different parent, policy change or backwards index throws the
//! whole cache away. In practice this behaves like O(n log n), with an
//! O(n^2) worst case for enormous directories.

use tracing::trace;

use crate::catalog::Catalog;
use crate::charset;
use crate::errors::{FsError, FsResult};
use crate::nine::{fid, qid_type_fix, Client, DT_DIR, O_DIRECTORY, O_RDONLY};

/// Leaderboard capacity (nodes).
pub const LEADERS: usize = 1 << POWER;
const POWER: usize = 8;

/// Replay buffer capacity, bytes.
pub const REPLAY_BYTES: usize = 2048;

/// Stack budget for streaming the remote listing.
const LIST_BUF: u32 = 100_000;

/// The packed replay buffer: a run of `(id-prefix-reuse:2,
/// name-prefix-reuse:6, id-suffix, nul-terminated name-suffix)`
/// records, each sharing prefixes with its predecessor. Ids prefix in
/// big-endian order so "prefix" means the high bytes.
#[derive(Default)]
pub struct Replay {
    buf: Vec<u8>,
    ptr: usize,
    last_id: i32,
    last_name: Vec<u8>,
}

impl Replay {
    pub fn new() -> Replay {
        Replay::default()
    }

    /// Begin a pack cycle (discards previous contents).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.ptr = 0;
        self.last_id = 0;
        self.last_name.clear();
    }

    /// Append one entry. False means the buffer is out of room (the
    /// entry is not recorded).
    pub fn pack(&mut self, cnid: i32, name: &str) -> bool {
        let idb = cnid.to_be_bytes();
        let lastb = self.last_id.to_be_bytes();
        let nameb = name.as_bytes();

        let mut reuse_id = 0usize;
        while reuse_id < 3 && idb[reuse_id] == lastb[reuse_id] {
            reuse_id += 1;
        }
        let mut reuse_name = 0usize;
        let cap = nameb.len().min(self.last_name.len()).min(0x3f);
        while reuse_name < cap && nameb[reuse_name] == self.last_name[reuse_name] {
            reuse_name += 1;
        }

        self.last_id = cnid;
        self.last_name = nameb.to_vec();

        let need = 1 + (4 - reuse_id) + (nameb.len() - reuse_name) + 1;
        if self.buf.len() + need > REPLAY_BYTES {
            return false;
        }

        self.buf.push((reuse_id << 6) as u8 | reuse_name as u8);
        self.buf.extend_from_slice(&idb[reuse_id..]);
        self.buf.extend_from_slice(&nameb[reuse_name..]);
        self.buf.push(0);
        true
    }

    /// Begin an unpack cycle over the packed contents.
    pub fn rewind(&mut self) {
        self.ptr = 0;
        self.last_id = 0;
        self.last_name.clear();
    }

    /// Take the next entry, or `None` when the buffer is spent.
    /// Tolerates malformed contents by giving up early.
    pub fn unpack(&mut self) -> Option<(i32, String)> {
        if self.ptr >= self.buf.len() {
            return None;
        }

        let control = self.buf[self.ptr];
        self.ptr += 1;
        let reuse_id = (control >> 6) as usize;
        let reuse_name = (control & 0x3f) as usize;

        let change_id = 4 - reuse_id;
        if self.ptr + change_id > self.buf.len() {
            self.ptr = self.buf.len();
            return None;
        }
        let mut idb = self.last_id.to_be_bytes();
        idb[reuse_id..].copy_from_slice(&self.buf[self.ptr..self.ptr + change_id]);
        self.last_id = i32::from_be_bytes(idb);
        self.ptr += change_id;

        let suffix_end = self.buf[self.ptr..].iter().position(|&b| b == 0)?;
        let suffix = &self.buf[self.ptr..self.ptr + suffix_end];
        self.ptr += suffix_end + 1;

        self.last_name.truncate(reuse_name.min(self.last_name.len()));
        self.last_name.extend_from_slice(suffix);

        Some((
            self.last_id,
            String::from_utf8_lossy(&self.last_name).into_owned(),
        ))
    }

    /// A buffer with arbitrary contents (exercised by the fuzzer).
    pub fn from_bytes(bytes: &[u8]) -> Replay {
        Replay { buf: bytes.to_vec(), ptr: 0, last_id: 0, last_name: Vec::new() }
    }
}

/// Per-volume enumeration cache.
pub struct SortedDirCache {
    last_cnid: i32,
    last_index: i32,
    last_dir_ok: bool,
    complete: bool,
    last_name: String,
    replay: Replay,
}

impl Default for SortedDirCache {
    fn default() -> SortedDirCache {
        SortedDirCache::new()
    }
}

impl SortedDirCache {
    pub fn new() -> SortedDirCache {
        SortedDirCache {
            last_cnid: 0,
            last_index: i32::MAX,
            last_dir_ok: false,
            complete: false,
            last_name: String::new(),
            replay: Replay::new(),
        }
    }

    /// The directory the cache is currently positioned in (resolved
    /// CNID), 0 when invalid.
    pub fn current_dir(&self) -> i32 {
        self.last_cnid
    }

    /// Forget everything (a mutation happened elsewhere).
    pub fn invalidate(&mut self) {
        self.last_cnid = 0;
        self.last_index = i32::MAX;
        self.last_name.clear();
        self.replay.clear();
    }
}

/// Return entry `index` (1-based) under `pcnid` in collation order,
/// leaving `nav_fid` on the child. Entries that vanished since listing
/// are silently skipped; entries created since are not guaranteed to
/// appear. "No more entries" comes back as [`FsError::NotFound`].
pub async fn read_dir_sorted(
    cache: &mut SortedDirCache,
    nine: &mut Client,
    catalog: &mut Catalog,
    is_sidecar: &dyn Fn(&str) -> bool,
    nav_fid: u32,
    pcnid: i32,
    index: i32,
    dir_ok: bool,
) -> FsResult<(i32, String)> {
    assert!(index > 0, "child index must be positive");

    // Different directory or policy? Invalidate everything.
    if pcnid != cache.last_cnid || dir_ok != cache.last_dir_ok {
        cache.invalidate();

        let hit = match catalog.walk(nine, fid::SORT_DIR, pcnid, b"").await {
            Ok(hit) => hit,
            Err(FsError::NotFound) => return Err(FsError::DirNotFound),
            Err(e) => return Err(e),
        };
        cache.last_cnid = hit.cnid;
        cache.last_dir_ok = dir_ok;
    }

    // Backwards enumeration is not supported: relist from the start
    if index <= cache.last_index {
        cache.replay.clear();
        cache.replay.rewind();
        cache.last_index = 0;
        cache.last_name.clear();
        cache.complete = false;
    }

    let mut child = 0i32;
    while cache.last_index != index {
        let unpacked = match cache.replay.unpack() {
            Some(got) => got,
            None => {
                if cache.complete {
                    return Err(FsError::NotFound);
                }
                // The costly call: relist past the threshold
                cache.complete = populate(
                    nine,
                    catalog,
                    is_sidecar,
                    &cache.last_name,
                    dir_ok,
                    &mut cache.replay,
                )
                .await?;
                match cache.replay.unpack() {
                    Some(got) => got,
                    None => return Err(FsError::NotFound), // fully iterated
                }
            }
        };

        child = unpacked.0;
        cache.last_name = unpacked.1;

        // A stale listed name is skipped without consuming the index
        if nine.walk_path(fid::SORT_DIR, nav_fid, &cache.last_name).await.is_ok() {
            cache.last_index += 1;
        }
    }

    Ok((child, cache.last_name.clone()))
}

struct Leader {
    link: [(u16, u16); POWER], // (left, right) per level
    height: usize,
    cnid: i32,
    name: String,
    key: Vec<u8>,
}

const LEFT: u16 = 0;
const RIGHT: u16 = 1;

/// Relist the remote directory into the leaderboard, keeping only
/// entries collation-later than `ignore`, then pack the board into the
/// replay buffer. Returns whether the directory is now fully listed.
async fn populate(
    nine: &mut Client,
    catalog: &mut Catalog,
    is_sidecar: &dyn Fn(&str) -> bool,
    ignore: &str,
    dir_ok: bool,
    replay: &mut Replay,
) -> FsResult<bool> {
    let mut complete = true;

    // The two limiting sentinels; leftmost carries the threshold key
    let ignore_key = charset::host_name_to_roman(ignore, charset::ROMAN_MAX)
        .map(|r| charset::sort_key(&r))
        .unwrap_or_default();
    let mut nodes: Vec<Leader> = Vec::with_capacity(2 + LEADERS);
    nodes.push(Leader {
        link: [(LEFT, RIGHT); POWER],
        height: POWER,
        cnid: 0,
        name: ignore.to_owned(),
        key: ignore_key,
    });
    nodes.push(Leader {
        link: [(LEFT, RIGHT); POWER],
        height: POWER,
        cnid: 0,
        name: String::new(),
        key: Vec::new(), // never compared
    });

    nine.walk_path(fid::SORT_DIR, fid::SORT_LIST, "")
        .await
        .map_err(FsError::from)?;
    if nine.lopen(fid::SORT_LIST, O_RDONLY | O_DIRECTORY).await.is_err() {
        panic!("failed plain open for listing");
    }

    let mut stream = nine.readdir_stream(fid::SORT_LIST, LIST_BUF);
    while let Some(entry) = nine.readdir_next(&mut stream).await.map_err(FsError::from)? {
        if !dir_ok && entry.typ == DT_DIR {
            continue; // asked not to return directories
        }
        let Some(roman) = charset::host_name_to_roman(&entry.name, charset::ROMAN_MAX) else {
            continue; // unrepresentable name
        };
        if entry.name.starts_with('.') || is_sidecar(&entry.name) {
            continue; // dot-dirs and metadata sidecars stay hidden
        }

        let cnid = catalog.qid_to_cnid(qid_type_fix(entry.qid, entry.typ));
        let key = charset::sort_key(&roman);

        // At or before the threshold means already reported
        let Some(succ) = find_successors(&nodes, &key) else {
            continue;
        };

        if nodes.len() < 2 + LEADERS {
            // Empty slots available: take one
            let el = nodes.len() as u16;
            nodes.push(Leader {
                link: [(0, 0); POWER],
                height: 0,
                cnid,
                name: entry.name,
                key,
            });
            insert(&mut nodes, &succ, el);
            continue;
        }

        if succ[0] == RIGHT {
            // Board full and this is later than everything on it
            complete = false;
            continue;
        }

        // Steal the slot of the collation-latest entry
        let el = nodes[RIGHT as usize].link[0].0;
        unlink(&mut nodes, el);
        let succ = find_successors(&nodes, &key).expect("key was above the threshold");
        nodes[el as usize].cnid = cnid;
        nodes[el as usize].name = entry.name;
        nodes[el as usize].key = key;
        insert(&mut nodes, &succ, el);
    }
    let _ = nine.clunk(fid::SORT_LIST).await;

    // Compress the sorted board into the replay buffer
    replay.clear();
    let mut at = nodes[LEFT as usize].link[0].1;
    let mut packed = 0usize;
    while at != RIGHT {
        let node = &nodes[at as usize];
        if !replay.pack(node.cnid, &node.name) {
            complete = false;
            break;
        }
        packed += 1;
        at = node.link[0].1;
    }
    replay.rewind();

    trace!(packed, complete, "directory listing repacked");
    Ok(complete)
}

/// Per level, the leftmost linked node whose key is strictly greater
/// than `key`. `None` when the key is at or before the threshold held
/// by the left sentinel.
fn find_successors(nodes: &[Leader], key: &[u8]) -> Option<[u16; POWER]> {
    let mut succ = [RIGHT; POWER];
    let mut right = RIGHT;
    for d in (0..POWER).rev() {
        loop {
            let stepleft = nodes[right as usize].link[d].0;
            if stepleft == LEFT {
                if key <= nodes[LEFT as usize].key.as_slice() {
                    return None;
                }
                break;
            }
            if key > nodes[stepleft as usize].key.as_slice() {
                break;
            }
            right = stepleft;
        }
        succ[d] = right;
    }
    Some(succ)
}

/// Link `el` just to the left of its successor on each level; the
/// element's cnid decides how tall it stands.
fn insert(nodes: &mut [Leader], succ: &[u16; POWER], el: u16) {
    let hash = nodes[el as usize].cnid;
    let mut d = 0;
    loop {
        let right = succ[d];
        let left = nodes[right as usize].link[d].0;
        nodes[el as usize].link[d] = (left, right);
        nodes[left as usize].link[d].1 = el;
        nodes[right as usize].link[d].0 = el;
        d += 1;
        if d >= POWER || hash & (1 << d) == 0 {
            break;
        }
    }
    nodes[el as usize].height = d;
}

fn unlink(nodes: &mut [Leader], el: u16) {
    for d in 0..nodes[el as usize].height {
        let (left, right) = nodes[el as usize].link[d];
        nodes[left as usize].link[d].1 = right;
        nodes[right as usize].link[d].0 = left;
        nodes[el as usize].link[d] = (0, 0);
    }
    nodes[el as usize].height = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_round_trips_a_sorted_run() {
        let mut r = Replay::new();
        r.clear();
        let entries: Vec<(i32, String)> = (0..60)
            .map(|i| (0x0100_0000 + i, format!("aaa{:03}", i)))
            .collect();
        for (id, name) in &entries {
            assert!(r.pack(*id, name), "ran out of room unexpectedly");
        }
        r.rewind();
        for want in &entries {
            assert_eq!(r.unpack().unwrap(), *want);
        }
        assert!(r.unpack().is_none());
    }

    #[test]
    fn replay_shares_prefixes() {
        let mut r = Replay::new();
        r.clear();
        assert!(r.pack(0x01020304, "abcdef"));
        let before = r.buf.len();
        assert!(r.pack(0x01020305, "abcdeg"));
        // second record: control + 1 id byte + 1 name byte + nul
        assert_eq!(r.buf.len() - before, 4);
    }

    #[test]
    fn replay_refuses_when_full() {
        let mut r = Replay::new();
        r.clear();
        let mut n = 0;
        while r.pack(n, &format!("completely-different-{:04}", n)) {
            n += 1;
        }
        assert!(n > 50, "plausible capacity, got {}", n);
        // rejected entry is recoverable after a clear
        r.clear();
        assert!(r.pack(1, "fine"));
    }

    #[test]
    fn replay_survives_garbage() {
        for seed in 0..64u8 {
            let bytes: Vec<u8> = (0..97).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect();
            let mut r = Replay::from_bytes(&bytes);
            while r.unpack().is_some() {}
        }
    }
}
