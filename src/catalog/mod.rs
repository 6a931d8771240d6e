//! The catalog: guests track files by 32-bit "catalog node IDs", the
//! rest of the world wants textual paths. This module bridges the gap.
//!
//! The database is accessed intensively but can also grow arbitrarily
//! large, so entries live in a small RAM cache that spills to per-entry
//! files under `<dotdir>/catalog/` when crowded out. There is a little
//! trickiness around files whose name-case gets corrected after the
//! fact.
//!
//! CNID conventions: 1 is "parent of root", 2 is "root", bit 30 set
//! means "not a directory", and negative values belong to the guest's
//! error numbering.

mod walk;

pub use walk::WalkHit;

use tracing::trace;

use crate::errors::{FsError, FsResult};
use crate::nine::{fid, Client, Qid, O_RDONLY, O_TRUNC, O_WRONLY, QTDIR};

pub const BUCKETS: usize = 32;
pub const BUCKET_SLOTS: usize = 32;
pub const BUCKET_BYTES: usize = 300;

/// Longest path component accepted from the guest, in host bytes.
pub const COMPONENT_MAX: usize = 255;

/// Deepest path the resolver will chew through.
pub const COMPONENTS_MAX: usize = 32;

#[derive(Debug, Default, Copy, Clone)]
struct Slot {
    cnid: i32,
    parent: i32,
    dirty: bool,
    offset: u16,
}

struct Bucket {
    slots: [Slot; BUCKET_SLOTS],
    used_slots: usize,
    used_bytes: usize,
    names: [u8; BUCKET_BYTES],
}

impl Default for Bucket {
    fn default() -> Bucket {
        Bucket {
            slots: [Slot::default(); BUCKET_SLOTS],
            used_slots: 0,
            used_bytes: 0,
            names: [0; BUCKET_BYTES],
        }
    }
}

impl Bucket {
    fn name_of(&self, slot: usize) -> &[u8] {
        let start = self.slots[slot].offset as usize;
        let end = self.names[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(self.names.len(), |p| start + p);
        &self.names[start..end]
    }

    /// Compact the fellow slot names leftward over this slot's name.
    /// Must be immediately followed by repopulating the slot's name.
    fn delete_slot_name(&mut self, slot: usize) {
        let at = self.slots[slot].offset as usize;
        let len = self.name_of(slot).len() + 1;
        self.names.copy_within(at + len..self.used_bytes, at);
        for s in &mut self.slots[..self.used_slots] {
            if s.offset as usize > at {
                s.offset -= len as u16;
            }
        }
        self.slots[slot].offset = 0;
        self.used_bytes -= len;
    }

    fn install_name(&mut self, slot: usize, name: &[u8]) {
        let at = self.used_bytes;
        self.slots[slot].offset = at as u16;
        self.names[at..at + name.len()].copy_from_slice(name);
        self.names[at + name.len()] = 0;
        self.used_bytes += name.len() + 1;
    }
}

pub struct Catalog {
    cache: Vec<Bucket>,
    root_qid: Qid,
}

impl Catalog {
    /// Create the on-disk spill directory and park a fid on it.
    pub async fn init(nine: &mut Client, root_qid: Qid) -> Catalog {
        match nine.mkdir(fid::DOTDIR, 0o777, 0, "catalog").await {
            Ok(_) => {}
            Err(crate::errors::Errno::EEXIST) => {}
            Err(e) => panic!("failed to create the catalog directory: {:?}", e),
        }
        nine.walk_path(fid::DOTDIR, fid::CATALOG, "catalog")
            .await
            .expect("failed walk to the catalog directory");

        Catalog {
            cache: (0..BUCKETS).map(|_| Bucket::default()).collect(),
            root_qid,
        }
    }

    /// Hash a 31-bit CNID from the remote 64-bit inode identity. Low
    /// values are biased upward to dodge the reserved range; the
    /// not-a-directory bit comes from the qid type.
    ///
    /// The type field of an `Rreaddir` qid is nonsense; fix it from the
    /// listing's own type byte before calling this.
    pub fn qid_to_cnid(&self, qid: Qid) -> i32 {
        if qid.path == self.root_qid.path {
            return 2;
        }

        let mut cnid = (qid.path & 0x3fff_ffff) as i32;
        cnid ^= ((qid.path & 0x0fff_ffff_c000_0000) >> 30) as i32;
        cnid ^= ((qid.path & 0xf000_0000_0000_0000) >> 40) as i32;
        if cnid < 16 {
            cnid += 0x12342454;
        }
        if qid.typ & QTDIR == 0 {
            cnid |= 0x4000_0000;
        }
        cnid
    }

    pub fn is_dir(cnid: i32) -> bool {
        cnid & 0x4000_0000 == 0
    }

    /// Record that `cnid` is called `name` inside `parent`.
    /// "Definitive" means the spelling's case is authoritative; a
    /// non-definitive set that differs only in case keeps the cached
    /// spelling (it came from the host originally). Returns the stored
    /// spelling.
    pub async fn set(
        &mut self,
        nine: &mut Client,
        cnid: i32,
        parent: i32,
        name: &str,
        definitive: bool,
    ) -> String {
        let b = which_bucket(cnid);
        let namelen = name.len() + 1;
        assert!(namelen <= BUCKET_BYTES, "catalog name too long");

        match self.which_slot(b, cnid) {
            None => {
                // New entry; evict as many as needed
                if self.cache[b].used_slots == BUCKET_SLOTS {
                    self.spill(nine, b).await;
                }
                while self.cache[b].used_bytes + namelen > BUCKET_BYTES {
                    self.spill(nine, b).await;
                }

                let bucket = &mut self.cache[b];
                let slot = bucket.used_slots;
                bucket.used_slots += 1;
                bucket.slots[slot] =
                    Slot { cnid, parent, dirty: true, offset: 0 };
                bucket.install_name(slot, name.as_bytes());
                String::from_utf8_lossy(self.cache[b].name_of(slot)).into_owned()
            }
            Some(mut slot) => {
                // Correct an existing entry (happens a lot: metadata
                // calls re-announce what they just looked up)
                if self.cache[b].slots[slot].parent != parent {
                    self.cache[b].slots[slot].parent = parent;
                    self.cache[b].slots[slot].dirty = true;
                }

                let old = self.cache[b].name_of(slot);
                if old.len() == name.len() {
                    // Same length, overwrite in place, unless the
                    // change is only capitalisation; an in-place
                    // correction leaves the dirty bit alone
                    let keep = !definitive
                        && crate::charset::ascii_ci_equal(
                            &String::from_utf8_lossy(old),
                            name,
                        );
                    if !keep && old != name.as_bytes() {
                        let at = self.cache[b].slots[slot].offset as usize;
                        self.cache[b].names[at..at + name.len()]
                            .copy_from_slice(name.as_bytes());
                    }
                } else {
                    // Length changed; make room, taking care never to
                    // spill the very slot being updated
                    self.cache[b].delete_slot_name(slot);
                    while self.cache[b].used_bytes + namelen > BUCKET_BYTES {
                        if slot == self.cache[b].used_slots - 1 {
                            slot = self.bubble_up(b, slot);
                        }
                        self.spill(nine, b).await;
                    }
                    self.cache[b].install_name(slot, name.as_bytes());
                    self.cache[b].slots[slot].dirty = true;
                }
                String::from_utf8_lossy(self.cache[b].name_of(slot)).into_owned()
            }
        }
    }

    /// Look up a CNID: `(parent, name)`, pulling the entry back from
    /// its spill file if it fell out of RAM.
    pub async fn get(&mut self, nine: &mut Client, cnid: i32) -> FsResult<(i32, String)> {
        let b = which_bucket(cnid);
        let slot = match self.which_slot(b, cnid) {
            Some(s) => Some(s),
            None => self.unspill(nine, b, cnid).await,
        };

        let Some(slot) = slot else {
            return Err(FsError::NotFound);
        };

        let slot = self.bubble_up(b, slot);
        let bucket = &self.cache[b];
        Ok((
            bucket.slots[slot].parent,
            String::from_utf8_lossy(bucket.name_of(slot)).into_owned(),
        ))
    }

    fn which_slot(&self, b: usize, cnid: i32) -> Option<usize> {
        self.cache[b].slots[..self.cache[b].used_slots]
            .iter()
            .position(|s| s.cnid == cnid)
    }

    /// Recently-used entries drift one place toward the bucket front.
    fn bubble_up(&mut self, b: usize, slot: usize) -> usize {
        if slot == 0 {
            return 0;
        }
        self.cache[b].slots.swap(slot, slot - 1);
        slot - 1
    }

    /// Evict the last slot of a bucket, writing it out first if it is
    /// the only copy.
    async fn spill(&mut self, nine: &mut Client, b: usize) {
        let kill = self.cache[b].used_slots - 1;
        let slot = self.cache[b].slots[kill];
        let name = self.cache[b].name_of(kill).to_vec();

        if slot.dirty {
            let spill_file = format!("{:08x}", slot.cnid as u32);
            trace!(cnid = slot.cnid, file = %spill_file, "catalog spill");
            nine.walk_path(fid::CATALOG, fid::CATALOG_TMP, "")
                .await
                .expect("failed walk for catalog spill");
            nine.lcreate(fid::CATALOG_TMP, &spill_file, O_WRONLY | O_TRUNC, 0o666, 0)
                .await
                .expect("failed create catalog entry");
            nine.write_all(fid::CATALOG_TMP, &slot.parent.to_le_bytes(), 0)
                .await
                .expect("failed write catalog entry parent");
            nine.write_all(fid::CATALOG_TMP, &name, 4)
                .await
                .expect("failed write catalog entry name");
            let _ = nine.clunk(fid::CATALOG_TMP).await;
        }

        self.cache[b].delete_slot_name(kill);
        self.cache[b].used_slots -= 1;
    }

    /// Pull a spilled entry back into its bucket (evicting to make
    /// room) and return the slot it landed in.
    async fn unspill(&mut self, nine: &mut Client, b: usize, cnid: i32) -> Option<usize> {
        let spill_file = format!("{:08x}", cnid as u32);

        if nine
            .walk_path(fid::CATALOG, fid::CATALOG_TMP, &spill_file)
            .await
            .is_err()
        {
            return None;
        }
        if nine.lopen(fid::CATALOG_TMP, O_RDONLY).await.is_err() {
            return None; // an unknown CNID is the caller's problem
        }

        let mut raw = [0u8; 4 + 128];
        let got = nine
            .read(fid::CATALOG_TMP, &mut raw, 0)
            .await
            .expect("failed read catalog entry") as usize;
        if got == 0 {
            panic!("empty catalog spill file");
        }
        let _ = nine.clunk(fid::CATALOG_TMP).await;

        let parent = i32::from_le_bytes(raw[0..4].try_into().unwrap());
        let mut name = &raw[4..got];
        if let [head @ .., 0] = name {
            name = head; // tolerate a recorded terminator
        }
        let namelen = name.len() + 1;

        if self.cache[b].used_slots == BUCKET_SLOTS {
            self.spill(nine, b).await;
        }
        while self.cache[b].used_bytes + namelen > BUCKET_BYTES {
            self.spill(nine, b).await;
        }

        let bucket = &mut self.cache[b];
        let slot = bucket.used_slots;
        bucket.used_slots += 1;
        bucket.slots[slot] = Slot { cnid, parent, dirty: false, offset: 0 };
        let name = name.to_vec();
        bucket.install_name(slot, &name);
        Some(slot)
    }

}

fn which_bucket(cnid: i32) -> usize {
    (cnid as u32 & (BUCKETS as u32 - 1)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog {
            cache: (0..BUCKETS).map(|_| Bucket::default()).collect(),
            root_qid: Qid { typ: QTDIR, version: 0, path: 99 },
        }
    }

    #[test]
    fn root_inode_maps_to_two() {
        let c = catalog();
        let q = Qid { typ: QTDIR, version: 0, path: 99 };
        assert_eq!(c.qid_to_cnid(q), 2);
    }

    #[test]
    fn files_get_the_non_directory_bit() {
        let c = catalog();
        let q = Qid { typ: 0, version: 0, path: 0x1000 };
        let cnid = c.qid_to_cnid(q);
        assert!(!Catalog::is_dir(cnid));
        assert!(Catalog::is_dir(cnid & !0x4000_0000));
        assert!(cnid > 0);
    }

    #[test]
    fn low_hashes_are_biased_away_from_reserved_ids() {
        let c = catalog();
        for path in 0..16u64 {
            let q = Qid { typ: QTDIR, version: 0, path };
            let cnid = c.qid_to_cnid(q);
            assert!(cnid >= 16, "cnid {:#x} for inode {}", cnid, path);
        }
    }

    #[test]
    fn upper_inode_bits_reach_the_hash() {
        let c = catalog();
        let lo = c.qid_to_cnid(Qid { typ: QTDIR, version: 0, path: 0x1234 });
        let hi = c.qid_to_cnid(Qid { typ: QTDIR, version: 0, path: 0x1234 | 0x1000_0000_0000_0000 });
        assert_ne!(lo, hi);
    }
}
