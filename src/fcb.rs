//! The universal open-fork table.
//!
//! One record per open fork. Every FCB open on the same (cnid, fork)
//! pair sits on a cyclic doubly-linked list so that length updates and
//! dirty-flag changes can reach all duplicates; a 256-bucket hash
//! finds list heads. The links are slot indexes, not references, so
//! the table owns every record outright.
//!
//! Invariants: a slot with a nonzero cnid is always enlisted; a bucket
//! head is zero exactly when no matching FCBs exist. Slot zero is
//! never handed out, letting zero mean "no FCB".

const LIST_BUCKETS: usize = 256;

/// Per-open-fork state. The `mf_` fields are the multifork strategy's
/// private bits.
#[derive(Debug, Clone, Default)]
pub struct Fcb {
    /// File this fork belongs to; 0 marks a free slot.
    pub cnid: i32,
    pub resource: bool,
    pub writable: bool,
    pub shared_write: bool,
    /// Current mark (read/write position).
    pub mark: u32,
    /// Cached logical end-of-file.
    pub eof: u32,
    /// Cached physical (allocated) length.
    pub plen: u32,
    /// Strategy-private flag bits.
    pub mf_flags: u8,
    /// Parent directory at open time.
    pub dir_id: i32,
    /// Finder type code at open time.
    pub ftype: [u8; 4],
    /// Host-side leaf name at open time.
    pub name: String,
    /// This record's own slot index.
    pub refnum: u16,
    left: u16,
    right: u16,
}

pub struct FcbTable {
    slots: Vec<Fcb>,
    lists: [u16; LIST_BUCKETS],
}

impl FcbTable {
    /// A table with `capacity` usable records.
    pub fn new(capacity: usize) -> FcbTable {
        FcbTable {
            slots: vec![Fcb::default(); capacity + 1],
            lists: [0; LIST_BUCKETS],
        }
    }

    /// Claim a free slot. The record comes back zeroed with `refnum`
    /// filled in; it is not on any list until [`FcbTable::enlist`].
    pub fn allocate(&mut self) -> Option<u16> {
        for refnum in 1..self.slots.len() {
            if self.slots[refnum].cnid == 0 {
                self.slots[refnum] = Fcb { refnum: refnum as u16, ..Fcb::default() };
                return Some(refnum as u16);
            }
        }
        None
    }

    pub fn get(&self, refnum: u16) -> Option<&Fcb> {
        let fcb = self.slots.get(refnum as usize)?;
        if fcb.cnid == 0 {
            return None;
        }
        Some(fcb)
    }

    pub fn get_mut(&mut self, refnum: u16) -> Option<&mut Fcb> {
        let fcb = self.slots.get_mut(refnum as usize)?;
        if fcb.cnid == 0 {
            return None;
        }
        Some(fcb)
    }

    /// Like [`FcbTable::get_mut`] for refnums that must be live.
    pub fn must(&mut self, refnum: u16) -> &mut Fcb {
        self.get_mut(refnum).expect("dead FCB refnum")
    }

    /// The record itself, live or not: for filling in a freshly
    /// allocated slot before it is enlisted.
    pub fn claim_mut(&mut self, refnum: u16) -> &mut Fcb {
        &mut self.slots[refnum as usize]
    }

    fn hash(cnid: i32, resource: bool) -> usize {
        ((cnid as u32 ^ resource as u32) % LIST_BUCKETS as u32) as usize
    }

    /// Insert a claimed record into its (cnid, fork) list.
    pub fn enlist(&mut self, refnum: u16) {
        let fcb = &self.slots[refnum as usize];
        assert!(fcb.cnid != 0 && fcb.refnum != 0, "enlist of a zero FCB");
        let key = Self::hash(fcb.cnid, fcb.resource);

        let head = self.lists[key];
        if head != 0 {
            let second = self.slots[head as usize].right;
            self.slots[refnum as usize].right = second;
            self.slots[refnum as usize].left = head;
            self.slots[head as usize].right = refnum;
            self.slots[second as usize].left = refnum;
        } else {
            self.slots[refnum as usize].left = refnum;
            self.slots[refnum as usize].right = refnum;
            self.lists[key] = refnum;
        }
    }

    /// Unlink a record from its list (the slot stays claimed until the
    /// caller zeroes its cnid).
    pub fn delist(&mut self, refnum: u16) {
        let fcb = &self.slots[refnum as usize];
        assert!(fcb.cnid != 0 && fcb.refnum != 0, "delist of a zero FCB");
        let key = Self::hash(fcb.cnid, fcb.resource);
        let (left, right) = (fcb.left, fcb.right);

        if self.lists[key] == refnum {
            if left == refnum {
                self.lists[key] = 0; // only element, now there are none
            } else {
                self.lists[key] = left;
            }
        }

        self.slots[left as usize].right = right;
        self.slots[right as usize].left = left;
    }

    /// Release a record entirely.
    pub fn free(&mut self, refnum: u16) {
        self.slots[refnum as usize].cnid = 0;
    }

    /// First open FCB for (cnid, fork), if any.
    pub fn first(&self, cnid: i32, resource: bool) -> Option<u16> {
        let key = Self::hash(cnid, resource);
        let head = self.lists[key];
        if head == 0 {
            return None;
        }

        let mut search = head;
        loop {
            let fcb = &self.slots[search as usize];
            if fcb.cnid == cnid && fcb.resource == resource {
                return Some(search);
            }
            search = fcb.right;
            if search == head {
                return None;
            }
        }
    }

    /// The next FCB on the same (cnid, fork) after `refnum`, or `None`
    /// once the list wraps.
    pub fn next(&self, refnum: u16) -> Option<u16> {
        let fcb = &self.slots[refnum as usize];
        let (cnid, resource) = (fcb.cnid, fcb.resource);
        let key = Self::hash(cnid, resource);
        let head = self.lists[key];
        assert!(head != 0, "next on an unlisted FCB");

        let mut search = fcb.right;
        loop {
            if search == head {
                return None; // circled back to the start
            }
            let fcb = &self.slots[search as usize];
            if fcb.cnid == cnid && fcb.resource == resource {
                return Some(search);
            }
            search = fcb.right;
        }
    }

    /// Run `f` over every open FCB for (cnid, fork).
    pub fn for_each(&mut self, cnid: i32, resource: bool, mut f: impl FnMut(&mut Fcb)) {
        let mut cursor = self.first(cnid, resource);
        while let Some(refnum) = cursor {
            f(&mut self.slots[refnum as usize]);
            cursor = self.next(refnum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(t: &mut FcbTable, cnid: i32, resource: bool) -> u16 {
        let r = t.allocate().expect("table full");
        let fcb = t.claim_mut(r);
        fcb.cnid = cnid;
        fcb.resource = resource;
        t.enlist(r);
        r
    }

    #[test]
    fn allocate_skips_slot_zero() {
        let mut t = FcbTable::new(4);
        assert_eq!(t.allocate(), Some(1));
    }

    #[test]
    fn first_next_visit_every_duplicate_exactly_once() {
        let mut t = FcbTable::new(16);
        let a = open(&mut t, 7, false);
        let b = open(&mut t, 7, false);
        let c = open(&mut t, 7, true); // other fork, same hash parity aside
        let d = open(&mut t, 7, false);

        let mut seen = Vec::new();
        let mut cur = t.first(7, false);
        while let Some(r) = cur {
            seen.push(r);
            cur = t.next(r);
        }
        seen.sort();
        assert_eq!(seen, vec![a, b, d]);

        assert_eq!(t.first(7, true), Some(c));
        assert_eq!(t.next(c), None);
    }

    #[test]
    fn hash_collisions_share_a_list_but_not_results() {
        let mut t = FcbTable::new(16);
        // 7 and 263 collide modulo 256
        let a = open(&mut t, 7, false);
        let _b = open(&mut t, 263, false);
        assert_eq!(t.first(7, false), Some(a));
        assert_eq!(t.next(a), None);
    }

    #[test]
    fn delist_maintains_the_cycle() {
        let mut t = FcbTable::new(16);
        let a = open(&mut t, 9, false);
        let b = open(&mut t, 9, false);
        let c = open(&mut t, 9, false);

        t.delist(b);
        t.free(b);

        let mut seen = Vec::new();
        let mut cur = t.first(9, false);
        while let Some(r) = cur {
            seen.push(r);
            cur = t.next(r);
        }
        seen.sort();
        assert_eq!(seen, vec![a, c]);

        t.delist(a);
        t.free(a);
        t.delist(c);
        t.free(c);
        assert_eq!(t.first(9, false), None);
    }

    #[test]
    fn for_each_updates_all_duplicates() {
        let mut t = FcbTable::new(8);
        open(&mut t, 5, false);
        open(&mut t, 5, false);
        t.for_each(5, false, |fcb| fcb.eof = 42);
        let mut cur = t.first(5, false);
        while let Some(r) = cur {
            assert_eq!(t.get(r).unwrap().eof, 42);
            cur = t.next(r);
        }
    }
}
