//! Split virtqueue rings.
//!
//! The three rings live in guest memory in the standard layout (one
//! page each): a descriptor table, the driver ("avail") ring and the
//! device ("used") ring. Free descriptors are threaded through their
//! own `next` field with `0xFFFF` as the sentinel, so no shadow
//! free-list is needed; [`Virtqueue::send`] reverse-scans the table to
//! build a chain and [`Virtqueue::poll`] writes the sentinel back as it
//! unlinks one.
//!
//! Notification suppression runs in both directions: the device sets
//! `used.flags` to ask the driver not to ring the doorbell, and the
//! driver sets `avail.flags` whenever no one has registered interest
//! via [`Virtqueue::interest`].

use super::ram::{GuestRam, PhysAddr, PAGE};
use super::Transport;

/// Hard ceiling on ring size (one page of descriptors).
pub const MAX_RING: usize = 256;

/// A descriptor whose `next` field holds this value is free.
const FREE: u16 = 0xFFFF;

const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;

/// Driver-side state of one virtqueue.
pub struct Virtqueue {
    ram: GuestRam,
    q: u16,
    size: u16,
    desc: PhysAddr,
    avail: PhysAddr,
    used: PhysAddr,
    used_ctr: u16,
    interest: i32,
    tags: [u64; MAX_RING],
}

impl Virtqueue {
    /// Allocate the rings, disable notifications, and hand the physical
    /// addresses to the transport. Returns `None` if the device offers
    /// no such queue. The actual size is the smallest of `max_size`,
    /// [`MAX_RING`] and the device's maximum.
    pub fn init(
        ram: &GuestRam,
        transport: &mut dyn Transport,
        q: u16,
        max_size: u16,
    ) -> Option<Virtqueue> {
        let mut size = max_size.min(MAX_RING as u16);
        let devmax = transport.queue_max_size(q);
        if devmax == 0 {
            return None;
        }
        size = size.min(devmax);

        let desc = ram.alloc_pages(1);
        let avail = ram.alloc_pages(1);
        let used = ram.alloc_pages(1);
        debug_assert!(16 * size as usize <= PAGE);

        transport.queue_set(q, size, desc, avail, used);

        let vq = Virtqueue {
            ram: ram.clone(),
            q,
            size,
            desc,
            avail,
            used,
            used_ctr: 0,
            interest: 0,
            tags: [0; MAX_RING],
        };

        for i in 0..size {
            vq.write_next(i, FREE);
        }

        // No notifications until someone declares interest
        vq.ram.write_u16(vq.avail, 1);

        Some(vq)
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    fn desc_at(&self, i: u16) -> PhysAddr {
        self.desc + 16 * i as u32
    }

    fn read_next(&self, i: u16) -> u16 {
        self.ram.read_u16(self.desc_at(i) + 14)
    }

    fn write_next(&self, i: u16, v: u16) {
        self.ram.write_u16(self.desc_at(i) + 14, v)
    }

    /// Build and publish one descriptor chain: `n_out` device-readable
    /// buffers followed by `n_in` device-writable ones. The chain's tag
    /// is recorded at the head index so completion can be routed back.
    ///
    /// Panics when the table has too few free descriptors; callers size
    /// the ring for their worst case and bound in-flight work.
    pub fn send(&mut self, n_out: usize, n_in: usize, addrs: &[PhysAddr], lens: &[u32], tag: u64) {
        let total = n_out + n_in;
        assert!(total > 0 && addrs.len() >= total && lens.len() >= total);

        // Reverse-iterate the table, linking free descriptors into a
        // chain that ends at the last buffer.
        let mut remain = total;
        let mut nextbuf: u16 = 0;
        let mut head: u16 = 0;
        for buf in (0..self.size).rev() {
            if self.read_next(buf) != FREE {
                continue;
            }

            remain -= 1;

            let at = self.desc_at(buf);
            self.ram.write_u64(at, addrs[remain] as u64);
            self.ram.write_u32(at + 8, lens[remain]);
            let mut flags = 0;
            if remain < total - 1 {
                flags |= DESC_F_NEXT;
            }
            if remain >= n_out {
                flags |= DESC_F_WRITE;
            }
            self.ram.write_u16(at + 12, flags);
            self.write_next(buf, nextbuf);

            nextbuf = buf;
            if remain == 0 {
                head = buf;
                break;
            }
        }
        if remain > 0 {
            panic!("virtqueue {} out of descriptors", self.q);
        }

        self.tags[head as usize] = tag;

        // Publish the head in the avail ring
        let idx = self.ram.read_u16(self.avail + 2);
        self.ram
            .write_u16(self.avail + 4 + 2 * (idx & (self.size - 1)) as u32, head);
        self.ram.write_u16(self.avail + 2, idx.wrapping_add(1));
    }

    /// Ring the doorbell, unless the device asked not to be notified.
    pub fn notify(&self, transport: &mut dyn Transport) {
        if self.ram.read_u16(self.used) == 0 {
            transport.notify(self.q);
        }
    }

    /// Reference-counted interest in completions. At zero the
    /// no-notifications flag is set in the avail ring; above zero it is
    /// cleared.
    pub fn interest(&mut self, delta: i32) {
        self.interest += delta;
        self.resync_interest();
    }

    /// Set the no-notifications flag unconditionally (interrupt entry).
    pub fn disarm(&self) {
        self.ram.write_u16(self.avail, 1);
    }

    /// Restore the no-notifications flag from the interest counter.
    pub fn resync_interest(&self) {
        self.ram
            .write_u16(self.avail, (self.interest == 0) as u16);
    }

    /// Drain the used ring: reclaim each completed chain to the free
    /// list and report `(len, tag)` to the caller. Idempotent, callable
    /// from any context.
    pub fn poll(&mut self, on_completion: &mut dyn FnMut(u16, u32, u64)) {
        let mask = self.size - 1;
        let end = self.ram.read_u16(self.used + 2);
        let mut i = self.used_ctr;
        self.used_ctr = end;

        while i != end {
            let at = self.used + 4 + 8 * (i & mask) as u32;
            let head = self.ram.read_u32(at) as u16;
            let len = self.ram.read_u32(at + 4);

            let mut buf = head;
            loop {
                let nextbuf = self.read_next(buf);
                let flags = self.ram.read_u16(self.desc_at(buf) + 12);
                self.write_next(buf, FREE);
                if flags & DESC_F_NEXT == 0 {
                    break;
                }
                buf = nextbuf;
            }

            on_completion(self.q, len, self.tags[head as usize]);
            i = i.wrapping_add(1);
        }
    }
}

/// The interrupt path: disarm every queue, drain, let the transport
/// re-enable interrupt delivery, restore the interest flags, then drain
/// once more to close the race where a completion landed between the
/// first drain and the rearm.
pub fn service_interrupt(
    queues: &mut [Virtqueue],
    transport: &mut dyn Transport,
    on_completion: &mut dyn FnMut(u16, u32, u64),
) {
    for q in queues.iter() {
        q.disarm();
    }
    for q in queues.iter_mut() {
        q.poll(on_completion);
    }

    transport.rearm();
    for q in queues.iter() {
        q.resync_interest();
    }

    for q in queues.iter_mut() {
        q.poll(on_completion);
    }
}
