//! The guest memory arena.
//!
//! Everything a virtio device can see lives here: the three virtqueue
//! rings and the staging buffers for requests in flight. "Physical
//! addresses" are offsets into the arena, and "wiring" a buffer means
//! staging its bytes at such an address. Both sides of the device
//! boundary hold a handle and go through the typed accessors, which is
//! the closest a safe user-space model gets to DMA.

use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

/// Arena page size. Descriptor chains are built from page-sized chunks.
pub const PAGE: usize = 4096;

/// An address a device can be handed.
pub type PhysAddr = u32;

struct Inner {
    mem: Vec<u8>,
    next: usize,
}

/// Shared handle to the arena. Clones refer to the same memory.
#[derive(Clone)]
pub struct GuestRam {
    inner: Arc<Mutex<Inner>>,
}

impl GuestRam {
    /// Create an arena of at least `bytes`, rounded up to whole pages.
    pub fn new(bytes: usize) -> GuestRam {
        let size = bytes.div_ceil(PAGE) * PAGE;
        GuestRam {
            inner: Arc::new(Mutex::new(Inner { mem: vec![0; size], next: 0 })),
        }
    }

    /// Allocate `n` wired, zeroed, page-aligned pages. Allocations are
    /// permanent (rings and staging areas live for the driver's life);
    /// running out is a sizing bug.
    pub fn alloc_pages(&self, n: usize) -> PhysAddr {
        let mut inner = self.inner.lock().unwrap();
        let at = inner.next;
        let end = at + n * PAGE;
        if end > inner.mem.len() {
            panic!("guest ram exhausted: {} pages requested", n);
        }
        inner.next = end;
        at as PhysAddr
    }

    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let inner = self.inner.lock().unwrap();
        let at = addr as usize;
        buf.copy_from_slice(&inner.mem[at..at + buf.len()]);
    }

    pub fn read_vec(&self, addr: PhysAddr, len: usize) -> Vec<u8> {
        let mut v = vec![0; len];
        self.read(addr, &mut v);
        v
    }

    pub fn write(&self, addr: PhysAddr, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let at = addr as usize;
        inner.mem[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u16(&self, addr: PhysAddr) -> u16 {
        let mut b = [0; 2];
        self.read(addr, &mut b);
        LittleEndian::read_u16(&b)
    }

    pub fn read_u32(&self, addr: PhysAddr) -> u32 {
        let mut b = [0; 4];
        self.read(addr, &mut b);
        LittleEndian::read_u32(&b)
    }

    pub fn read_u64(&self, addr: PhysAddr) -> u64 {
        let mut b = [0; 8];
        self.read(addr, &mut b);
        LittleEndian::read_u64(&b)
    }

    pub fn write_u16(&self, addr: PhysAddr, v: u16) {
        let mut b = [0; 2];
        LittleEndian::write_u16(&mut b, v);
        self.write(addr, &b);
    }

    pub fn write_u32(&self, addr: PhysAddr, v: u32) {
        let mut b = [0; 4];
        LittleEndian::write_u32(&mut b, v);
        self.write(addr, &b);
    }

    pub fn write_u64(&self, addr: PhysAddr, v: u64) {
        let mut b = [0; 8];
        LittleEndian::write_u64(&mut b, v);
        self.write(addr, &b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_page_aligned_and_disjoint() {
        let ram = GuestRam::new(4 * PAGE);
        let a = ram.alloc_pages(1);
        let b = ram.alloc_pages(2);
        assert_eq!(a as usize % PAGE, 0);
        assert_eq!(b as usize, a as usize + PAGE);
    }

    #[test]
    #[should_panic(expected = "guest ram exhausted")]
    fn exhaustion_panics() {
        let ram = GuestRam::new(PAGE);
        ram.alloc_pages(2);
    }

    #[test]
    fn typed_accessors_are_little_endian() {
        let ram = GuestRam::new(PAGE);
        let a = ram.alloc_pages(1);
        ram.write_u32(a, 0x0403_0201);
        assert_eq!(ram.read_vec(a, 4), [1, 2, 3, 4]);
        assert_eq!(ram.read_u16(a + 1), 0x0302);
    }
}
