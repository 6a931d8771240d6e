//! ninebridge - a file-system bridge between a legacy, fork-oriented
//! catalog API and a host directory tree served over 9P2000.L on a
//! virtio split-virtqueue transport.
//!
//! The stack, bottom to top:
//!
//! - [`virtio`] - guest memory arena, split virtqueue rings, and the
//!   transport contract a device must satisfy.
//! - [`nine`] - a synchronous (one request in flight) 9P2000.L client
//!   with FID bookkeeping and buffered streams.
//! - [`rez`] - the resource-fork binary <-> Rez text codec.
//! - [`catalog`] - the CNID database: a spill-to-disk cache mapping
//!   31-bit node IDs to (parent, name), plus textual path resolution.
//! - [`multifork`] - strategies mapping (data fork, resource fork,
//!   Finder metadata) onto plain host files.
//! - [`fcb`] - the open-fork table shared by all of the above.
//! - [`sortdir`] - stable, collated, indexed directory enumeration over
//!   an unordered remote listing.
//! - [`volume`] - the façade translating catalog-API operations into
//!   the layers above.
//! - [`loopback`] - an in-process virtio-9p device over an in-memory
//!   host tree, used by the tests and demos.

pub mod catalog;
pub mod charset;
pub mod errors;
pub mod fcb;
pub mod loopback;
pub mod multifork;
pub mod nine;
pub mod rez;
pub mod sortdir;
pub mod timeconv;
pub mod virtio;
pub mod volume;

pub use errors::{Errno, FsError, FsResult, NineResult};
pub use volume::Volume;
