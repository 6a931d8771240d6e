#![allow(dead_code)]

//! Shared fixtures: an in-memory host tree behind the loopback device,
//! mounted either as a full volume or as a bare 9P client.

use std::sync::{Arc, Mutex};

use ninebridge::catalog::Catalog;
use ninebridge::loopback::{HostFs, LoopbackDevice};
use ninebridge::nine::{fid, Client, Qid};
use ninebridge::virtio::GuestRam;
use ninebridge::volume::{Volume, DOTDIR_NAME};

/// A mounted volume over a scripted tree.
pub struct Fixture {
    pub tree: Arc<Mutex<HostFs>>,
    pub vol: Volume,
}

impl Fixture {
    pub async fn new(build: impl FnOnce(&mut HostFs)) -> Fixture {
        Fixture::with_tag("Test_3", build).await
    }

    pub async fn with_tag(tag: &str, build: impl FnOnce(&mut HostFs)) -> Fixture {
        let mut fs = HostFs::new();
        build(&mut fs);
        let tree = Arc::new(Mutex::new(fs));
        let vol = Volume::mount_loopback(tree.clone(), tag).await.expect("mount");
        Fixture { tree, vol }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().unwrap().file_bytes(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().unwrap().resolve(path).is_some()
    }
}

/// A bare client attached to the root, for tests below the façade.
pub struct Wire {
    pub tree: Arc<Mutex<HostFs>>,
    pub nine: Client,
    pub root_qid: Qid,
}

impl Wire {
    pub async fn new(build: impl FnOnce(&mut HostFs)) -> Wire {
        let mut fs = HostFs::new();
        build(&mut fs);
        let tree = Arc::new(Mutex::new(fs));
        let ram = GuestRam::new(4 << 20);
        let device = LoopbackDevice::new(&ram, tree.clone(), "Test");
        let mut nine = Client::connect(ram, Box::new(device), 64).await.expect("connect");
        let root_qid = nine.attach(fid::ROOT, None, "", "", 0).await.expect("attach");
        Wire { tree, nine, root_qid }
    }

    /// Set up the housekeeping directory and a catalog over it.
    pub async fn catalog(&mut self) -> Catalog {
        let _ = self.nine.mkdir(fid::ROOT, 0o777, 0, DOTDIR_NAME).await;
        self.nine
            .walk_path(fid::ROOT, fid::DOTDIR, DOTDIR_NAME)
            .await
            .expect("walk dotdir");
        Catalog::init(&mut self.nine, self.root_qid).await
    }

    /// Create a file on the host and leave an open writable fid on it.
    pub async fn open_file(&mut self, scratch_fid: u32, path: &str, bytes: &[u8]) -> u32 {
        self.tree.lock().unwrap().put_file(path, bytes);
        self.nine
            .walk_path(fid::ROOT, scratch_fid, path)
            .await
            .expect("walk to file");
        self.nine
            .lopen(scratch_fid, ninebridge::nine::O_RDWR)
            .await
            .expect("open file");
        scratch_fid
    }
}
