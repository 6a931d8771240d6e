//! Textual path resolution: the navigation primitive everything above
//! the catalog goes through.
//!
//! A guest path is colon-separated, with empty components meaning
//! "parent directory" and an absolute path carrying the (ignored)
//! volume name up front. Resolution reconstructs any needed prefix
//! from the CNID database, then issues one remote walk whose returned
//! qids are authoritative and are folded back into the database.

use tracing::trace;

use crate::charset;
use crate::errors::{FsError, FsResult};
use crate::nine::{fid, Client};

use super::{Catalog, COMPONENTS_MAX, COMPONENT_MAX};

/// A resolved path: the node, its parent, and the leaf's host-side
/// spelling (captured here so callers don't immediately re-query it).
#[derive(Debug, Clone, PartialEq)]
pub struct WalkHit {
    pub cnid: i32,
    pub parent: i32,
    pub name: String,
}

impl Catalog {
    /// Resolve `path` (guest bytes, no length prefix) relative to
    /// `cnid`, leaving `fid` at the result. The base CNID must be a
    /// directory unless an absolute path makes it irrelevant.
    ///
    /// Errors: [`FsError::BadName`] for an over-long path,
    /// [`FsError::NotFound`] for a missing leaf,
    /// [`FsError::DirNotFound`] for a missing intermediate component
    /// or a `..` through a file, and [`FsError::CacheStale`] when the
    /// host contradicts the database's claim for a prefix resolved by
    /// ID.
    pub async fn walk(
        &mut self,
        nine: &mut Client,
        fid: u32,
        cnid: i32,
        path: &[u8],
    ) -> FsResult<WalkHit> {
        trace!(cnid = %format_args!("{:08x}", cnid), path = %String::from_utf8_lossy(path), "catalog walk");

        let mut els: Vec<String> = Vec::new();
        let mut p = 0usize;
        let len = path.len();

        if is_absolute(cnid, path) {
            // Absolute: strip the volume name (it is ours)
            if p < len && path[p] == b':' {
                p += 1; // one leading colon can be ignored
            }
            if p == len || path[p] == b':' {
                return Err(FsError::NotFound); // then text is mandatory
            }
            while p < len && path[p] != b':' {
                p += 1;
            }
        } else {
            // Relative: convert the base CNID to a chain of components
            // known by ID
            if !Catalog::is_dir(cnid) {
                return Err(FsError::NotFound);
            }
            let mut trail = cnid;
            while trail != 2 {
                if els.len() == COMPONENTS_MAX {
                    return Err(FsError::BadName);
                }
                let (parent, name) = self
                    .get(nine, trail)
                    .await
                    .map_err(|_| FsError::NotFound)?;
                els.insert(0, name);
                trail = parent;
            }
        }
        let nel_by_id = els.len();

        if p < len && path[p] == b':' {
            p += 1; // remove up to one leading colon
        }

        while p < len {
            if path[p] != b':' {
                // One textual component
                if els.len() == COMPONENTS_MAX {
                    return Err(FsError::BadName);
                }
                let start = p;
                while p < len && path[p] != b':' {
                    p += 1;
                }
                let comp = charset::roman_to_host_name(&path[start..p]);
                if comp.len() > COMPONENT_MAX {
                    return Err(FsError::BadName);
                }
                els.push(comp);
            }

            if p < len && path[p] == b':' {
                p += 1; // one expected separator
            }

            while p < len && path[p] == b':' {
                // further colons mean dot-dot
                if els.len() == COMPONENTS_MAX {
                    return Err(FsError::BadName);
                }
                els.push("..".to_owned());
                p += 1;
            }
        }

        // One remote walk from the volume root; its qids are the truth
        let names: Vec<&str> = els.iter().map(|s| s.as_str()).collect();
        let qids = nine.walk(fid::ROOT, fid, &names).await.map_err(FsError::from)?;
        let got = qids.len();
        let nel = els.len();

        // Not allowed to ".." through a file
        for qid in qids.iter().take(got.saturating_sub(1)) {
            if !qid.is_dir() {
                return Err(FsError::DirNotFound);
            }
        }

        if nel > 0 && got == nel - 1 {
            return Err(FsError::NotFound);
        } else if got < nel {
            return Err(FsError::DirNotFound);
        } else if nel_by_id > 0 && cnid != self.qid_to_cnid(qids[nel_by_id - 1]) {
            // A different file has been moved into place; the database
            // is out of date. Reported distinctly, same guest code.
            return Err(FsError::CacheStale);
        }

        // Fold dot-dots out of the element list so the database links
        // the result back to the root; record everything beyond the
        // known-by-ID prefix.
        let mut folded: Vec<(crate::nine::Qid, &str)> = els[..nel_by_id]
            .iter()
            .enumerate()
            .map(|(i, e)| (qids[i], e.as_str()))
            .collect();
        let mut last_set: Option<String> = None;
        for i in nel_by_id..nel {
            if els[i] == ".." {
                folded.pop();
            } else {
                folded.push((qids[i], els[i].as_str()));
                let child = self.qid_to_cnid(qids[i]);
                let parent = if folded.len() >= 2 {
                    self.qid_to_cnid(qids_of(&folded, folded.len() - 2))
                } else {
                    2
                };
                last_set = Some(self.set(nine, child, parent, &els[i], false).await);
            }
        }

        let name = match last_set {
            Some(n) => n,
            None => match folded.last() {
                Some((_, n)) => (*n).to_owned(),
                None => self
                    .get(nine, 2)
                    .await
                    .map(|(_, n)| n)
                    .unwrap_or_default(), // the disk's own name
            },
        };

        let parent = match folded.len() {
            0 => 1, // parent of root
            1 => 2, // root
            n => self.qid_to_cnid(qids_of(&folded, n - 2)),
        };

        let cnid = match qids.last() {
            Some(&q) => self.qid_to_cnid(q),
            None => 2,
        };

        trace!(
            cnid = %format_args!("{:08x}", cnid),
            parent = %format_args!("{:08x}", parent),
            name = %name,
            "catalog walk hit"
        );

        Ok(WalkHit { cnid, parent, name })
    }
}

fn qids_of(folded: &[(crate::nine::Qid, &str)], i: usize) -> crate::nine::Qid {
    folded[i].0
}

/// The documented definition of an absolute path: contains a colon but
/// does not start with one. A base CNID of 1 ("parent of root") forces
/// absolute too; get this wrong and the volume cannot be renamed.
fn is_absolute(cnid: i32, path: &[u8]) -> bool {
    if cnid == 1 {
        return true;
    }
    match path.iter().position(|&b| b == b':') {
        Some(p) => p != 0,
        None => false,
    }
}
