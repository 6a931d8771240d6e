//! Error taxonomy of the bridge.
//!
//! Two currencies circulate in this crate. The 9P client deals in Linux
//! [`Errno`] values carried verbatim in `Rlerror` replies. Everything
//! above the catalog deals in [`FsError`], the guest's own error
//! numbering (the value space is shared with CNIDs, which is why every
//! variant carries a negative 16-bit code).
//!
//! Infrastructure below the 9P client (virtqueue, transport bring-up)
//! does not return errors at all: a transport that cannot negotiate
//! surfaces as [`FsError::OpenFailed`] out of mount, and a virtqueue
//! misuse is a panic.

use std::fmt;

/// A Linux errno as carried by an `Rlerror` reply.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Errno(pub u32);

impl Errno {
    pub const EPERM: Errno = Errno(1);
    pub const ENOENT: Errno = Errno(2);
    pub const EIO: Errno = Errno(5);
    pub const E2BIG: Errno = Errno(7);
    pub const ENOMEM: Errno = Errno(12);
    pub const EACCES: Errno = Errno(13);
    pub const EBUSY: Errno = Errno(16);
    pub const EEXIST: Errno = Errno(17);
    pub const ENODEV: Errno = Errno(19);
    pub const ENOTDIR: Errno = Errno(20);
    pub const EISDIR: Errno = Errno(21);
    pub const EINVAL: Errno = Errno(22);
    pub const ENOSPC: Errno = Errno(28);
    pub const ENOTEMPTY: Errno = Errno(39);
    pub const ENODATA: Errno = Errno(61);
    pub const EPROTONOSUPPORT: Errno = Errno(93);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::E2BIG => "E2BIG",
            Errno::ENOMEM => "ENOMEM",
            Errno::EACCES => "EACCES",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::ENODEV => "ENODEV",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::EINVAL => "EINVAL",
            Errno::ENOSPC => "ENOSPC",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::ENODATA => "ENODATA",
            Errno::EPROTONOSUPPORT => "EPROTONOSUPPORT",
            _ => return None,
        })
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => f.write_str(n),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

/// Result of a 9P operation: the remote errno, verbatim.
pub type NineResult<T> = Result<T, Errno>;

/// Guest-visible error codes. Numeric values are the classic ones and
/// share the negative half of the CNID space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FsError {
    // openErr -23
    OpenFailed,
    // dskFulErr -34
    DiskFull,
    // nsvErr -35
    NoSuchVolume,
    // ioErr -36
    Io,
    // bdNamErr -37
    BadName,
    // eofErr -39
    Eof,
    // posErr -40
    BadPosition,
    // tmfoErr -42
    TooManyOpenFiles,
    // fnfErr -43
    NotFound,
    // wPrErr -44
    WriteProtected,
    // fBsyErr -47
    FileBusy,
    // dupFNErr -48
    DuplicateName,
    // paramErr -50
    BadParameter,
    // permErr -54
    Permission,
    // volOnLinErr -55
    VolumeOnline,
    // extFSErr -58
    ExternalFs,
    // memFullErr -108
    MemFull,
    // dirNFErr -120
    DirNotFound,
    // tmwdoErr -121
    TooManyWorkingDirs,
    // badMovErr -122
    BadMove,
    // fidNotFound -1300
    FileIdNotFound,
    // notAFileErr -1302
    NotAFile,
    /// The catalog cache claimed a CNID for a path prefix that the host
    /// contradicted (a different file has been moved into place). The
    /// guest sees this as plain "file not found"; callers that want to
    /// invalidate and retry can match on it.
    CacheStale,
}

impl FsError {
    /// The on-the-wire error code handed back to the guest.
    pub fn code(self) -> i16 {
        match self {
            FsError::OpenFailed => -23,
            FsError::DiskFull => -34,
            FsError::NoSuchVolume => -35,
            FsError::Io => -36,
            FsError::BadName => -37,
            FsError::Eof => -39,
            FsError::BadPosition => -40,
            FsError::TooManyOpenFiles => -42,
            FsError::NotFound => -43,
            FsError::CacheStale => -43,
            FsError::WriteProtected => -44,
            FsError::FileBusy => -47,
            FsError::DuplicateName => -48,
            FsError::BadParameter => -50,
            FsError::Permission => -54,
            FsError::VolumeOnline => -55,
            FsError::ExternalFs => -58,
            FsError::MemFull => -108,
            FsError::DirNotFound => -120,
            FsError::TooManyWorkingDirs => -121,
            FsError::BadMove => -122,
            FsError::FileIdNotFound => -1300,
            FsError::NotAFile => -1302,
        }
    }

    /// The standard translation of remote errors, used wherever a layer
    /// has no more specific mapping of its own.
    pub fn from_errno(e: Errno) -> FsError {
        match e {
            Errno::ENOENT => FsError::NotFound,
            Errno::ENOTDIR => FsError::DirNotFound,
            Errno::EEXIST => FsError::DuplicateName,
            Errno::EISDIR => FsError::NotAFile,
            Errno::ENOTEMPTY => FsError::FileBusy,
            Errno::ENOSPC => FsError::DiskFull,
            Errno::EPERM | Errno::EACCES => FsError::Permission,
            _ => FsError::Io,
        }
    }
}

impl From<Errno> for FsError {
    fn from(e: Errno) -> FsError {
        FsError::from_errno(e)
    }
}

/// Result of a catalog-level operation.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_the_classic_values() {
        assert_eq!(FsError::NotFound.code(), -43);
        assert_eq!(FsError::DirNotFound.code(), -120);
        assert_eq!(FsError::BadName.code(), -37);
        assert_eq!(FsError::DuplicateName.code(), -48);
    }

    #[test]
    fn stale_cache_is_not_found_to_the_guest() {
        assert_eq!(FsError::CacheStale.code(), FsError::NotFound.code());
        assert_ne!(FsError::CacheStale, FsError::NotFound);
    }

    #[test]
    fn errno_translation() {
        assert_eq!(FsError::from_errno(Errno::ENOENT), FsError::NotFound);
        assert_eq!(FsError::from_errno(Errno::EACCES), FsError::Permission);
        assert_eq!(FsError::from_errno(Errno(1234)), FsError::Io);
    }
}
