//! Native status translation
//!
//! Each backend library reports failures in its own vocabulary. They are all
//! reduced to a POSIX error number here, and `DeviceError::from_errno` turns
//! that number into the common error kinds.

/// A backend's native status code
pub trait NativeStatus: Copy + std::fmt::Debug {
    /// POSIX error number equivalent. Unmapped codes become `EIO`.
    fn errno(self) -> i32;
}

/// Status codes of the object-store client library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreStatus {
    Failure,
    NoEnt,
    Inval,
    Timeout,
    NoMem,
    Sys,
    Io,
    Limit,
    NameTooLong,
    NotDir,
    Conflict,
    Perm,
    Exist,
    NotSupp,
    Redirect,
    TooManyRedirects,
    Connect,
}

impl NativeStatus for ObjectStoreStatus {
    fn errno(self) -> i32 {
        match self {
            ObjectStoreStatus::NoEnt => libc::ENOENT,
            ObjectStoreStatus::Failure | ObjectStoreStatus::Io => libc::EIO,
            ObjectStoreStatus::NameTooLong => libc::ENAMETOOLONG,
            ObjectStoreStatus::Exist => libc::EEXIST,
            ObjectStoreStatus::Perm => libc::EPERM,
            _ => libc::EIO,
        }
    }
}

impl std::fmt::Display for ObjectStoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ObjectStoreStatus {
    /// Status for a host I/O error, used by the built-in posix store
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => ObjectStoreStatus::NoEnt,
            Some(libc::EEXIST) => ObjectStoreStatus::Exist,
            Some(libc::EPERM) | Some(libc::EACCES) => ObjectStoreStatus::Perm,
            Some(libc::ENAMETOOLONG) => ObjectStoreStatus::NameTooLong,
            Some(libc::ENOTDIR) => ObjectStoreStatus::NotDir,
            Some(libc::EINVAL) => ObjectStoreStatus::Inval,
            Some(libc::ENOMEM) => ObjectStoreStatus::NoMem,
            Some(_) => ObjectStoreStatus::Io,
            None => match err.kind() {
                std::io::ErrorKind::NotFound => ObjectStoreStatus::NoEnt,
                std::io::ErrorKind::AlreadyExists => ObjectStoreStatus::Exist,
                std::io::ErrorKind::PermissionDenied => ObjectStoreStatus::Perm,
                _ => ObjectStoreStatus::Failure,
            },
        }
    }
}

/// RADOS status: a negated errno, as returned by librados calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadosStatus(pub i32);

impl NativeStatus for RadosStatus {
    fn errno(self) -> i32 {
        negated_errno(self.0)
    }
}

/// GlusterFS status: the errno left behind by a failed gfapi call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlusterStatus(pub i32);

impl NativeStatus for GlusterStatus {
    fn errno(self) -> i32 {
        if self.0 > 0 {
            self.0
        } else {
            libc::EIO
        }
    }
}

/// Elasto status: a negated errno
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElastoStatus(pub i32);

impl NativeStatus for ElastoStatus {
    fn errno(self) -> i32 {
        negated_errno(self.0)
    }
}

fn negated_errno(status: i32) -> i32 {
    if status < 0 {
        -status
    } else {
        libc::EIO
    }
}
