//! Filesystem-level error taxonomy.

use crate::cadapter::client::RemoteError;
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: not a directory")]
    NotADirectory(String),

    #[error("{0}: is a directory")]
    IsADirectory(String),

    #[error("{0}: permission denied")]
    PermissionDenied(String),

    #[error("{0}: read-only filesystem")]
    ReadOnly(String),

    #[error("{0}: operation not supported")]
    Unsupported(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("{0}: already open for writing")]
    AlreadyOpen(String),

    #[error("{0}: no write buffer open")]
    NotOpen(String),

    #[error("{path}: remote call failed: {source}")]
    Remote {
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("{path}: local staging failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    /// Classify a remote failure seen while serving `path`.
    pub fn from_remote(path: impl Into<String>, source: RemoteError) -> Self {
        let path = path.into();
        match source {
            RemoteError::NotFound(_) => FsError::NotFound(path),
            source => FsError::Remote { path, source },
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::ReadOnly(_) => libc::EROFS,
            FsError::Unsupported(_) => libc::ENOTSUP,
            FsError::AlreadyExists(_) | FsError::AlreadyOpen(_) => libc::EEXIST,
            FsError::NotOpen(_) => libc::EBADF,
            FsError::Remote { .. } | FsError::Io { .. } => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let cases = [
            (FsError::NotFound("/a".into()), libc::ENOENT),
            (FsError::NotADirectory("/a".into()), libc::ENOTDIR),
            (FsError::IsADirectory("/a".into()), libc::EISDIR),
            (FsError::PermissionDenied("/a".into()), libc::EACCES),
            (FsError::ReadOnly("/a".into()), libc::EROFS),
            (FsError::Unsupported("/a".into()), libc::ENOTSUP),
            (FsError::AlreadyExists("/a".into()), libc::EEXIST),
            (FsError::AlreadyOpen("/a".into()), libc::EEXIST),
            (FsError::NotOpen("/a".into()), libc::EBADF),
        ];
        for (err, errno) in cases {
            assert_eq!(err.errno(), errno, "{err}");
        }
    }

    #[test]
    fn remote_not_found_is_not_found() {
        let err = FsError::from_remote("/Movies", RemoteError::NotFound(1));
        assert!(matches!(err, FsError::NotFound(ref p) if p == "/Movies"));

        let err = FsError::from_remote("/Movies", RemoteError::Unauthorized(401));
        assert_eq!(err.errno(), libc::EIO);
    }
}
