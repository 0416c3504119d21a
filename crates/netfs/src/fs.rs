//! Filesystem capabilities a server delegates to.
//!
//! Every method has a default implementation that fails with
//! [`FsError::unsupported`], so a backend implements only what it serves.
//! Errors returned here never break the connection: they travel to the
//! client inside the error envelope.

use {
    crate::{
        error::{FsError, Partial},
        fcall::{FileInfo, FileMode, OpenFlags},
    },
    async_trait::async_trait,
    std::{io::SeekFrom, time::SystemTime},
};

pub type FsResult<T> = ::std::result::Result<T, FsError>;

/// The filesystem a server exports.
///
/// Paths are interpreted by the implementation; the protocol passes them
/// through untouched.
///
/// # Example
/// ```no_run
/// use netfs::{FileInfo, fs::{File, Filesystem, FsResult}, srv::srv_async};
/// use async_trait::async_trait;
///
/// struct NullFile;
///
/// #[async_trait]
/// impl File for NullFile {
///     fn name(&self) -> &str {
///         "null"
///     }
/// }
///
/// struct NullFs;
///
/// #[async_trait]
/// impl Filesystem for NullFs {
///     type File = NullFile;
///
///     async fn open(&self, _name: &str) -> FsResult<NullFile> {
///         Ok(NullFile)
///     }
///
///     async fn stat(&self, name: &str) -> FsResult<FileInfo> {
///         Ok(FileInfo { name: name.to_owned(), ..Default::default() })
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> netfs::Result<()> {
///     srv_async(NullFs, "tcp!127.0.0.1!7070").await
/// }
/// ```
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Handle produced by the open family and kept in a session's fid table.
    type File: File + 'static;

    async fn chmod(&self, _name: &str, _mode: FileMode) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    /// Change the access and modification times.
    async fn chtimes(&self, _name: &str, _atime: SystemTime, _mtime: SystemTime) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    async fn mkdir(&self, _name: &str, _perm: FileMode) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    /// Create a directory together with any missing parents.
    async fn mkdir_all(&self, _path: &str, _perm: FileMode) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    async fn remove(&self, _name: &str) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    /// Remove a path and everything below it.
    async fn remove_all(&self, _path: &str) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    async fn rename(&self, _oldpath: &str, _newpath: &str) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    async fn truncate(&self, _name: &str, _size: i64) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    /// Create or truncate a file and open it for reading and writing.
    async fn create(&self, _name: &str) -> FsResult<Self::File> {
        Err(FsError::unsupported())
    }

    /// Open a file for reading.
    async fn open(&self, _name: &str) -> FsResult<Self::File> {
        Err(FsError::unsupported())
    }

    async fn open_file(
        &self,
        _name: &str,
        _flags: OpenFlags,
        _perm: FileMode,
    ) -> FsResult<Self::File> {
        Err(FsError::unsupported())
    }

    /// Describe a file without following a final symbolic link.
    async fn lstat(&self, _name: &str) -> FsResult<FileInfo> {
        Err(FsError::unsupported())
    }

    async fn stat(&self, _name: &str) -> FsResult<FileInfo> {
        Err(FsError::unsupported())
    }
}

/// An open file.
///
/// Data transfers return a [`Partial`] so that a value and an error can be
/// reported together, e.g. the bytes of a short read followed by
/// [`FsError::Eof`].
#[async_trait]
pub trait File: Send {
    /// Name the file was opened with
    fn name(&self) -> &str;

    async fn chmod(&mut self, _mode: FileMode) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    /// Release the file. Called exactly once, also when the session ends.
    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Partial<usize> {
        FsError::unsupported().into()
    }

    async fn read_at(&mut self, _buf: &mut [u8], _offset: i64) -> Partial<usize> {
        FsError::unsupported().into()
    }

    /// Next directory entries; `Some(n)` returns at most `n` of them and
    /// signals exhaustion with `FsError::Eof`, `None` returns all remaining.
    async fn readdir(&mut self, _limit: Option<usize>) -> Partial<Vec<FileInfo>> {
        FsError::unsupported().into()
    }

    /// Like [`readdir`](Self::readdir) but yields names only.
    async fn readdirnames(&mut self, _limit: Option<usize>) -> Partial<Vec<String>> {
        FsError::unsupported().into()
    }

    async fn seek(&mut self, _pos: SeekFrom) -> FsResult<u64> {
        Err(FsError::unsupported())
    }

    async fn stat(&mut self) -> FsResult<FileInfo> {
        Err(FsError::unsupported())
    }

    async fn sync(&mut self) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    async fn truncate(&mut self, _size: i64) -> FsResult<()> {
        Err(FsError::unsupported())
    }

    async fn write(&mut self, _data: &[u8]) -> Partial<usize> {
        FsError::unsupported().into()
    }

    async fn write_at(&mut self, _data: &[u8], _offset: i64) -> Partial<usize> {
        FsError::unsupported().into()
    }
}
