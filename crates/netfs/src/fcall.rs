//! netfs protocol data types and constants.
//!
//! # Protocol
//! netfs version 1

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use enum_primitive::*;

use crate::error::FsError;

/// Protocol version exchanged in the `INIT` handshake
pub const VERSION: u32 = 1;

/*
 * Error envelope markers
 */
/// Largest error message length that fits in the envelope
///
/// Markers above this value are sentinels, not lengths.
pub const ERROR_MAX: u16 = 0xFF00;

/// Envelope marker for "no error"
pub const ERROR_NIL: u16 = 0xFF01;

/// Envelope marker for end of stream
pub const ERROR_EOF: u16 = 0xFF02;

/// Fid value meaning "no handle"; never assigned to an open file
pub const NOFID: u32 = 0;

/// Upper bound for length prefixes and read counts (16 MiB)
pub const MAX_DATA_SIZE: u32 = 16 * 1024 * 1024;

/// Default port used by `netfsd`
pub const NETFS_PORT: u16 = 7070;

enum_from_primitive! {
    #[doc = "First byte of every frame"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgKind {
        Init            = 1,
        Request,
        Response,
    }
}

enum_from_primitive! {
    #[doc = "Operation code carried by request and response frames"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Opcode {
        // Link management
        Close           = 1,
        Ping,

        // Filesystem
        Chmod           = 20,
        Chtimes,
        Mkdir,
        MkdirAll,
        Remove,
        RemoveAll,
        Rename,
        Truncate,
        Create,
        Open,
        OpenFile,
        Lstat,
        Stat,

        // Open file
        FileChmod       = 60,
        FileClose,
        FileRead,
        FileReadAt,
        FileReaddir,
        FileReaddirnames,
        FileSeek,
        FileStat,
        FileSync,
        FileTruncate,
        FileWrite,
        FileWriteAt,
    }
}

impl Opcode {
    /// If the opcode manages the link itself rather than the filesystem
    pub fn is_link(&self) -> bool {
        matches!(*self, Opcode::Close | Opcode::Ping)
    }

    /// If the opcode addresses an open file by fid
    pub fn is_file(&self) -> bool {
        *self >= Opcode::FileChmod
    }
}

bitflags! {
    /// File mode and permission bits.
    ///
    /// The type bits occupy the top of the word and the Unix permission
    /// bits the bottom nine, so a mode survives the wire as a plain `u32`.
    ///
    /// `FileMode` can be constructed from `std::fs::Metadata` via From trait
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct FileMode: u32 {
        #[doc = "Directory"]
        const DIR           = 1 << 31;
        #[doc = "Append-only"]
        const APPEND        = 1 << 30;
        #[doc = "Exclusive use"]
        const EXCLUSIVE     = 1 << 29;
        #[doc = "Temporary file"]
        const TEMPORARY     = 1 << 28;
        #[doc = "Symbolic link"]
        const SYMLINK       = 1 << 27;
        #[doc = "Device file"]
        const DEVICE        = 1 << 26;
        #[doc = "Named pipe (FIFO)"]
        const NAMED_PIPE    = 1 << 25;
        #[doc = "Unix domain socket"]
        const SOCKET        = 1 << 24;
        #[doc = "Set-user-ID"]
        const SETUID        = 1 << 23;
        #[doc = "Set-group-ID"]
        const SETGID        = 1 << 22;
        #[doc = "Character device, set together with DEVICE"]
        const CHAR_DEVICE   = 1 << 21;
        #[doc = "Sticky bit"]
        const STICKY        = 1 << 20;
        #[doc = "Non-regular file whose type is otherwise unknown"]
        const IRREGULAR     = 1 << 19;

        #[doc = "Mask for the type bits"]
        const TYPE          = Self::DIR.bits()
                            | Self::SYMLINK.bits()
                            | Self::NAMED_PIPE.bits()
                            | Self::SOCKET.bits()
                            | Self::DEVICE.bits()
                            | Self::CHAR_DEVICE.bits()
                            | Self::IRREGULAR.bits();
        #[doc = "Mask for the Unix permission bits"]
        const PERM          = 0o777;
    }
}

impl FileMode {
    /// Mode holding only the given permission bits, e.g. `FileMode::from_perm(0o755)`
    pub fn from_perm(perm: u32) -> Self {
        FileMode::from_bits_retain(perm & FileMode::PERM.bits())
    }

    /// The Unix permission bits
    pub fn perm(&self) -> u32 {
        self.bits() & FileMode::PERM.bits()
    }

    pub fn is_dir(&self) -> bool {
        self.contains(FileMode::DIR)
    }

    /// If no type bit is set
    pub fn is_regular(&self) -> bool {
        !self.intersects(FileMode::TYPE)
    }

    /// The mode as `chmod(2)` expects it: permissions plus setuid/setgid/sticky.
    pub fn to_unix(&self) -> u32 {
        let mut mode = self.perm();
        if self.contains(FileMode::SETUID) {
            mode |= 0o4000;
        }
        if self.contains(FileMode::SETGID) {
            mode |= 0o2000;
        }
        if self.contains(FileMode::STICKY) {
            mode |= 0o1000;
        }
        mode
    }
}

impl From<fs::Metadata> for FileMode {
    fn from(attr: fs::Metadata) -> Self {
        From::from(&attr)
    }
}

// Default conversion from metadata of libstd
impl<'a> From<&'a fs::Metadata> for FileMode {
    fn from(attr: &'a fs::Metadata) -> Self {
        let raw = attr.mode();
        let typ = attr.file_type();
        let mut mode = FileMode::from_perm(raw);

        if typ.is_dir() {
            mode.insert(FileMode::DIR);
        } else if typ.is_symlink() {
            mode.insert(FileMode::SYMLINK);
        } else if typ.is_block_device() {
            mode.insert(FileMode::DEVICE);
        } else if typ.is_char_device() {
            mode.insert(FileMode::DEVICE | FileMode::CHAR_DEVICE);
        } else if typ.is_fifo() {
            mode.insert(FileMode::NAMED_PIPE);
        } else if typ.is_socket() {
            mode.insert(FileMode::SOCKET);
        }

        if raw & 0o4000 != 0 {
            mode.insert(FileMode::SETUID);
        }
        if raw & 0o2000 != 0 {
            mode.insert(FileMode::SETGID);
        }
        if raw & 0o1000 != 0 {
            mode.insert(FileMode::STICKY);
        }

        mode
    }
}

bitflags! {
    /// Flags of `OpenFile`, numerically equal to the Linux `O_*` values.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct OpenFlags: i32 {
        const RDONLY    = 0x0;
        const WRONLY    = 0x1;
        const RDWR      = 0x2;
        const CREATE    = 0x40;
        const EXCL      = 0x80;
        const TRUNC     = 0x200;
        const APPEND    = 0x400;
        const SYNC      = 0x101000;

        #[doc = "Mask for the access mode"]
        const ACCMODE   = 0x3;
    }
}

impl OpenFlags {
    pub fn readable(&self) -> bool {
        let acc = *self & OpenFlags::ACCMODE;
        acc == OpenFlags::RDONLY || acc == OpenFlags::RDWR
    }

    pub fn writable(&self) -> bool {
        let acc = *self & OpenFlags::ACCMODE;
        acc == OpenFlags::WRONLY || acc == OpenFlags::RDWR
    }
}

/// Seconds since the Unix epoch, negative before it
pub fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => {
            let before = e.duration();
            let secs = before.as_secs() as i64;
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}

/// Inverse of [`unix_secs`]
pub fn from_unix_secs(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Snapshot of file metadata as it crosses the wire.
///
/// The modification time keeps second resolution only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Base name of the file
    pub name: String,
    /// Length in bytes
    pub size: i64,
    /// Type and permission bits
    pub mode: FileMode,
    /// Last modification time
    pub modified: SystemTime,
}

impl Default for FileInfo {
    fn default() -> Self {
        FileInfo {
            name: String::new(),
            size: 0,
            mode: FileMode::empty(),
            modified: UNIX_EPOCH,
        }
    }
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    /// Build from local metadata, truncating the modification time to seconds.
    pub fn from_metadata(name: impl Into<String>, attr: &fs::Metadata) -> Self {
        FileInfo {
            name: name.into(),
            size: attr.size() as i64,
            mode: From::from(attr),
            modified: from_unix_secs(attr.mtime()),
        }
    }
}

/// Data type used in `FileRead` and `FileWrite`
///
/// # Protocol
/// netfs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

/// A frame body.
///
/// `T*` variants travel in `REQUEST` frames, `R*` variants in `RESPONSE`
/// frames under the same opcode. `Init` is the handshake record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FCall {
    Init {
        version: u32,
    },

    // Link management
    TClose,
    TPing,
    RPing,

    // Filesystem
    TChmod {
        name: String,
        mode: FileMode,
    },
    RChmod {
        error: Option<FsError>,
    },
    TChtimes {
        name: String,
        atime: SystemTime,
        mtime: SystemTime,
    },
    RChtimes {
        error: Option<FsError>,
    },
    TMkdir {
        name: String,
        perm: FileMode,
    },
    RMkdir {
        error: Option<FsError>,
    },
    TMkdirAll {
        path: String,
        perm: FileMode,
    },
    RMkdirAll {
        error: Option<FsError>,
    },
    TRemove {
        name: String,
    },
    RRemove {
        error: Option<FsError>,
    },
    TRemoveAll {
        path: String,
    },
    RRemoveAll {
        error: Option<FsError>,
    },
    TRename {
        oldpath: String,
        newpath: String,
    },
    RRename {
        error: Option<FsError>,
    },
    TTruncate {
        name: String,
        size: i64,
    },
    RTruncate {
        error: Option<FsError>,
    },
    TCreate {
        name: String,
    },
    RCreate {
        fid: u32,
        error: Option<FsError>,
    },
    TOpen {
        name: String,
    },
    ROpen {
        fid: u32,
        error: Option<FsError>,
    },
    TOpenFile {
        name: String,
        flags: OpenFlags,
        perm: FileMode,
    },
    ROpenFile {
        fid: u32,
        error: Option<FsError>,
    },
    TLstat {
        name: String,
    },
    RLstat {
        info: FileInfo,
        error: Option<FsError>,
    },
    TStat {
        name: String,
    },
    RStat {
        info: FileInfo,
        error: Option<FsError>,
    },

    // Open file
    TFileChmod {
        fid: u32,
        mode: FileMode,
    },
    RFileChmod {
        error: Option<FsError>,
    },
    TFileClose {
        fid: u32,
    },
    RFileClose {
        error: Option<FsError>,
    },
    TFileRead {
        fid: u32,
        count: u32,
    },
    RFileRead {
        data: Data,
        error: Option<FsError>,
    },
    TFileReadAt {
        fid: u32,
        count: u32,
        offset: i64,
    },
    RFileReadAt {
        data: Data,
        error: Option<FsError>,
    },
    TFileReaddir {
        fid: u32,
        n: i32,
    },
    RFileReaddir {
        entries: Vec<FileInfo>,
        error: Option<FsError>,
    },
    TFileReaddirnames {
        fid: u32,
        n: i32,
    },
    RFileReaddirnames {
        names: Vec<String>,
        error: Option<FsError>,
    },
    TFileSeek {
        fid: u32,
        offset: i64,
        whence: i16,
    },
    RFileSeek {
        offset: i64,
        error: Option<FsError>,
    },
    TFileStat {
        fid: u32,
    },
    RFileStat {
        info: FileInfo,
        error: Option<FsError>,
    },
    TFileSync {
        fid: u32,
    },
    RFileSync {
        error: Option<FsError>,
    },
    TFileTruncate {
        fid: u32,
        size: i64,
    },
    RFileTruncate {
        error: Option<FsError>,
    },
    TFileWrite {
        fid: u32,
        data: Data,
    },
    RFileWrite {
        count: u32,
        error: Option<FsError>,
    },
    TFileWriteAt {
        fid: u32,
        data: Data,
        offset: i64,
    },
    RFileWriteAt {
        count: u32,
        error: Option<FsError>,
    },
}

impl FCall {
    /// Frame kind this body travels in
    pub fn kind(&self) -> MsgKind {
        use crate::FCall::*;

        match *self {
            Init { .. } => MsgKind::Init,
            TClose
            | TPing
            | TChmod { .. }
            | TChtimes { .. }
            | TMkdir { .. }
            | TMkdirAll { .. }
            | TRemove { .. }
            | TRemoveAll { .. }
            | TRename { .. }
            | TTruncate { .. }
            | TCreate { .. }
            | TOpen { .. }
            | TOpenFile { .. }
            | TLstat { .. }
            | TStat { .. }
            | TFileChmod { .. }
            | TFileClose { .. }
            | TFileRead { .. }
            | TFileReadAt { .. }
            | TFileReaddir { .. }
            | TFileReaddirnames { .. }
            | TFileSeek { .. }
            | TFileStat { .. }
            | TFileSync { .. }
            | TFileTruncate { .. }
            | TFileWrite { .. }
            | TFileWriteAt { .. } => MsgKind::Request,
            _ => MsgKind::Response,
        }
    }

    /// If the body is a T-message
    pub fn is_t(&self) -> bool {
        self.kind() == MsgKind::Request
    }

    /// If the body is an R-message
    pub fn is_r(&self) -> bool {
        self.kind() == MsgKind::Response
    }

    /// Opcode of the body, `None` for the handshake record
    pub fn opcode(&self) -> Option<Opcode> {
        use crate::FCall::*;

        let op = match *self {
            Init { .. } => return None,
            TClose => Opcode::Close,
            TPing | RPing => Opcode::Ping,
            TChmod { .. } | RChmod { .. } => Opcode::Chmod,
            TChtimes { .. } | RChtimes { .. } => Opcode::Chtimes,
            TMkdir { .. } | RMkdir { .. } => Opcode::Mkdir,
            TMkdirAll { .. } | RMkdirAll { .. } => Opcode::MkdirAll,
            TRemove { .. } | RRemove { .. } => Opcode::Remove,
            TRemoveAll { .. } | RRemoveAll { .. } => Opcode::RemoveAll,
            TRename { .. } | RRename { .. } => Opcode::Rename,
            TTruncate { .. } | RTruncate { .. } => Opcode::Truncate,
            TCreate { .. } | RCreate { .. } => Opcode::Create,
            TOpen { .. } | ROpen { .. } => Opcode::Open,
            TOpenFile { .. } | ROpenFile { .. } => Opcode::OpenFile,
            TLstat { .. } | RLstat { .. } => Opcode::Lstat,
            TStat { .. } | RStat { .. } => Opcode::Stat,
            TFileChmod { .. } | RFileChmod { .. } => Opcode::FileChmod,
            TFileClose { .. } | RFileClose { .. } => Opcode::FileClose,
            TFileRead { .. } | RFileRead { .. } => Opcode::FileRead,
            TFileReadAt { .. } | RFileReadAt { .. } => Opcode::FileReadAt,
            TFileReaddir { .. } | RFileReaddir { .. } => Opcode::FileReaddir,
            TFileReaddirnames { .. } | RFileReaddirnames { .. } => Opcode::FileReaddirnames,
            TFileSeek { .. } | RFileSeek { .. } => Opcode::FileSeek,
            TFileStat { .. } | RFileStat { .. } => Opcode::FileStat,
            TFileSync { .. } | RFileSync { .. } => Opcode::FileSync,
            TFileTruncate { .. } | RFileTruncate { .. } => Opcode::FileTruncate,
            TFileWrite { .. } | RFileWrite { .. } => Opcode::FileWrite,
            TFileWriteAt { .. } | RFileWriteAt { .. } => Opcode::FileWriteAt,
        };
        Some(op)
    }

    /// Get the fid which a file request addresses
    pub fn fid(&self) -> Option<u32> {
        use crate::FCall::*;

        match *self {
            TFileChmod { fid, .. }
            | TFileClose { fid }
            | TFileRead { fid, .. }
            | TFileReadAt { fid, .. }
            | TFileReaddir { fid, .. }
            | TFileReaddirnames { fid, .. }
            | TFileSeek { fid, .. }
            | TFileStat { fid }
            | TFileSync { fid }
            | TFileTruncate { fid, .. }
            | TFileWrite { fid, .. }
            | TFileWriteAt { fid, .. } => Some(fid),
            RCreate { fid, .. } | ROpen { fid, .. } | ROpenFile { fid, .. } => Some(fid),
            _ => None,
        }
    }

    /// Get the error envelope which a response carries
    pub fn error(&self) -> Option<&FsError> {
        use crate::FCall::*;

        match *self {
            RChmod { ref error }
            | RChtimes { ref error }
            | RMkdir { ref error }
            | RMkdirAll { ref error }
            | RRemove { ref error }
            | RRemoveAll { ref error }
            | RRename { ref error }
            | RTruncate { ref error }
            | RCreate { ref error, .. }
            | ROpen { ref error, .. }
            | ROpenFile { ref error, .. }
            | RLstat { ref error, .. }
            | RStat { ref error, .. }
            | RFileChmod { ref error }
            | RFileClose { ref error }
            | RFileRead { ref error, .. }
            | RFileReadAt { ref error, .. }
            | RFileReaddir { ref error, .. }
            | RFileReaddirnames { ref error, .. }
            | RFileSeek { ref error, .. }
            | RFileStat { ref error, .. }
            | RFileSync { ref error }
            | RFileTruncate { ref error }
            | RFileWrite { ref error, .. }
            | RFileWriteAt { ref error, .. } => error.as_ref(),
            _ => None,
        }
    }
}
