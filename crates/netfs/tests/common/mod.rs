//! Shared fixture: a scripted in-memory filesystem served over an in-process
//! duplex stream.

// Allow dead code - these utilities are conditionally used by different test files
#![allow(dead_code)]

use std::io::SeekFrom;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use netfs::conn::Connection;
use netfs::fs::{File, Filesystem, FsResult};
use netfs::srv::Server;
use netfs::{Client, ClientConfig, FileInfo, FileMode, FsError, OpenFlags, Partial, ServerConfig, unix_secs};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub type RawConnection = Connection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// What the filesystem saw and what it answers with.
#[derive(Default)]
pub struct Script {
    /// One line per delegate call, e.g. `chmod test_a 755`
    pub calls: Vec<String>,
    /// Error returned by every call while set
    pub error: Option<FsError>,
    /// Answer of the stat family
    pub info: FileInfo,
    /// Contents of every opened file
    pub data: Vec<u8>,
    /// Directory listing served by readdir
    pub entries: Vec<FileInfo>,
    /// Serial numbers of closed files, in closing order
    pub closed: Vec<usize>,
    opened: usize,
}

#[derive(Clone, Default)]
pub struct MockFs {
    state: Arc<Mutex<Script>>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.state.lock().unwrap()
    }

    pub fn fail_with(&self, msg: &str) {
        self.script().error = Some(FsError::msg(msg));
    }

    pub fn succeed(&self) {
        self.script().error = None;
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut self.script().calls)
    }

    fn record(&self, call: String) -> FsResult<()> {
        let mut script = self.script();
        script.calls.push(call);
        match script.error {
            Some(ref e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn open_as(&self, call: String, name: &str) -> FsResult<MockFile> {
        self.record(call)?;
        let mut script = self.script();
        script.opened += 1;
        Ok(MockFile {
            serial: script.opened,
            name: name.to_owned(),
            pos: 0,
            dir_pos: 0,
            fs: self.clone(),
        })
    }
}

#[async_trait]
impl Filesystem for MockFs {
    type File = MockFile;

    async fn chmod(&self, name: &str, mode: FileMode) -> FsResult<()> {
        self.record(format!("chmod {} {:o}", name, mode.bits()))
    }

    async fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.record(format!("chtimes {} {} {}", name, unix_secs(atime), unix_secs(mtime)))
    }

    async fn mkdir(&self, name: &str, perm: FileMode) -> FsResult<()> {
        self.record(format!("mkdir {} {:o}", name, perm.bits()))
    }

    async fn mkdir_all(&self, path: &str, perm: FileMode) -> FsResult<()> {
        self.record(format!("mkdirall {} {:o}", path, perm.bits()))
    }

    async fn remove(&self, name: &str) -> FsResult<()> {
        self.record(format!("remove {}", name))
    }

    async fn remove_all(&self, path: &str) -> FsResult<()> {
        self.record(format!("removeall {}", path))
    }

    async fn rename(&self, oldpath: &str, newpath: &str) -> FsResult<()> {
        self.record(format!("rename {} {}", oldpath, newpath))
    }

    async fn truncate(&self, name: &str, size: i64) -> FsResult<()> {
        self.record(format!("truncate {} {}", name, size))
    }

    async fn create(&self, name: &str) -> FsResult<MockFile> {
        self.open_as(format!("create {}", name), name)
    }

    async fn open(&self, name: &str) -> FsResult<MockFile> {
        self.open_as(format!("open {}", name), name)
    }

    async fn open_file(&self, name: &str, flags: OpenFlags, perm: FileMode) -> FsResult<MockFile> {
        self.open_as(
            format!("openfile {} {:#x} {:o}", name, flags.bits(), perm.bits()),
            name,
        )
    }

    async fn lstat(&self, name: &str) -> FsResult<FileInfo> {
        self.record(format!("lstat {}", name))?;
        Ok(self.script().info.clone())
    }

    async fn stat(&self, name: &str) -> FsResult<FileInfo> {
        self.record(format!("stat {}", name))?;
        Ok(self.script().info.clone())
    }
}

pub struct MockFile {
    serial: usize,
    name: String,
    pos: usize,
    dir_pos: usize,
    fs: MockFs,
}

impl MockFile {
    fn record(&self, call: &str) -> FsResult<()> {
        self.fs.record(format!("file {} {}", call, self.name))
    }

    // Go-style directory cursor shared by readdir and readdirnames.
    fn next_entries(&mut self, limit: Option<usize>) -> Partial<Vec<FileInfo>> {
        let entries = self.fs.script().entries.clone();
        let rest = &entries[self.dir_pos.min(entries.len())..];
        match limit {
            Some(_) if rest.is_empty() => Partial::with_error(Vec::new(), FsError::Eof),
            Some(n) => {
                let taken: Vec<_> = rest.iter().take(n).cloned().collect();
                self.dir_pos += taken.len();
                Partial::ok(taken)
            }
            None => {
                self.dir_pos = entries.len();
                Partial::ok(rest.to_vec())
            }
        }
    }
}

#[async_trait]
impl File for MockFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chmod(&mut self, mode: FileMode) -> FsResult<()> {
        self.record(&format!("chmod {:o}", mode.bits()))
    }

    async fn close(&mut self) -> FsResult<()> {
        self.fs.script().closed.push(self.serial);
        self.record("close")
    }

    async fn read(&mut self, buf: &mut [u8]) -> Partial<usize> {
        if let Err(e) = self.record("read") {
            return e.into();
        }
        let data = self.fs.script().data.clone();
        let rest = &data[self.pos.min(data.len())..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        if n == 0 && !buf.is_empty() {
            Partial::with_error(0, FsError::Eof)
        } else {
            Partial::ok(n)
        }
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: i64) -> Partial<usize> {
        if let Err(e) = self.record(&format!("readat {}", offset)) {
            return e.into();
        }
        let data = self.fs.script().data.clone();
        let rest = &data[(offset as usize).min(data.len())..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        if n < buf.len() {
            Partial::with_error(n, FsError::Eof)
        } else {
            Partial::ok(n)
        }
    }

    async fn readdir(&mut self, limit: Option<usize>) -> Partial<Vec<FileInfo>> {
        if let Err(e) = self.record(&format!("readdir {:?}", limit)) {
            return e.into();
        }
        self.next_entries(limit)
    }

    async fn readdirnames(&mut self, limit: Option<usize>) -> Partial<Vec<String>> {
        if let Err(e) = self.record(&format!("readdirnames {:?}", limit)) {
            return e.into();
        }
        let res = self.next_entries(limit);
        Partial {
            value: res.value.into_iter().map(|info| info.name).collect(),
            error: res.error,
        }
    }

    async fn seek(&mut self, pos: SeekFrom) -> FsResult<u64> {
        self.record(&format!("seek {:?}", pos))?;
        Ok(42)
    }

    async fn stat(&mut self) -> FsResult<FileInfo> {
        self.record("stat")?;
        Ok(self.fs.script().info.clone())
    }

    async fn sync(&mut self) -> FsResult<()> {
        self.record("sync")
    }

    async fn truncate(&mut self, size: i64) -> FsResult<()> {
        self.record(&format!("truncate {}", size))
    }

    async fn write(&mut self, data: &[u8]) -> Partial<usize> {
        let line = format!("write {}", String::from_utf8_lossy(data));
        if let Err(e) = self.record(&line) {
            return e.into();
        }
        self.fs.script().data.extend_from_slice(data);
        Partial::ok(data.len())
    }

    async fn write_at(&mut self, data: &[u8], offset: i64) -> Partial<usize> {
        let line = format!("writeat {} {}", offset, String::from_utf8_lossy(data));
        if let Err(e) = self.record(&line) {
            return e.into();
        }
        Partial::ok(data.len())
    }
}

fn duplex_pair() -> (
    (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
    (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (tokio::io::split(a), tokio::io::split(b))
}

/// Serve `fs` in a background task over an in-process stream.
pub fn spawn_server(
    fs: MockFs,
    config: ServerConfig,
) -> (
    (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
    JoinHandle<netfs::Result<()>>,
) {
    let (client_side, (reader, writer)) = duplex_pair();
    let server = Server::with_config(fs, config);
    let handle = tokio::spawn(async move { server.serve_stream(reader, writer).await });
    (client_side, handle)
}

/// A client connected to a fresh session serving `fs`.
pub async fn connect(fs: &MockFs) -> (Client, JoinHandle<netfs::Result<()>>) {
    connect_with(fs, ServerConfig::default()).await
}

pub async fn connect_with(
    fs: &MockFs,
    config: ServerConfig,
) -> (Client, JoinHandle<netfs::Result<()>>) {
    let ((reader, writer), handle) = spawn_server(fs.clone(), config);
    let client = Client::connect(reader, writer, ClientConfig::default())
        .await
        .unwrap();
    (client, handle)
}

/// A bare connection, past the handshake, for speaking frames directly.
pub async fn connect_raw(fs: &MockFs) -> (RawConnection, JoinHandle<netfs::Result<()>>) {
    let ((reader, writer), handle) = spawn_server(fs.clone(), ServerConfig::default());
    let mut conn = Connection::new(reader, writer);
    conn.handshake().await.unwrap();
    (conn, handle)
}
