//! Client side of the protocol.
//!
//! A [`Client`] mirrors the [`Filesystem`](crate::fs::Filesystem)
//! capability set and hands out [`RemoteFile`] handles mirroring
//! [`File`](crate::fs::File). Clones of a client and all of its file handles
//! share one connection; whole round trips are serialized behind a mutex so
//! at most one request is ever in flight.
//!
//! Errors reported by the remote filesystem come back as [`Error::Remote`]
//! and leave the connection usable. Any other failure breaks the connection
//! and every later call returns [`Error::Disconnected`].

use {
    crate::{
        config::ClientConfig,
        conn::{BoxedConnection, Connection},
        error::{Error, FsError, Partial},
        fcall::*,
        io_err, res,
        utils::{Address, Result},
    },
    log::debug,
    std::{fmt, io::SeekFrom, sync::Arc, time::SystemTime},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::Mutex,
    },
};

fn check(error: Option<FsError>) -> Result<()> {
    match error {
        None => Ok(()),
        Some(e) => Err(Error::Remote(e)),
    }
}

fn unexpected(call: FCall) -> Error {
    Error::protocol(format!("Unexpected response: {:?}", call.opcode()))
}

fn check_size(len: usize) -> Result<u32> {
    match u32::try_from(len) {
        Ok(n) if n <= MAX_DATA_SIZE => Ok(n),
        _ => res!(io_err!(
            InvalidInput,
            format!("Buffer of {} bytes exceeds limit {}", len, MAX_DATA_SIZE)
        )),
    }
}

fn readdir_count(limit: Option<usize>) -> i32 {
    match limit {
        Some(n) => i32::try_from(n).unwrap_or(i32::MAX),
        None => 0,
    }
}

struct Link {
    conn: BoxedConnection,
    // Set while a round trip is underway and left set when it fails, so an
    // interrupted or failed exchange can never be resumed half way.
    broken: bool,
}

impl Link {
    async fn exchange(&mut self, request: FCall, config: &ClientConfig) -> Result<FCall> {
        let op = request
            .opcode()
            .ok_or_else(|| Error::protocol("Handshake record sent as a request"))?;
        if self.broken {
            return Err(Error::Disconnected);
        }

        self.broken = true;
        self.conn.set_deadline(config.action_timeout);
        self.conn.request(request).await?;
        let response = self.conn.await_response(op).await?;
        self.broken = false;

        Ok(response)
    }
}

/// Connection to a netfs server.
#[derive(Clone)]
pub struct Client {
    link: Arc<Mutex<Link>>,
    config: ClientConfig,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish()
    }
}

impl Client {
    /// Dial `addr` (`tcp!host!port`, `unix!path!0` or `host:port`) with the
    /// default configuration.
    pub async fn dial(addr: &str) -> Result<Client> {
        Self::dial_with(addr, ClientConfig::default()).await
    }

    pub async fn dial_with(addr: &str, config: ClientConfig) -> Result<Client> {
        let timeout = config.action_timeout;
        let connect = async {
            match Address::parse(addr)? {
                Address::Tcp(hostport) => {
                    let stream = TcpStream::connect(&hostport).await?;
                    stream.set_nodelay(true)?;
                    let (readhalf, writehalf) = stream.into_split();
                    Self::connect(readhalf, writehalf, config).await
                }
                Address::Unix(path) => {
                    let stream = UnixStream::connect(&path).await?;
                    let (readhalf, writehalf) = stream.into_split();
                    Self::connect(readhalf, writehalf, config).await
                }
            }
        };

        let client = match tokio::time::timeout(timeout, connect).await {
            Ok(res) => res?,
            Err(_) => return res!(io_err!(TimedOut, format!("Dialing {} timed out", addr))),
        };
        debug!("connected: {}", addr);
        Ok(client)
    }

    /// Run the handshake over an already established stream.
    pub async fn connect<R, W>(reader: R, writer: W, config: ClientConfig) -> Result<Client>
    where
        R: 'static + AsyncRead + Send + Unpin,
        W: 'static + AsyncWrite + Send + Unpin,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let mut conn = Connection::with_capacity(
            reader,
            writer,
            config.read_buffer_size,
            config.write_buffer_size,
        );

        conn.set_deadline(config.action_timeout);
        conn.handshake().await?;

        Ok(Client {
            link: Arc::new(Mutex::new(Link {
                conn,
                broken: false,
            })),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Round trip `request` and interpret the response while the link is
    /// still held. A response that only turns out malformed here breaks the
    /// link like any other protocol failure.
    async fn call<T, F>(&self, request: FCall, interpret: F) -> Result<T>
    where
        F: FnOnce(FCall) -> Result<T>,
    {
        let mut link = self.link.lock().await;
        let res = link.exchange(request, &self.config).await.and_then(interpret);
        if matches!(res, Err(Error::Protocol(_))) {
            link.broken = true;
        }
        res
    }

    async fn open_handle(&self, request: FCall, name: &str) -> Result<RemoteFile> {
        self.call(request, |response| match response {
            FCall::RCreate { fid, error }
            | FCall::ROpen { fid, error }
            | FCall::ROpenFile { fid, error } => {
                check(error)?;
                if fid == NOFID {
                    return Err(Error::protocol("Server opened a file without a fid"));
                }
                Ok(RemoteFile {
                    client: self.clone(),
                    fid,
                    name: name.to_owned(),
                })
            }
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Round trip the ping opcode.
    pub async fn ping(&self) -> Result<()> {
        self.call(FCall::TPing, |response| match response {
            FCall::RPing => Ok(()),
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Tell the server to end the session and shut the stream down.
    ///
    /// No acknowledgement is awaited. Every later call on this client, its
    /// clones or its files fails with [`Error::Disconnected`].
    pub async fn close(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.broken {
            return Err(Error::Disconnected);
        }

        link.broken = true;
        link.conn.set_deadline(self.config.action_timeout);
        link.conn.request(FCall::TClose).await?;
        link.conn.close().await
    }

    pub async fn chmod(&self, name: &str, mode: FileMode) -> Result<()> {
        let request = FCall::TChmod {
            name: name.to_owned(),
            mode,
        };
        self.call(request, |response| match response {
            FCall::RChmod { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Change access and modification times, kept at second precision.
    pub async fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let request = FCall::TChtimes {
            name: name.to_owned(),
            atime,
            mtime,
        };
        self.call(request, |response| match response {
            FCall::RChtimes { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn mkdir(&self, name: &str, perm: FileMode) -> Result<()> {
        let request = FCall::TMkdir {
            name: name.to_owned(),
            perm,
        };
        self.call(request, |response| match response {
            FCall::RMkdir { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn mkdir_all(&self, path: &str, perm: FileMode) -> Result<()> {
        let request = FCall::TMkdirAll {
            path: path.to_owned(),
            perm,
        };
        self.call(request, |response| match response {
            FCall::RMkdirAll { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let request = FCall::TRemove {
            name: name.to_owned(),
        };
        self.call(request, |response| match response {
            FCall::RRemove { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn remove_all(&self, path: &str) -> Result<()> {
        let request = FCall::TRemoveAll {
            path: path.to_owned(),
        };
        self.call(request, |response| match response {
            FCall::RRemoveAll { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        let request = FCall::TRename {
            oldpath: oldpath.to_owned(),
            newpath: newpath.to_owned(),
        };
        self.call(request, |response| match response {
            FCall::RRename { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn truncate(&self, name: &str, size: i64) -> Result<()> {
        let request = FCall::TTruncate {
            name: name.to_owned(),
            size,
        };
        self.call(request, |response| match response {
            FCall::RTruncate { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn create(&self, name: &str) -> Result<RemoteFile> {
        let request = FCall::TCreate {
            name: name.to_owned(),
        };
        self.open_handle(request, name).await
    }

    pub async fn open(&self, name: &str) -> Result<RemoteFile> {
        let request = FCall::TOpen {
            name: name.to_owned(),
        };
        self.open_handle(request, name).await
    }

    pub async fn open_file(
        &self,
        name: &str,
        flags: OpenFlags,
        perm: FileMode,
    ) -> Result<RemoteFile> {
        let request = FCall::TOpenFile {
            name: name.to_owned(),
            flags,
            perm,
        };
        self.open_handle(request, name).await
    }

    pub async fn lstat(&self, name: &str) -> Result<FileInfo> {
        let request = FCall::TLstat {
            name: name.to_owned(),
        };
        self.call(request, |response| match response {
            FCall::RLstat { info, error } => check(error).and(Ok(info)),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn stat(&self, name: &str) -> Result<FileInfo> {
        let request = FCall::TStat {
            name: name.to_owned(),
        };
        self.call(request, |response| match response {
            FCall::RStat { info, error } => check(error).and(Ok(info)),
            other => Err(unexpected(other)),
        })
        .await
    }
}

/// A file opened through a [`Client`], addressed on the server by its fid.
pub struct RemoteFile {
    client: Client,
    fid: u32,
    name: String,
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("fid", &self.fid)
            .field("name", &self.name)
            .finish()
    }
}

impl RemoteFile {
    /// Name the file was opened with
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub async fn chmod(&self, mode: FileMode) -> Result<()> {
        let request = FCall::TFileChmod {
            fid: self.fid,
            mode,
        };
        self.client.call(request, |response| match response {
            FCall::RFileChmod { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Close the file on the server. The fid is released even when the
    /// server reports an error.
    pub async fn close(self) -> Result<()> {
        let request = FCall::TFileClose { fid: self.fid };
        self.client.call(request, |response| match response {
            FCall::RFileClose { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Read up to `buf.len()` bytes from the current offset.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Partial<usize>> {
        let request = FCall::TFileRead {
            fid: self.fid,
            count: check_size(buf.len())?,
        };
        self.client.call(request, |response| match response {
            FCall::RFileRead { data, error } => fill(buf, data, error),
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Read up to `buf.len()` bytes at `offset`; a short read is reported
    /// with `FsError::Eof` next to the bytes that were read.
    pub async fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<Partial<usize>> {
        let request = FCall::TFileReadAt {
            fid: self.fid,
            count: check_size(buf.len())?,
            offset,
        };
        self.client.call(request, |response| match response {
            FCall::RFileReadAt { data, error } => fill(buf, data, error),
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Next directory entries. `Some(n)` asks for at most `n` entries and
    /// gets `FsError::Eof` once the directory is exhausted; `None` (or
    /// `Some(0)`) asks for everything that remains.
    pub async fn readdir(&self, limit: Option<usize>) -> Result<Partial<Vec<FileInfo>>> {
        let request = FCall::TFileReaddir {
            fid: self.fid,
            n: readdir_count(limit),
        };
        self.client.call(request, |response| match response {
            FCall::RFileReaddir { entries, error } => Ok(Partial {
                value: entries,
                error,
            }),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn readdirnames(&self, limit: Option<usize>) -> Result<Partial<Vec<String>>> {
        let request = FCall::TFileReaddirnames {
            fid: self.fid,
            n: readdir_count(limit),
        };
        self.client.call(request, |response| match response {
            FCall::RFileReaddirnames { names, error } => Ok(Partial {
                value: names,
                error,
            }),
            other => Err(unexpected(other)),
        })
        .await
    }

    /// Move the file offset; returns the new offset from the start.
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(off) => match i64::try_from(off) {
                Ok(off) => (off, 0),
                Err(_) => return res!(io_err!(InvalidInput, "Seek offset out of range")),
            },
            SeekFrom::Current(off) => (off, 1),
            SeekFrom::End(off) => (off, 2),
        };

        let request = FCall::TFileSeek {
            fid: self.fid,
            offset,
            whence,
        };
        self.client.call(request, |response| match response {
            FCall::RFileSeek { offset, error } => {
                check(error)?;
                u64::try_from(offset)
                    .map_err(|_| Error::protocol(format!("Negative file offset {}", offset)))
            }
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn stat(&self) -> Result<FileInfo> {
        let request = FCall::TFileStat { fid: self.fid };
        self.client.call(request, |response| match response {
            FCall::RFileStat { info, error } => check(error).and(Ok(info)),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn sync(&self) -> Result<()> {
        let request = FCall::TFileSync { fid: self.fid };
        self.client.call(request, |response| match response {
            FCall::RFileSync { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn truncate(&self, size: i64) -> Result<()> {
        let request = FCall::TFileTruncate {
            fid: self.fid,
            size,
        };
        self.client.call(request, |response| match response {
            FCall::RFileTruncate { error } => check(error),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn write(&self, data: &[u8]) -> Result<Partial<usize>> {
        check_size(data.len())?;
        let request = FCall::TFileWrite {
            fid: self.fid,
            data: Data(data.to_vec()),
        };
        self.client.call(request, |response| match response {
            FCall::RFileWrite { count, error } => Ok(Partial {
                value: count as usize,
                error,
            }),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn write_at(&self, data: &[u8], offset: i64) -> Result<Partial<usize>> {
        check_size(data.len())?;
        let request = FCall::TFileWriteAt {
            fid: self.fid,
            data: Data(data.to_vec()),
            offset,
        };
        self.client.call(request, |response| match response {
            FCall::RFileWriteAt { count, error } => Ok(Partial {
                value: count as usize,
                error,
            }),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn write_str(&self, s: &str) -> Result<Partial<usize>> {
        self.write(s.as_bytes()).await
    }
}

fn fill(buf: &mut [u8], data: Data, error: Option<FsError>) -> Result<Partial<usize>> {
    let n = data.0.len();
    if n > buf.len() {
        return Err(Error::protocol(format!(
            "Server returned {} bytes for a {} byte buffer",
            n,
            buf.len()
        )));
    }
    buf[..n].copy_from_slice(&data.0);
    Ok(Partial { value: n, error })
}
