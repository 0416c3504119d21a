//! Asynchronous server side netfs library.
//!
//! # Protocol
//! netfs version 1

use {
    crate::{
        config::ServerConfig,
        conn::Connection,
        error::{Error, FsError},
        fcall::*,
        fs::{File, Filesystem, FsResult},
        utils::{Address, Result},
    },
    log::{debug, error, info, warn},
    socket2::{SockRef, TcpKeepalive},
    std::{
        collections::HashMap,
        io::SeekFrom,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, TcpStream, UnixListener},
    },
};

fn unknown_fid(fid: u32) -> Error {
    Error::protocol(format!("Unknown fid: {}", fid))
}

/// Open files of one session, keyed by fid.
///
/// Fids start at 1, grow strictly and are never reused; once the `u32`
/// range is spent no further file can be registered.
#[derive(Debug)]
pub struct FidTable<F> {
    next: u32,
    files: HashMap<u32, F>,
}

impl<F> Default for FidTable<F> {
    fn default() -> Self {
        FidTable {
            next: NOFID + 1,
            files: HashMap::new(),
        }
    }
}

impl<F> FidTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file under the next fid, handing it back when the fid
    /// space is exhausted.
    pub fn insert(&mut self, file: F) -> ::std::result::Result<u32, F> {
        if self.next == NOFID {
            return Err(file);
        }

        let fid = self.next;
        self.next = self.next.wrapping_add(1);
        self.files.insert(fid, file);
        Ok(fid)
    }

    /// Look a fid up; a missing fid is a protocol violation.
    pub fn get_mut(&mut self, fid: u32) -> Result<&mut F> {
        self.files.get_mut(&fid).ok_or_else(|| unknown_fid(fid))
    }

    pub fn remove(&mut self, fid: u32) -> Option<F> {
        self.files.remove(&fid)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u32, F)> + '_ {
        self.files.drain()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<F: File> FidTable<F> {
    async fn register(&mut self, opened: FsResult<F>) -> (u32, Option<FsError>) {
        let file = match opened {
            Ok(file) => file,
            Err(e) => return (NOFID, Some(e)),
        };

        match self.insert(file) {
            Ok(fid) => (fid, None),
            Err(mut file) => {
                if let Err(e) = file.close().await {
                    debug!("closing unregistered {} failed: {}", file.name(), e);
                }
                (NOFID, Some(FsError::msg("too many open files on this connection")))
            }
        }
    }
}

fn split_info(res: FsResult<FileInfo>) -> (FileInfo, Option<FsError>) {
    match res {
        Ok(info) => (info, None),
        Err(e) => (FileInfo::default(), Some(e)),
    }
}

fn seek_from(offset: i64, whence: i16) -> FsResult<SeekFrom> {
    match whence {
        0 => u64::try_from(offset)
            .map(SeekFrom::Start)
            .map_err(|_| FsError::msg(format!("invalid seek offset {}", offset))),
        1 => Ok(SeekFrom::Current(offset)),
        2 => Ok(SeekFrom::End(offset)),
        _ => Err(FsError::msg(format!("invalid whence {}", whence))),
    }
}

fn wire_offset(pos: u64) -> FsResult<i64> {
    i64::try_from(pos).map_err(|_| FsError::msg(format!("file offset {} out of range", pos)))
}

fn read_buffer(count: u32) -> Result<Vec<u8>> {
    if count > MAX_DATA_SIZE {
        return Err(Error::protocol(format!(
            "Read count {} exceeds limit {}",
            count, MAX_DATA_SIZE
        )));
    }
    Ok(vec![0; count as usize])
}

fn readdir_limit(n: i32) -> Option<usize> {
    if n > 0 { Some(n as usize) } else { None }
}

// Options applied to every accepted TCP connection.
fn tune_tcp(stream: &TcpStream, config: &ServerConfig) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    if let Some(period) = config.tcp_keepalive {
        let keepalive = TcpKeepalive::new().with_time(period).with_interval(period);
        sock.set_tcp_keepalive(&keepalive)?;
    }
    sock.set_linger(config.tcp_linger)
}

/// Server side of one connection.
///
/// A session answers requests strictly one after another until the client
/// sends the close opcode, stays idle past the idle deadline or breaks the
/// protocol. Whatever the reason, every file still open is closed when the
/// session ends.
pub struct Session<Fs: Filesystem, R, W> {
    fs: Arc<Fs>,
    conn: Connection<R, W>,
    fids: FidTable<Fs::File>,
    idle_timeout: Duration,
}

impl<Fs, R, W> Session<Fs, R, W>
where
    Fs: Filesystem,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(fs: Arc<Fs>, reader: R, writer: W, config: &ServerConfig) -> Self {
        Session {
            fs,
            conn: Connection::with_capacity(
                reader,
                writer,
                config.read_buffer_size,
                config.write_buffer_size,
            ),
            fids: FidTable::new(),
            idle_timeout: config.idle_timeout,
        }
    }

    /// Serve until the session ends, then release its files and stream.
    pub async fn run(mut self) -> Result<()> {
        let res = self.serve().await;
        self.shutdown().await;
        res
    }

    async fn serve(&mut self) -> Result<()> {
        self.conn.set_deadline(self.idle_timeout);
        self.conn.handshake().await?;

        loop {
            self.conn.set_deadline(self.idle_timeout);
            let request = self.conn.await_request().await?;
            debug!("\t← {:?}", request.opcode());

            if request == FCall::TClose {
                return Ok(());
            }

            let response = self.dispatch(request).await?;
            debug!("\t→ {:?} {:?}", response.opcode(), response.error());

            self.conn.set_deadline(self.idle_timeout);
            self.conn.respond(response).await?;
            self.conn.flush().await?;
        }
    }

    async fn shutdown(&mut self) {
        let files: Vec<_> = self.fids.drain().collect();
        for (fid, mut file) in files {
            if let Err(e) = file.close().await {
                debug!("closing fid {} ({}) failed: {}", fid, file.name(), e);
            }
        }

        if let Err(e) = self.conn.close().await {
            debug!("closing connection failed: {}", e);
        }
    }

    #[rustfmt::skip]
    async fn dispatch(&mut self, request: FCall) -> Result<FCall> {
        use crate::FCall::*;

        let Session { fs, fids, .. } = self;
        let fs = &**fs;

        let response = match request {
            TPing                                   => RPing,

            /*
             * Filesystem
             */
            TChmod { ref name, mode }               => RChmod { error: fs.chmod(name, mode).await.err() },
            TChtimes { ref name, atime, mtime }     => RChtimes { error: fs.chtimes(name, atime, mtime).await.err() },
            TMkdir { ref name, perm }               => RMkdir { error: fs.mkdir(name, perm).await.err() },
            TMkdirAll { ref path, perm }            => RMkdirAll { error: fs.mkdir_all(path, perm).await.err() },
            TRemove { ref name }                    => RRemove { error: fs.remove(name).await.err() },
            TRemoveAll { ref path }                 => RRemoveAll { error: fs.remove_all(path).await.err() },
            TRename { ref oldpath, ref newpath }    => RRename { error: fs.rename(oldpath, newpath).await.err() },
            TTruncate { ref name, size }            => RTruncate { error: fs.truncate(name, size).await.err() },
            TCreate { ref name } => {
                let (fid, error) = fids.register(fs.create(name).await).await;
                RCreate { fid, error }
            }
            TOpen { ref name } => {
                let (fid, error) = fids.register(fs.open(name).await).await;
                ROpen { fid, error }
            }
            TOpenFile { ref name, flags, perm } => {
                let (fid, error) = fids.register(fs.open_file(name, flags, perm).await).await;
                ROpenFile { fid, error }
            }
            TLstat { ref name } => {
                let (info, error) = split_info(fs.lstat(name).await);
                RLstat { info, error }
            }
            TStat { ref name } => {
                let (info, error) = split_info(fs.stat(name).await);
                RStat { info, error }
            }

            /*
             * Open file
             */
            TFileChmod { fid, mode }                => RFileChmod { error: fids.get_mut(fid)?.chmod(mode).await.err() },
            TFileSync { fid }                       => RFileSync { error: fids.get_mut(fid)?.sync().await.err() },
            TFileTruncate { fid, size }             => RFileTruncate { error: fids.get_mut(fid)?.truncate(size).await.err() },
            TFileClose { fid } => {
                let mut file = fids.remove(fid).ok_or_else(|| unknown_fid(fid))?;
                RFileClose { error: file.close().await.err() }
            }
            TFileRead { fid, count } => {
                let file = fids.get_mut(fid)?;
                let mut buf = read_buffer(count)?;
                let res = file.read(&mut buf).await;
                buf.truncate(res.value.min(count as usize));
                RFileRead { data: Data(buf), error: res.error }
            }
            TFileReadAt { fid, count, offset } => {
                let file = fids.get_mut(fid)?;
                let mut buf = read_buffer(count)?;
                let res = file.read_at(&mut buf, offset).await;
                buf.truncate(res.value.min(count as usize));
                RFileReadAt { data: Data(buf), error: res.error }
            }
            TFileReaddir { fid, n } => {
                let res = fids.get_mut(fid)?.readdir(readdir_limit(n)).await;
                RFileReaddir { entries: res.value, error: res.error }
            }
            TFileReaddirnames { fid, n } => {
                let res = fids.get_mut(fid)?.readdirnames(readdir_limit(n)).await;
                RFileReaddirnames { names: res.value, error: res.error }
            }
            TFileSeek { fid, offset, whence } => {
                let file = fids.get_mut(fid)?;
                let res = match seek_from(offset, whence) {
                    Ok(pos) => file.seek(pos).await.and_then(wire_offset),
                    Err(e) => Err(e),
                };
                match res {
                    Ok(offset) => RFileSeek { offset, error: None },
                    Err(e) => RFileSeek { offset: 0, error: Some(e) },
                }
            }
            TFileStat { fid } => {
                let (info, error) = split_info(fids.get_mut(fid)?.stat().await);
                RFileStat { info, error }
            }
            TFileWrite { fid, ref data } => {
                let res = fids.get_mut(fid)?.write(&data.0).await;
                RFileWrite { count: res.value.min(data.0.len()) as u32, error: res.error }
            }
            TFileWriteAt { fid, ref data, offset } => {
                let res = fids.get_mut(fid)?.write_at(&data.0, offset).await;
                RFileWriteAt { count: res.value.min(data.0.len()) as u32, error: res.error }
            }

            ref other => {
                return Err(Error::protocol(format!(
                    "Unexpected {:?} frame with opcode {:?}",
                    other.kind(),
                    other.opcode()
                )));
            }
        };

        Ok(response)
    }
}

/// Accepts connections and runs one [`Session`] per connection.
pub struct Server<Fs> {
    fs: Arc<Fs>,
    config: ServerConfig,
}

impl<Fs> Server<Fs>
where
    Fs: 'static + Filesystem,
{
    pub fn new(filesystem: Fs) -> Self {
        Self::with_config(filesystem, ServerConfig::default())
    }

    pub fn with_config(filesystem: Fs, config: ServerConfig) -> Self {
        Server {
            fs: Arc::new(filesystem),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Listen on `addr` (`tcp!host!port`, `unix!path!0` or `host:port`).
    pub async fn serve(&self, addr: &str) -> Result<()> {
        match Address::parse(addr)? {
            Address::Tcp(hostport) => {
                let listener = TcpListener::bind(&hostport).await?;
                info!("listening on {}", hostport);
                self.serve_tcp(listener).await
            }
            Address::Unix(path) => self.serve_unix(path).await,
        }
    }

    /// Accept connections on an already bound listener, forever.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            info!("accepted: {:?}", peer);

            if let Err(e) = tune_tcp(&stream, &self.config) {
                warn!("{}: failed to set socket options: {}", peer, e);
            }
            let (readhalf, writehalf) = stream.into_split();
            self.spawn_session(readhalf, writehalf, peer.to_string());
        }
    }

    /// Accept connections on a unix socket until SIGINT or SIGTERM.
    pub async fn serve_unix(&self, path: impl AsRef<Path>) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let listener = DeleteOnDrop::bind(path)?;
        info!("listening on {:?}", listener.path);

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        let peer = format!("{:?}", listener.path);
                        info!("accepted: {}", peer);

                        let (readhalf, writehalf) = stream.into_split();
                        self.spawn_session(readhalf, writehalf, peer);
                    }
                    Err(e) => error!("accept failed: {}", e),
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Run a single session over the given stream halves to completion.
    pub async fn serve_stream<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        Session::new(self.fs.clone(), reader, writer, &self.config)
            .run()
            .await
    }

    fn spawn_session<R, W>(&self, reader: R, writer: W, peer: String)
    where
        R: 'static + AsyncRead + Send + Unpin,
        W: 'static + AsyncWrite + Send + Unpin,
    {
        let session = Session::new(self.fs.clone(), reader, writer, &self.config);
        tokio::spawn(async move {
            match session.run().await {
                Ok(()) => info!("{}: session closed", peer),
                Err(e) => info!("{}: session ended: {}", peer, e),
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// Serve `filesystem` on `addr` with the default configuration.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    Server::new(filesystem).serve(addr).await
}
