use {
    async_trait::async_trait,
    clap::Parser,
    filetime::FileTime,
    log::{debug, info},
    netfs::{
        fs::{File, Filesystem, FsResult},
        srv::Server,
        *,
    },
    std::{
        fs::Permissions,
        io::SeekFrom,
        os::unix::fs::{FileExt, PermissionsExt},
        path::PathBuf,
        time::{Duration, SystemTime},
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

mod utils;
use crate::utils::*;

// Permission bits of files made by `create`, before the umask.
const CREATE_PERM: u32 = 0o666;

/// An open file or directory under the exported tree.
struct LocalFile {
    name: String,
    path: PathBuf,
    file: fs::File,
    entries: Option<ReadDirStream>,
}

impl LocalFile {
    fn new(name: &str, path: PathBuf, file: fs::File) -> Self {
        LocalFile {
            name: name.to_owned(),
            path,
            file,
            entries: None,
        }
    }

    async fn std_file(&self) -> FsResult<std::fs::File> {
        let file = self.file.try_clone().await?;
        Ok(file.into_std().await)
    }

    // Directory cursor shared by readdir and readdirnames: a limit returns at
    // most that many entries and EOF once nothing is left, no limit drains it.
    async fn next_entries(&mut self, limit: Option<usize>) -> Partial<Vec<FileInfo>> {
        if self.entries.is_none() {
            match fs::read_dir(&self.path).await {
                Ok(dir) => self.entries = Some(ReadDirStream::new(dir)),
                Err(e) => return path_error("readdir", &self.name, e).into(),
            }
        }

        let mut infos = Vec::new();
        let Some(entries) = self.entries.as_mut() else {
            return Partial::ok(infos);
        };

        while limit.map_or(true, |n| infos.len() < n) {
            let entry = match entries.next().await {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => return Partial::with_error(infos, e.into()),
                None => break,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(attr) => infos.push(FileInfo::from_metadata(name, &attr)),
                // Vanished between listing and stat
                Err(_) => continue,
            }
        }

        if limit.is_some() && infos.is_empty() {
            Partial::with_error(infos, FsError::Eof)
        } else {
            Partial::ok(infos)
        }
    }
}

#[async_trait]
impl File for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chmod(&mut self, mode: FileMode) -> FsResult<()> {
        self.file
            .set_permissions(Permissions::from_mode(mode.to_unix()))
            .await
            .map_err(|e| path_error("chmod", &self.name, e))
    }

    async fn close(&mut self) -> FsResult<()> {
        self.entries = None;
        self.file
            .flush()
            .await
            .map_err(|e| path_error("close", &self.name, e))
    }

    async fn read(&mut self, buf: &mut [u8]) -> Partial<usize> {
        match self.file.read(buf).await {
            Ok(0) if !buf.is_empty() => Partial::with_error(0, FsError::Eof),
            Ok(n) => Partial::ok(n),
            Err(e) => path_error("read", &self.name, e).into(),
        }
    }

    async fn read_at(&mut self, buf: &mut [u8], off: i64) -> Partial<usize> {
        let start = match offset(off) {
            Ok(start) => start,
            Err(e) => return e.into(),
        };
        let file = match self.std_file().await {
            Ok(file) => file,
            Err(e) => return e.into(),
        };

        let len = buf.len();
        let res = tokio::task::spawn_blocking(move || {
            let mut data = vec![0; len];
            let mut filled = 0;
            while filled < len {
                match file.read_at(&mut data[filled..], start + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return (data, filled, Some(e)),
                }
            }
            (data, filled, None)
        })
        .await;

        match res {
            Ok((data, filled, error)) => {
                buf[..filled].copy_from_slice(&data[..filled]);
                match error {
                    Some(e) => Partial::with_error(filled, path_error("read", &self.name, e)),
                    None if filled < len => Partial::with_error(filled, FsError::Eof),
                    None => Partial::ok(filled),
                }
            }
            Err(e) => FsError::msg(e.to_string()).into(),
        }
    }

    async fn readdir(&mut self, limit: Option<usize>) -> Partial<Vec<FileInfo>> {
        self.next_entries(limit).await
    }

    async fn readdirnames(&mut self, limit: Option<usize>) -> Partial<Vec<String>> {
        let res = self.next_entries(limit).await;
        Partial {
            value: res.value.into_iter().map(|info| info.name).collect(),
            error: res.error,
        }
    }

    async fn seek(&mut self, pos: SeekFrom) -> FsResult<u64> {
        self.file
            .seek(pos)
            .await
            .map_err(|e| path_error("seek", &self.name, e))
    }

    async fn stat(&mut self) -> FsResult<FileInfo> {
        let attr = self
            .file
            .metadata()
            .await
            .map_err(|e| path_error("stat", &self.name, e))?;
        Ok(info_from(&self.name, &attr))
    }

    async fn sync(&mut self) -> FsResult<()> {
        self.file
            .sync_all()
            .await
            .map_err(|e| path_error("sync", &self.name, e))
    }

    async fn truncate(&mut self, size: i64) -> FsResult<()> {
        self.file
            .set_len(offset(size)?)
            .await
            .map_err(|e| path_error("truncate", &self.name, e))
    }

    async fn write(&mut self, data: &[u8]) -> Partial<usize> {
        let res = match self.file.write_all(data).await {
            Ok(()) => self.file.flush().await,
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => Partial::ok(data.len()),
            Err(e) => path_error("write", &self.name, e).into(),
        }
    }

    async fn write_at(&mut self, data: &[u8], off: i64) -> Partial<usize> {
        let start = match offset(off) {
            Ok(start) => start,
            Err(e) => return e.into(),
        };
        let file = match self.std_file().await {
            Ok(file) => file,
            Err(e) => return e.into(),
        };

        let data = data.to_vec();
        let len = data.len();
        match tokio::task::spawn_blocking(move || file.write_all_at(&data, start)).await {
            Ok(Ok(())) => Partial::ok(len),
            Ok(Err(e)) => path_error("write", &self.name, e).into(),
            Err(e) => FsError::msg(e.to_string()).into(),
        }
    }
}

/// Filesystem serving the tree below `root`.
#[derive(Clone)]
struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    async fn open_with(
        &self,
        op: &str,
        name: &str,
        options: &fs::OpenOptions,
    ) -> FsResult<LocalFile> {
        let path = resolve(&self.root, name)?;
        debug!("{} {} -> {}", op, name, path.display());
        let file = options
            .open(&path)
            .await
            .map_err(|e| path_error(op, name, e))?;
        Ok(LocalFile::new(name, path, file))
    }
}

#[async_trait]
impl Filesystem for LocalFs {
    type File = LocalFile;

    async fn chmod(&self, name: &str, mode: FileMode) -> FsResult<()> {
        let path = resolve(&self.root, name)?;
        fs::set_permissions(&path, Permissions::from_mode(mode.to_unix()))
            .await
            .map_err(|e| path_error("chmod", name, e))
    }

    async fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let path = resolve(&self.root, name)?;
        let atime = FileTime::from_system_time(atime);
        let mtime = FileTime::from_system_time(mtime);

        tokio::task::spawn_blocking(move || filetime::set_file_times(path, atime, mtime))
            .await
            .map_err(|e| FsError::msg(e.to_string()))?
            .map_err(|e| path_error("chtimes", name, e))
    }

    async fn mkdir(&self, name: &str, perm: FileMode) -> FsResult<()> {
        let path = resolve(&self.root, name)?;
        fs::DirBuilder::new()
            .mode(perm.perm())
            .create(&path)
            .await
            .map_err(|e| path_error("mkdir", name, e))
    }

    async fn mkdir_all(&self, path: &str, perm: FileMode) -> FsResult<()> {
        let realpath = resolve(&self.root, path)?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(perm.perm())
            .create(&realpath)
            .await
            .map_err(|e| path_error("mkdir", path, e))
    }

    async fn remove(&self, name: &str) -> FsResult<()> {
        let path = resolve(&self.root, name)?;
        let res = match fs::symlink_metadata(&path).await {
            Ok(ref attr) if attr.is_dir() => fs::remove_dir(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        res.map_err(|e| path_error("remove", name, e))
    }

    async fn remove_all(&self, path: &str) -> FsResult<()> {
        let realpath = resolve(&self.root, path)?;
        let res = match fs::symlink_metadata(&realpath).await {
            Ok(ref attr) if attr.is_dir() => fs::remove_dir_all(&realpath).await,
            Ok(_) => fs::remove_file(&realpath).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        res.map_err(|e| path_error("removeall", path, e))
    }

    async fn rename(&self, oldpath: &str, newpath: &str) -> FsResult<()> {
        let from = resolve(&self.root, oldpath)?;
        let to = resolve(&self.root, newpath)?;
        fs::rename(&from, &to)
            .await
            .map_err(|e| path_error("rename", oldpath, e))
    }

    async fn truncate(&self, name: &str, size: i64) -> FsResult<()> {
        let size = offset(size)?;
        let file = self
            .open_with("truncate", name, fs::OpenOptions::new().write(true))
            .await?;
        file.file
            .set_len(size)
            .await
            .map_err(|e| path_error("truncate", name, e))
    }

    async fn create(&self, name: &str) -> FsResult<LocalFile> {
        let mut options = fs::OpenOptions::new();
        options
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CREATE_PERM);
        self.open_with("open", name, &options).await
    }

    async fn open(&self, name: &str) -> FsResult<LocalFile> {
        self.open_with("open", name, fs::OpenOptions::new().read(true))
            .await
    }

    async fn open_file(&self, name: &str, flags: OpenFlags, perm: FileMode) -> FsResult<LocalFile> {
        let mut options = fs::OpenOptions::new();
        options
            .read(flags.readable())
            .write(flags.writable())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .mode(perm.perm());

        if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
            options.create_new(true);
        } else if flags.contains(OpenFlags::CREATE) {
            options.create(true);
        }
        if flags.contains(OpenFlags::SYNC) {
            options.custom_flags(nix::libc::O_SYNC);
        }

        self.open_with("open", name, &options).await
    }

    async fn lstat(&self, name: &str) -> FsResult<FileInfo> {
        let path = resolve(&self.root, name)?;
        let attr = fs::symlink_metadata(&path)
            .await
            .map_err(|e| path_error("lstat", name, e))?;
        Ok(info_from(name, &attr))
    }

    async fn stat(&self, name: &str) -> FsResult<FileInfo> {
        let path = resolve(&self.root, name)?;
        let attr = fs::metadata(&path)
            .await
            .map_err(|e| path_error("stat", name, e))?;
        Ok(info_from(name, &attr))
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Seconds a connection may stay idle before it is dropped
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,
}

async fn netfsd_main(
    Cli {
        address,
        exportdir,
        idle_timeout,
    }: Cli,
) -> netfs::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export path must be a directory"));
    }

    let config = ServerConfig::new().idle_timeout(Duration::from_secs(idle_timeout));
    info!("idle timeout: {:?}", config.idle_timeout);
    println!("[*] Exporting: {}", exportdir.display());
    println!("[*] Ready to accept clients: {}", address);

    Server::with_config(LocalFs { root: exportdir }, config)
        .serve(&address)
        .await
        .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = netfsd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn export() -> (TempDir, LocalFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs {
            root: dir.path().to_path_buf(),
        };
        (dir, fs)
    }

    #[tokio::test]
    async fn create_write_and_read_back() {
        let (dir, fs) = export();

        let mut file = fs.create("test_a").await.unwrap();
        assert_eq!(file.write(b"te").await.into_result(), Ok(2));
        assert_eq!(file.write(b"st").await.into_result(), Ok(2));
        file.close().await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("test_a")).unwrap(), b"test");

        let mut file = fs.open("/test_a").await.unwrap();
        let mut buf = [0u8; 4];
        let res = file.read_at(&mut buf, 1).await;
        assert_eq!(res.value, 3);
        assert!(res.is_eof());
        assert_eq!(&buf[..3], b"est");

        assert_eq!(file.read(&mut buf).await.into_result(), Ok(4));
        let res = file.read(&mut buf).await;
        assert_eq!(res.value, 0);
        assert!(res.is_eof());
    }

    #[tokio::test]
    async fn positional_writes_and_seek() {
        let (dir, fs) = export();
        let mut file = fs
            .open_file(
                "f",
                OpenFlags::RDWR | OpenFlags::CREATE,
                FileMode::from_perm(0o600),
            )
            .await
            .unwrap();

        assert_eq!(file.write_at(b"world", 6).await.into_result(), Ok(5));
        assert_eq!(file.write_at(b"hello ", 0).await.into_result(), Ok(6));
        assert_eq!(file.seek(SeekFrom::End(-5)).await.unwrap(), 6);
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).await.into_result(), Ok(5));
        assert_eq!(&buf, b"world");

        file.truncate(5).await.unwrap();
        assert_eq!(file.stat().await.unwrap().size, 5);
        file.close().await.unwrap();

        let attr = std::fs::metadata(dir.path().join("f")).unwrap();
        assert_eq!(attr.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn exclusive_create_fails_on_existing_files() {
        let (_dir, fs) = export();
        let flags = OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::EXCL;
        let perm = FileMode::from_perm(0o644);

        fs.open_file("once", flags, perm).await.unwrap();
        assert!(fs.open_file("once", flags, perm).await.is_err());
        assert!(fs.open("missing").await.is_err());
    }

    #[tokio::test]
    async fn directory_cursor() {
        let (dir, fs) = export();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }

        let mut root = fs.open("").await.unwrap();
        let first = root.readdir(Some(2)).await;
        assert_eq!(first.error, None);
        assert_eq!(first.value.len(), 2);

        let rest = root.readdirnames(Some(2)).await;
        assert_eq!(rest.value.len(), 1);

        let done = root.readdir(Some(2)).await;
        assert!(done.value.is_empty());
        assert!(done.is_eof());

        let mut again = fs.open("/").await.unwrap();
        let mut names = again.readdirnames(None).await.into_result().unwrap();
        names.sort();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(again.readdir(None).await.into_result(), Ok(Vec::new()));
    }

    #[tokio::test]
    async fn metadata_and_times() {
        let (dir, fs) = export();
        fs.mkdir_all("x/y", FileMode::from_perm(0o755)).await.unwrap();
        fs.mkdir("x/y/z", FileMode::from_perm(0o700)).await.unwrap();
        assert!(fs.mkdir("x/y/z", FileMode::from_perm(0o700)).await.is_err());

        let info = fs.stat("x/y/z").await.unwrap();
        assert_eq!(info.name, "z");
        assert!(info.is_dir());
        assert_eq!(info.mode.perm(), 0o700);

        std::fs::write(dir.path().join("x/file"), b"12345").unwrap();
        fs.chmod("x/file", FileMode::from_perm(0o640)).await.unwrap();
        let t = at_secs(1429348849);
        fs.chtimes("x/file", t, t).await.unwrap();

        let info = fs.lstat("x/file").await.unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.mode.perm(), 0o640);
        assert_eq!(info.modified, t);

        fs.truncate("x/file", 2).await.unwrap();
        assert_eq!(fs.stat("x/file").await.unwrap().size, 2);
    }

    fn at_secs(secs: u64) -> SystemTime {
        std::time::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn removal_and_rename() {
        let (dir, fs) = export();
        fs.mkdir_all("tree/leaf", FileMode::from_perm(0o755)).await.unwrap();
        std::fs::write(dir.path().join("tree/leaf/f"), b"x").unwrap();

        assert!(fs.remove("tree").await.is_err());
        fs.rename("tree/leaf/f", "moved").await.unwrap();
        assert!(dir.path().join("moved").exists());

        fs.remove("moved").await.unwrap();
        fs.remove_all("tree").await.unwrap();
        assert!(!dir.path().join("tree").exists());
        fs.remove_all("never-existed").await.unwrap();

        let err = fs.remove("moved").await.unwrap_err();
        assert!(err.to_string().starts_with("remove moved: "));
    }

    #[tokio::test]
    async fn names_cannot_escape_the_export() {
        let (_dir, fs) = export();
        assert!(fs.stat("../").await.is_err());
        assert!(fs.create("a/../../evil").await.is_err());
        assert!(fs.remove_all("..").await.is_err());
    }

    #[tokio::test]
    async fn served_over_the_wire() {
        let (dir, fs) = export();
        let server = Server::new(fs);

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (sr, sw) = tokio::io::split(b);
        let session = tokio::spawn(async move { server.serve_stream(sr, sw).await });

        let (cr, cw) = tokio::io::split(a);
        let client = Client::connect(cr, cw, ClientConfig::default())
            .await
            .unwrap();

        client.mkdir("docs", FileMode::from_perm(0o755)).await.unwrap();
        let file = client.create("docs/readme").await.unwrap();
        file.write_str("netfs").await.unwrap().into_result().unwrap();
        file.close().await.unwrap();

        let info = client.stat("docs/readme").await.unwrap();
        assert_eq!(info.size, 5);

        let err = client.open("docs/missing").await.unwrap_err();
        assert!(matches!(err, Error::Remote(FsError::Message(_))));

        let file = client.open("docs/readme").await.unwrap();
        let mut buf = [0u8; 8];
        let res = file.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..res.value], b"netfs");

        client.close().await.unwrap();
        session.await.unwrap().unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("docs/readme")).unwrap(),
            b"netfs"
        );
    }
}
