use {
    netfs::{FileInfo, FsError, fs::FsResult},
    std::{
        fs::Metadata,
        io,
        path::{Component, Path, PathBuf},
    },
};

/// Map a client supplied name onto the exported tree.
///
/// Absolute names are taken relative to `root`; names climbing out of it
/// with `..` are refused.
pub fn resolve(root: &Path, name: &str) -> FsResult<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(FsError::msg(format!(
                    "{}: path escapes the exported directory",
                    name
                )));
            }
        }
    }
    Ok(path)
}

/// Last component of `name`, as reported in `FileInfo`
pub fn base_name(name: &str) -> String {
    match Path::new(name).file_name() {
        Some(base) => base.to_string_lossy().into_owned(),
        None => ".".to_owned(),
    }
}

pub fn info_from(name: &str, attr: &Metadata) -> FileInfo {
    FileInfo::from_metadata(base_name(name), attr)
}

/// Error naming the failed operation and path
pub fn path_error(op: &str, name: &str, e: io::Error) -> FsError {
    FsError::msg(format!("{} {}: {}", op, name, e))
}

pub fn offset(off: i64) -> FsResult<u64> {
    u64::try_from(off).map_err(|_| FsError::msg(format!("negative offset {}", off)))
}
