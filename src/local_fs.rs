//! Capability-scoped reads of local files named by the user.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Reads `path` to a string through a directory capability on its parent.
pub(crate) fn read_to_string(path: &Utf8Path) -> io::Result<String> {
    let (dir, file_name) = split(path)?;
    dir.read_to_string(file_name)
}

/// Fails unless `path` names a readable regular file.
pub(crate) fn ensure_readable(path: &Utf8Path) -> io::Result<()> {
    let (dir, file_name) = split(path)?;
    if !dir.metadata(file_name)?.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} is not a regular file"),
        ));
    }
    dir.open(file_name).map(drop)
}

fn split(path: &Utf8Path) -> io::Result<(Dir, &str)> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} has no file name"),
        )
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
        (dir, root)
    }

    #[test]
    fn reads_files_by_absolute_path() {
        let (_guard, root) = scratch();
        let path = root.join("key.pub");
        std::fs::write(&path, "ssh-rsa AAAA\n").expect("write key");

        assert_eq!(
            read_to_string(&path).expect("read should succeed"),
            "ssh-rsa AAAA\n"
        );
        ensure_readable(&path).expect("file is readable");
    }

    #[test]
    fn directories_and_missing_files_are_not_readable() {
        let (_guard, root) = scratch();

        assert!(ensure_readable(&root.join("missing")).is_err());
        let nested = root.join("nested");
        std::fs::create_dir(&nested).expect("create dir");
        let err = ensure_readable(&nested).expect_err("directory should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
