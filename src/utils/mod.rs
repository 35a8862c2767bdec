//! Filesystem helpers shared by the engine. Every helper takes a short
//! `name` describing the file's role so errors read "could not read catalog
//! file ..." rather than a bare path.

pub(crate) mod toml_utils;
pub(crate) mod wire;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::errors::InstallError;

pub(crate) fn is_file<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub(crate) fn is_directory<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

pub(crate) fn path_exists<P: AsRef<Path>>(path: P) -> bool {
    fs::symlink_metadata(path).is_ok()
}

pub(crate) fn ensure_dir_exists(name: &'static str, path: &Path) -> Result<bool> {
    if is_directory(path) {
        return Ok(false);
    }
    fs::create_dir_all(path)
        .map(|()| true)
        .with_context(|| InstallError::CreatingDirectory {
            name,
            path: path.to_path_buf(),
        })
}

pub(crate) fn read_file(name: &'static str, path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| InstallError::ReadingFile {
        name,
        path: path.to_path_buf(),
    })
}

pub(crate) fn read_bytes(name: &'static str, path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| InstallError::ReadingFile {
        name,
        path: path.to_path_buf(),
    })
}

pub(crate) fn write_file(name: &'static str, path: &Path, contents: &str) -> Result<()> {
    write_bytes(name, path, contents.as_bytes())
}

pub(crate) fn write_bytes(name: &'static str, path: &Path, contents: &[u8]) -> Result<()> {
    let write = || -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(path)?;
        file.write_all(contents)?;
        file.sync_data()
    };
    write().with_context(|| InstallError::WritingFile {
        name,
        path: path.to_path_buf(),
    })
}

/// Replace `path` atomically: write a temporary sibling, then rename it into
/// place. The rename is the only step an interruption can land on, and a
/// rename within one directory either happens or doesn't.
pub(crate) fn replace_file(name: &'static str, path: &Path, contents: &[u8]) -> Result<()> {
    let staged = sibling_temp_path(path);
    write_bytes(name, &staged, contents)?;
    rename(name, &staged, path)
}

/// The temporary sibling used by [`replace_file`]. Exposed so callers that
/// must hand the final rename to the elevated helper can stage the same way.
pub(crate) fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut n = path.file_name().unwrap_or_default().to_os_string();
    n.push(".new");
    path.with_file_name(n)
}

pub(crate) fn rename(name: &'static str, src: &Path, dest: &Path) -> Result<()> {
    fs::rename(src, dest).with_context(|| {
        format!(
            "could not rename {} file from '{}' to '{}'",
            name,
            src.display(),
            dest.display()
        )
    })
}

pub(crate) fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_dir_exists("copy destination", parent)?;
    }
    fs::copy(src, dest)
        .map(|_| ())
        .with_context(|| format!("could not copy '{}' to '{}'", src.display(), dest.display()))
}

pub(crate) fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    ensure_dir_exists("copy destination", dest)?;
    for entry in read_dir("copy source", src)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let sub_src = entry.path();
        let sub_dest = dest.join(entry.file_name());
        if kind.is_dir() {
            copy_dir(&sub_src, &sub_dest)?;
        } else {
            copy_file(&sub_src, &sub_dest)?;
        }
    }
    Ok(())
}

pub(crate) fn ensure_file_removed(name: &'static str, path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result.with_context(|| InstallError::Removing {
            name,
            path: path.to_path_buf(),
        }),
    }
}

pub(crate) fn remove_dir(name: &'static str, path: &Path) -> Result<()> {
    remove_dir_all::remove_dir_all(path).with_context(|| InstallError::Removing {
        name,
        path: path.to_path_buf(),
    })
}

pub(crate) fn read_dir(name: &'static str, path: &Path) -> Result<fs::ReadDir> {
    fs::read_dir(path).with_context(|| {
        format!("could not read {} directory: '{}'", name, path.display())
    })
}

pub(crate) fn open_file(name: &'static str, path: &Path) -> Result<File> {
    File::open(path).with_context(|| InstallError::ReadingFile {
        name,
        path: path.to_path_buf(),
    })
}

#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    let new_mode = (perms.mode() & !0o777) | 0o755;
    perms.set_mode(new_mode);
    fs::set_permissions(path, perms).with_context(|| {
        format!("failed to set permissions for '{}'", path.display())
    })
}

#[cfg(windows)]
pub(crate) fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_file_leaves_no_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("settings.toml");
        write_file("t", &target, "old").unwrap();
        replace_file("t", &target, b"new").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
        assert!(!path_exists(sibling_temp_path(&target)));
    }

    #[test]
    fn copy_dir_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/f"), b"x").unwrap();
        let dest = dir.path().join("b");
        copy_dir(&src, &dest).unwrap();
        assert_eq!(fs::read(dest.join("nested/f")).unwrap(), b"x");
    }
}
