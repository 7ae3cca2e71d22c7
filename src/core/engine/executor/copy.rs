//! Host filesystem copy helpers shared by the local executor and the artifact store.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

/// Split a declared path into its trimmed form and whether it names a
/// directory's contents (trailing `/`, or the workspace root itself).
pub fn contents_marker(rel: &str) -> (&str, bool) {
    let trimmed = rel.trim_start_matches("./").trim_end_matches('/');
    let trimmed = if trimmed == "." { "" } else { trimmed };
    (trimmed, rel.ends_with('/') || trimmed.is_empty())
}

/// Copy `source` into the existing directory `dest_dir`.
///
/// With `contents_only` the entries of the `source` directory land directly
/// in `dest_dir`; otherwise `source` itself lands as `dest_dir/<basename>`.
pub fn copy_into(source: &Path, contents_only: bool, dest_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dest_dir)?;
    if contents_only {
        if !source.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", source.display()),
            ));
        }
        return copy_dir_contents(source, dest_dir);
    }
    let name = source.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", source.display()),
        )
    })?;
    let file_type = fs::symlink_metadata(source)?.file_type();
    copy_entry(source, file_type, &dest_dir.join(name))
}

/// Recursively copy the entries of `source` into `dest`, merging with what is there.
/// Symlinks are recreated as symlinks and never followed.
pub fn copy_dir_contents(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        copy_entry(&entry.path(), entry.file_type()?, &dest.join(entry.file_name()))?;
    }
    Ok(())
}

fn copy_entry(source: &Path, file_type: fs::FileType, target: &Path) -> io::Result<()> {
    if file_type.is_symlink() {
        if let Ok(existing) = fs::symlink_metadata(target) {
            if !existing.is_dir() {
                fs::remove_file(target)?;
            }
        }
        symlink(fs::read_link(source)?, target)
    } else if file_type.is_dir() {
        copy_dir_contents(source, target)
    } else {
        fs::copy(source, target).map(|_| ())
    }
}
