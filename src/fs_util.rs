use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::BidsError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Order in which directory entries are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingOrder {
    /// Lexical by file name, identical on every platform.
    #[default]
    Sorted,
    /// Whatever `read_dir` returns.
    Filesystem,
}

fn fs_err(context: &str, path: &Path, err: io::Error) -> BidsError {
    BidsError::Filesystem(format!("{context} {}: {err}", path.display()))
}

/// Extracts a `.tgz` archive into `target_dir` and returns the directory the
/// archive's first entry landed in.
pub fn extract_tgz(archive_path: &Path, target_dir: &Path) -> Result<PathBuf, BidsError> {
    if !is_gzip(archive_path)? {
        return Err(BidsError::InvalidArchive(archive_path.to_path_buf()));
    }
    let file = fs::File::open(archive_path).map_err(|err| fs_err("open", archive_path, err))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|_| BidsError::InvalidArchive(archive_path.to_path_buf()))?;

    fs::create_dir_all(target_dir).map_err(|err| fs_err("create", target_dir, err))?;

    let mut first_entry: Option<PathBuf> = None;
    for entry in entries {
        let mut entry = entry.map_err(|_| BidsError::InvalidArchive(archive_path.to_path_buf()))?;
        let entry_path = entry
            .path()
            .map_err(|_| BidsError::InvalidArchive(archive_path.to_path_buf()))?
            .into_owned();
        if first_entry.is_none() {
            first_entry = first_component(&entry_path);
        }
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| fs_err("unpack into", target_dir, err))?;
        if !unpacked {
            return Err(BidsError::Filesystem(format!(
                "archive entry {} escapes {}",
                entry_path.display(),
                target_dir.display()
            )));
        }
    }

    first_entry
        .map(|name| target_dir.join(name))
        .ok_or_else(|| BidsError::InvalidArchive(archive_path.to_path_buf()))
}

fn is_gzip(path: &Path) -> Result<bool, BidsError> {
    let mut file = fs::File::open(path).map_err(|err| fs_err("open", path, err))?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(fs_err("read", path, err)),
    }
}

fn first_component(path: &Path) -> Option<PathBuf> {
    path.components().find_map(|component| match component {
        Component::Normal(name) => Some(PathBuf::from(name)),
        _ => None,
    })
}

pub fn create_path(path: &Path) -> Result<(), BidsError> {
    fs::create_dir_all(path).map_err(|err| fs_err("create", path, err))
}

pub fn is_empty_dir(path: &Path) -> Result<bool, BidsError> {
    let mut entries = fs::read_dir(path).map_err(|err| fs_err("read", path, err))?;
    Ok(entries.next().is_none())
}

/// Removes everything inside `path`, leaving the directory itself.
pub fn clear_dir(path: &Path) -> Result<(), BidsError> {
    for entry in fs::read_dir(path).map_err(|err| fs_err("read", path, err))? {
        let entry = entry.map_err(|err| fs_err("read", path, err))?;
        let child = entry.path();
        if child.is_dir() {
            fs::remove_dir_all(&child).map_err(|err| fs_err("remove", &child, err))?;
        } else {
            fs::remove_file(&child).map_err(|err| fs_err("remove", &child, err))?;
        }
    }
    Ok(())
}

/// Immediate children of `dir` accepted by `keep`, in `order`.
pub fn list_children(
    dir: &Path,
    order: ListingOrder,
    keep: impl Fn(&Path) -> bool,
) -> Result<Vec<PathBuf>, BidsError> {
    let mut items = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| fs_err("read", dir, err))? {
        let entry = entry.map_err(|err| fs_err("read", dir, err))?;
        let path = entry.path();
        if keep(&path) {
            items.push(path);
        }
    }
    if order == ListingOrder::Sorted {
        items.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    }
    Ok(items)
}

pub fn list_dirs(dir: &Path, order: ListingOrder) -> Result<Vec<PathBuf>, BidsError> {
    list_children(dir, order, |path| path.is_dir())
}

pub fn list_files(dir: &Path, order: ListingOrder) -> Result<Vec<PathBuf>, BidsError> {
    list_children(dir, order, |path| path.is_file())
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Deletes files in `dir` whose names match any of the glob `patterns`.
pub fn remove_matching(dir: &Path, patterns: &[&str]) -> Result<usize, BidsError> {
    let root = glob::Pattern::escape(&dir.to_string_lossy());
    let mut removed = 0;
    for pattern in patterns {
        let full = format!("{root}/{pattern}");
        let paths = glob::glob(&full)
            .map_err(|err| BidsError::Filesystem(format!("bad pattern {pattern}: {err}")))?;
        for path in paths.flatten() {
            if path.is_file() {
                fs::remove_file(&path).map_err(|err| fs_err("remove", &path, err))?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Moves a file, falling back to copy + delete across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<(), BidsError> {
    if let Some(parent) = to.parent() {
        create_path(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|err| fs_err("copy", from, err))?;
    fs::remove_file(from).map_err(|err| fs_err("remove", from, err))
}

pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), BidsError> {
    let parent = path
        .parent()
        .ok_or_else(|| BidsError::Filesystem("invalid destination path".to_string()))?;
    create_path(parent)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".oxybids")
        .tempfile_in(parent)
        .map_err(|err| fs_err("create temp file in", parent, err))?;
    io::Write::write_all(&mut temp, content).map_err(|err| fs_err("write", path, err))?;
    temp.persist(path)
        .map_err(|err| BidsError::Filesystem(format!("persist {}: {err}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn build_tgz(path: &Path, files: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extract_reports_first_directory() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("site-S01-20200101-DICOM.tgz");
        build_tgz(
            &archive,
            &[
                ("site-S01/20200101/mr_0001/a.dcm", b"dcm"),
                ("site-S01/20200101/mr_0001/README-Series.txt", b"Series: 1"),
            ],
        );

        let extracted = extract_tgz(&archive, temp.path()).unwrap();

        assert_eq!(extracted, temp.path().join("site-S01"));
        assert!(extracted.join("20200101/mr_0001/a.dcm").is_file());
    }

    #[test]
    fn extract_rejects_plain_files() {
        let temp = tempfile::tempdir().unwrap();
        let bogus = temp.path().join("notes.tgz");
        fs::File::create(&bogus)
            .unwrap()
            .write_all(b"plain text")
            .unwrap();

        let err = extract_tgz(&bogus, temp.path()).unwrap_err();
        assert_matches!(err, BidsError::InvalidArchive(_));
    }

    #[test]
    fn sorted_listing_is_lexical() {
        let temp = tempfile::tempdir().unwrap();
        for name in ["mr_0010", "mr_0002", "mr_0001"] {
            fs::create_dir(temp.path().join(name)).unwrap();
        }
        fs::write(temp.path().join("file.txt"), b"x").unwrap();

        let dirs = list_dirs(temp.path(), ListingOrder::Sorted).unwrap();
        let names = dirs.iter().map(|p| file_name(p)).collect::<Vec<_>>();
        assert_eq!(names, vec!["mr_0001", "mr_0002", "mr_0010"]);
    }

    #[test]
    fn clear_dir_keeps_root() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("sub-0001/ses-0001")).unwrap();
        fs::write(temp.path().join("dataset.json"), b"{}").unwrap();

        clear_dir(temp.path()).unwrap();

        assert!(temp.path().is_dir());
        assert!(is_empty_dir(temp.path()).unwrap());
    }

    #[test]
    fn remove_matching_only_touches_patterns() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("x.nii.gz"), b"").unwrap();
        fs::write(temp.path().join("x.json"), b"").unwrap();
        fs::write(temp.path().join("a.dcm"), b"").unwrap();

        let removed = remove_matching(temp.path(), &["*.nii.gz", "*.json"]).unwrap();

        assert_eq!(removed, 2);
        assert!(temp.path().join("a.dcm").exists());
    }
}
