//! Zip extraction for submitted project archives.
//!
//! Every entry is validated before it touches the filesystem: absolute paths and parent-directory
//! traversal (`..` components) are rejected outright, per the container creation protocol.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::RuntimeError;

/// Extract `zip_path` into `dest_dir`, which must already exist. Rejects any entry that would
/// escape `dest_dir`.
pub fn extract_zip(zip_path: &Path, dest_dir: &Path) -> Result<(), RuntimeError> {
    let file = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_name = entry
            .enclosed_name()
            .ok_or_else(|| RuntimeError::InvalidArchiveEntry(entry.name().to_string()))?;

        let out_path = safe_join(dest_dir, &entry_name)
            .ok_or_else(|| RuntimeError::InvalidArchiveEntry(entry.name().to_string()))?;

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out_file)?;
    }

    Ok(())
}

/// Join `entry` onto `base`, refusing absolute paths and any `..` component. Returns `None`
/// on rejection rather than silently clamping, so the caller can surface a descriptive error.
fn safe_join(base: &Path, entry: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("project.zip");
        write_test_zip(
            &zip_path,
            &[
                ("src/main.rs", b"fn main() {}"),
                ("Cargo.toml", b"[package]"),
            ],
        );

        let dest = tmp.path().join("extracted");
        fs::create_dir_all(&dest).unwrap();
        extract_zip(&zip_path, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert_eq!(fs::read_to_string(dest.join("Cargo.toml")).unwrap(), "[package]");
    }

    #[test]
    fn safe_join_rejects_traversal_and_absolute_paths() {
        let base = Path::new("/spool/job-1");
        assert!(safe_join(base, Path::new("src/main.rs")).is_some());
        assert!(safe_join(base, Path::new("../../etc/passwd")).is_none());
        assert!(safe_join(base, Path::new("/etc/passwd")).is_none());
    }
}
