//! Zip archive helpers.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{UpdaterError, UpdaterResult};

/// Metadata directory some archivers add next to the real content.
const MACOS_METADATA_DIR: &str = "__MACOSX";

/// `true` if the file starts with the `PK` zip signature.
pub fn has_zip_magic(path: &Path) -> UpdaterResult<bool> {
    let mut file = File::open(path)
        .map_err(|e| UpdaterError::fs(format!("Failed to open {}", path.display()), e))?;
    let mut magic = [0u8; 2];

    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == b"PK"),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(UpdaterError::fs(format!("Failed to read {}", path.display()), e)),
    }
}

/// Extract `archive` into `dest`, which must already exist.
///
/// Entries whose paths escape `dest` are rejected by the zip reader.
pub fn extract(archive: &Path, dest: &Path) -> UpdaterResult<()> {
    let file = File::open(archive)
        .map_err(|e| UpdaterError::fs(format!("Failed to open {}", archive.display()), e))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| UpdaterError::Archive(format!("{}: {e}", archive.display())))?;

    zip.extract(dest)
        .map_err(|e| UpdaterError::Archive(format!("Failed to extract {}: {e}", archive.display())))
}

/// The single top-level directory produced by an extraction.
///
/// `__MACOSX` is ignored. Anything other than exactly one remaining entry,
/// which must be a directory, is an [`UpdaterError::Archive`].
pub fn single_top_level_dir(extracted: &Path) -> UpdaterResult<PathBuf> {
    let entries = std::fs::read_dir(extracted).map_err(|e| {
        UpdaterError::fs(format!("Failed to list {}", extracted.display()), e)
    })?;

    let mut top_level = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| UpdaterError::fs("Failed to read directory entry", e))?;
        if entry.file_name() == MACOS_METADATA_DIR {
            continue;
        }
        top_level.push(entry.path());
    }

    match top_level.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        [only] => Err(UpdaterError::Archive(format!(
            "archive must contain a single top-level folder, found file '{}'",
            only.file_name().unwrap_or_default().to_string_lossy()
        ))),
        [] => Err(UpdaterError::Archive("archive is empty".to_string())),
        many => Err(UpdaterError::Archive(format!(
            "archive must contain a single top-level folder, found {} entries",
            many.len()
        ))),
    }
}

/// Zip `dir` into `archive`, storing entries as `<dir name>/<relative path>`.
///
/// Returns the size of the written archive.
pub fn create_from_dir(dir: &Path, archive: &Path) -> UpdaterResult<u64> {
    let root_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| UpdaterError::Archive(format!("{} has no folder name", dir.display())))?;

    let file = File::create(archive)
        .map_err(|e| UpdaterError::fs(format!("Failed to create {}", archive.display()), e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| UpdaterError::Archive(format!("Failed to walk: {e}")))?;
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());

        let mut name = root_name.clone();
        for component in relative.components() {
            name.push('/');
            name.push_str(&component.as_os_str().to_string_lossy());
        }

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), options)
                .map_err(|e| UpdaterError::Archive(e.to_string()))?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options).map_err(|e| UpdaterError::Archive(e.to_string()))?;
            let mut source = File::open(entry.path()).map_err(|e| {
                UpdaterError::fs(format!("Failed to read {}", entry.path().display()), e)
            })?;
            std::io::copy(&mut source, &mut zip)
                .map_err(|e| UpdaterError::fs("Failed to write archive entry", e))?;
        }
    }

    let mut file = zip.finish().map_err(|e| UpdaterError::Archive(e.to_string()))?;
    file.flush().map_err(|e| UpdaterError::fs("Failed to flush archive", e))?;

    let size = std::fs::metadata(archive)
        .map_err(|e| UpdaterError::fs(format!("Failed to stat {}", archive.display()), e))?
        .len();

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extract_and_find_top_level() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(
            &archive,
            &[
                ("widget-pro/widget-pro.php", "<?php"),
                ("widget-pro/readme.txt", "hi"),
                ("__MACOSX/widget-pro/._readme.txt", ""),
            ],
        );

        assert!(has_zip_magic(&archive).unwrap());

        let out = temp_dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        extract(&archive, &out).unwrap();

        let top = single_top_level_dir(&out).unwrap();
        assert_eq!(top.file_name().unwrap(), "widget-pro");
        assert!(top.join("readme.txt").is_file());
    }

    #[test]
    fn test_multiple_top_level_entries_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(&archive, &[("a/x.php", "1"), ("b/y.php", "2")]);

        let out = temp_dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        extract(&archive, &out).unwrap();

        assert!(matches!(single_top_level_dir(&out), Err(UpdaterError::Archive(_))));
    }

    #[test]
    fn test_flat_archive_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(&archive, &[("plugin.php", "<?php")]);

        let out = temp_dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        extract(&archive, &out).unwrap();

        let err = single_top_level_dir(&out).unwrap_err();
        assert!(err.to_string().contains("plugin.php"));
    }

    #[test]
    fn test_corrupt_archive_is_archive_error() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("bad.zip");
        std::fs::write(&archive, b"<html>not a zip</html>").unwrap();

        assert!(!has_zip_magic(&archive).unwrap());
        let out = temp_dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        assert!(matches!(extract(&archive, &out), Err(UpdaterError::Archive(_))));
    }

    #[test]
    fn test_create_from_dir_keeps_folder_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let plugin_dir = temp_dir.path().join("acme-seo");
        std::fs::create_dir_all(plugin_dir.join("inc")).unwrap();
        std::fs::write(plugin_dir.join("acme-seo.php"), "<?php").unwrap();
        std::fs::write(plugin_dir.join("inc").join("util.php"), "<?php // util").unwrap();

        let archive = temp_dir.path().join("backup.zip");
        let size = create_from_dir(&plugin_dir, &archive).unwrap();
        assert!(size > 0);

        let zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let names: Vec<_> = zip.file_names().map(str::to_string).collect();
        assert!(names.contains(&"acme-seo/acme-seo.php".to_string()));
        assert!(names.contains(&"acme-seo/inc/util.php".to_string()));
    }
}
