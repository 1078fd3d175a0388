//! Layer extraction.
//!
//! Unpacks a gzip-compressed layer tarball into its own cache directory.
//! Only directories, regular files, hard links and symbolic links are
//! materialized; any other entry type aborts the extraction.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use minibox_core::error::{BoxError, Result};
use tar::{Archive, EntryType};

/// Extract a single layer (tar.gz) to target directory.
///
/// # Arguments
///
/// * `layer_path` - Path to the layer tarball (*.tar.gz)
/// * `target_dir` - Directory to extract files into
///
/// # Errors
///
/// Returns error if:
/// - Layer file doesn't exist
/// - Decompression fails
/// - An entry has an unsupported type or escapes `target_dir`
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(BoxError::LayerError(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    fs::create_dir_all(target_dir).map_err(|e| {
        BoxError::LayerError(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = File::open(layer_path).map_err(|e| {
        BoxError::LayerError(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    unpack(GzDecoder::new(file), target_dir)?;

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );

    Ok(())
}

/// Unpack an uncompressed tar stream into `target_dir`.
pub fn unpack<R: Read>(reader: R, target_dir: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| BoxError::LayerError(format!("Failed to read archive: {}", e)))?;

    // Directory modes are applied after all entries so a read-only directory
    // does not block writing its own children.
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in entries {
        let mut entry = entry
            .map_err(|e| BoxError::LayerError(format!("Failed to read archive entry: {}", e)))?;

        let raw_path = entry
            .path()
            .map_err(|e| BoxError::LayerError(format!("Invalid entry path: {}", e)))?
            .into_owned();
        let rel = normalize_entry_path(&raw_path)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = target_dir.join(&rel);

        let entry_type = entry.header().entry_type();
        let mode = entry
            .header()
            .mode()
            .map_err(|e| BoxError::LayerError(format!("Invalid mode for {}: {}", rel.display(), e)))?
            & 0o7777;

        if entry_type != EntryType::XGlobalHeader {
            reject_symlink_ancestors(target_dir, &rel)?;
        }

        match entry_type {
            EntryType::Directory => {
                create_dir(&dest)?;
                dir_modes.push((dest, mode));
            }
            EntryType::Regular | EntryType::Continuous => {
                prepare_parent(&dest)?;
                remove_non_dir(&dest)?;
                let mut out = File::create(&dest).map_err(|e| io_error("create", &dest, e))?;
                io::copy(&mut entry, &mut out).map_err(|e| io_error("write", &dest, e))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))
                    .map_err(|e| io_error("chmod", &dest, e))?;
            }
            EntryType::Link => {
                let link = link_name(&mut entry, &rel)?;
                let source = link_source(target_dir, &link)?;
                prepare_parent(&dest)?;
                remove_non_dir(&dest)?;
                fs::hard_link(&source, &dest).map_err(|e| {
                    BoxError::LayerError(format!(
                        "Failed to link {} to {}: {}",
                        dest.display(),
                        source.display(),
                        e
                    ))
                })?;
            }
            EntryType::Symlink => {
                // The literal target is kept; it is resolved inside the container.
                let target = link_name(&mut entry, &rel)?;
                prepare_parent(&dest)?;
                remove_non_dir(&dest)?;
                std::os::unix::fs::symlink(&target, &dest)
                    .map_err(|e| io_error("symlink", &dest, e))?;
            }
            // pax global headers carry metadata for the whole archive, no file
            EntryType::XGlobalHeader => continue,
            other => {
                return Err(BoxError::UnsupportedEntryType {
                    entry_type: format!("{:?}", other),
                    path: rel.display().to_string(),
                });
            }
        }

        tracing::trace!(path = %rel.display(), kind = ?entry_type, "Unpacked entry");
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
            .map_err(|e| io_error("chmod", &dir, e))?;
    }

    Ok(())
}

/// Strip leading `/` and `.` components and reject `..`, so every entry
/// stays under the extraction root.
pub(crate) fn normalize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BoxError::LayerError(format!(
                    "Archive entry escapes layer root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Fail if any ancestor of `rel` under `root` is a symlink; writing through
/// it could land outside `root`.
pub(crate) fn reject_symlink_ancestors(root: &Path, rel: &Path) -> Result<()> {
    let mut current = root.to_path_buf();
    let mut components = rel.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(BoxError::LayerError(format!(
                    "Path {} traverses symlink {}",
                    rel.display(),
                    current.display()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Resolve a hard link target inside `root`. The target must not traverse
/// or be a symlink, since link(2) would follow it out of the layer.
fn link_source(root: &Path, link: &Path) -> Result<PathBuf> {
    let link_rel = normalize_entry_path(link)?;
    reject_symlink_ancestors(root, &link_rel)?;
    let source = root.join(&link_rel);
    match fs::symlink_metadata(&source) {
        Ok(meta) if meta.file_type().is_symlink() => Err(BoxError::LayerError(format!(
            "Hard link target {} is a symlink",
            link.display()
        ))),
        _ => Ok(source),
    }
}

fn link_name<R: Read>(entry: &mut tar::Entry<'_, R>, rel: &Path) -> Result<PathBuf> {
    entry
        .link_name()
        .map_err(|e| BoxError::LayerError(format!("Invalid link target for {}: {}", rel.display(), e)))?
        .map(|p| p.into_owned())
        .ok_or_else(|| BoxError::LayerError(format!("Link entry {} has no target", rel.display())))
}

fn create_dir(path: &Path) -> Result<()> {
    match fs::DirBuilder::new().recursive(true).mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(io_error("mkdir", path, e)),
    }
}

fn prepare_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) => create_dir(parent),
        None => Ok(()),
    }
}

/// Remove a file or symlink occupying `path` so it can be replaced.
fn remove_non_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path).map_err(|e| io_error("remove", path, e)),
        _ => Ok(()),
    }
}

fn io_error(op: &str, path: &Path, err: io::Error) -> BoxError {
    BoxError::LayerError(format!("Failed to {} {}: {}", op, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    enum Item<'a> {
        Dir(&'a str, u32),
        File(&'a str, &'a [u8], u32),
        HardLink(&'a str, &'a str),
        Symlink(&'a str, &'a str),
        Fifo(&'a str),
    }

    // Helper function to create a test tar.gz layer
    fn create_test_layer(path: &Path, items: &[Item<'_>]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);

        for item in items {
            let mut header = Header::new_gnu();
            match item {
                Item::Dir(name, mode) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_mode(*mode);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append_data(&mut header, name, io::empty()).unwrap();
                }
                Item::File(name, content, mode) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *content).unwrap();
                }
                Item::HardLink(name, target) => {
                    header.set_entry_type(EntryType::Link);
                    header.set_mode(0o644);
                    header.set_size(0);
                    builder.append_link(&mut header, name, target).unwrap();
                }
                Item::Symlink(name, target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder.append_link(&mut header, name, target).unwrap();
                }
                Item::Fifo(name) => {
                    header.set_entry_type(EntryType::Fifo);
                    header.set_mode(0o644);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append_data(&mut header, name, io::empty()).unwrap();
                }
            }
        }

        builder.into_inner().unwrap().finish().unwrap();
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn test_extract_layer_extracts_files() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(
            &layer_path,
            &[
                Item::File("file1.txt", b"content1", 0o644),
                Item::File("dir/file2.txt", b"content2", 0o600),
            ],
        );

        extract_layer(&layer_path, &target_dir).unwrap();

        assert_eq!(fs::read_to_string(target_dir.join("file1.txt")).unwrap(), "content1");
        assert_eq!(fs::read_to_string(target_dir.join("dir/file2.txt")).unwrap(), "content2");
        assert_eq!(mode_of(&target_dir.join("dir/file2.txt")), 0o600);
    }

    #[test]
    fn test_extract_layer_applies_executable_bits() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(
            &layer_path,
            &[Item::Dir("bin/", 0o755), Item::File("bin/tool", b"#!/bin/sh\n", 0o755)],
        );

        extract_layer(&layer_path, &target_dir).unwrap();
        assert_eq!(mode_of(&target_dir.join("bin/tool")), 0o755);
        assert_eq!(mode_of(&target_dir.join("bin")), 0o755);
    }

    #[test]
    fn test_extract_layer_directory_already_exists() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");
        fs::create_dir_all(target_dir.join("etc")).unwrap();

        create_test_layer(
            &layer_path,
            &[Item::Dir("etc/", 0o755), Item::Dir("etc/", 0o755)],
        );

        extract_layer(&layer_path, &target_dir).unwrap();
        assert!(target_dir.join("etc").is_dir());
    }

    #[test]
    fn test_extract_layer_read_only_directory_with_children() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(
            &layer_path,
            &[Item::Dir("ro/", 0o555), Item::File("ro/inner", b"x", 0o444)],
        );

        extract_layer(&layer_path, &target_dir).unwrap();
        assert_eq!(mode_of(&target_dir.join("ro")), 0o555);
        assert_eq!(fs::read_to_string(target_dir.join("ro/inner")).unwrap(), "x");

        // Let TempDir clean up
        fs::set_permissions(target_dir.join("ro"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_extract_layer_hard_link_resolves_in_layer_dir() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(
            &layer_path,
            &[
                Item::File("usr/bin/python3.11", b"elf", 0o755),
                Item::HardLink("usr/bin/python3", "usr/bin/python3.11"),
            ],
        );

        extract_layer(&layer_path, &target_dir).unwrap();

        use std::os::unix::fs::MetadataExt;
        let a = fs::metadata(target_dir.join("usr/bin/python3.11")).unwrap();
        let b = fs::metadata(target_dir.join("usr/bin/python3")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_extract_layer_symlink_keeps_literal_target() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(
            &layer_path,
            &[Item::Symlink("bin", "usr/bin"), Item::Symlink("sh", "/bin/busybox")],
        );

        extract_layer(&layer_path, &target_dir).unwrap();
        assert_eq!(fs::read_link(target_dir.join("bin")).unwrap(), PathBuf::from("usr/bin"));
        assert_eq!(fs::read_link(target_dir.join("sh")).unwrap(), PathBuf::from("/bin/busybox"));
    }

    #[test]
    fn test_extract_layer_rejects_unsupported_entry_type() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(&layer_path, &[Item::Fifo("run/pipe")]);

        let err = extract_layer(&layer_path, &target_dir).unwrap_err();
        match err {
            BoxError::UnsupportedEntryType { entry_type, path } => {
                assert_eq!(entry_type, "Fifo");
                assert_eq!(path, "run/pipe");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extract_layer_rejects_write_through_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        create_test_layer(
            &layer_path,
            &[
                Item::Symlink("escape", outside.to_str().unwrap()),
                Item::File("escape/owned", b"x", 0o644),
            ],
        );

        assert!(extract_layer(&layer_path, &target_dir).is_err());
        assert!(!outside.join("owned").exists());
    }

    #[test]
    fn test_extract_layer_rejects_hard_link_through_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");
        let host = temp_dir.path().join("host");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("secret"), "host-secret").unwrap();

        create_test_layer(
            &layer_path,
            &[
                Item::Symlink("x", host.to_str().unwrap()),
                Item::HardLink("leak", "x/secret"),
            ],
        );

        let err = extract_layer(&layer_path, &target_dir).unwrap_err();
        assert!(matches!(err, BoxError::LayerError(_)));
        assert!(fs::symlink_metadata(target_dir.join("leak")).is_err());
    }

    #[test]
    fn test_extract_layer_rejects_hard_link_to_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(
            &layer_path,
            &[
                Item::Symlink("passwd-link", "/etc/passwd"),
                Item::HardLink("copy", "passwd-link"),
            ],
        );

        assert!(matches!(
            extract_layer(&layer_path, &target_dir),
            Err(BoxError::LayerError(_))
        ));
    }

    #[test]
    fn test_extract_layer_rejects_hard_link_outside_layer() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");
        fs::write(temp_dir.path().join("secret"), "host-secret").unwrap();

        create_test_layer(&layer_path, &[Item::HardLink("leak", "../secret")]);

        assert!(matches!(
            extract_layer(&layer_path, &target_dir),
            Err(BoxError::LayerError(_))
        ));
        assert!(!target_dir.join("leak").exists());
    }

    #[test]
    fn test_extract_layer_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("nonexistent.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        let result = extract_layer(&layer_path, &target_dir);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Layer file not found"));
    }

    #[test]
    fn test_extract_layer_not_gzip() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");
        fs::write(&layer_path, b"definitely not gzip").unwrap();

        assert!(extract_layer(&layer_path, &target_dir).is_err());
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(normalize_entry_path(Path::new("./etc/passwd")).unwrap(), PathBuf::from("etc/passwd"));
        assert_eq!(normalize_entry_path(Path::new("/etc/passwd")).unwrap(), PathBuf::from("etc/passwd"));
        assert_eq!(normalize_entry_path(Path::new("./")).unwrap(), PathBuf::new());
        assert!(normalize_entry_path(Path::new("../etc/passwd")).is_err());
        assert!(normalize_entry_path(Path::new("a/../../b")).is_err());
    }
}
