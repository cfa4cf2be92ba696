//! File helpers shared by the customization units and the backup store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write a file with specific Unix permissions, creating parent directories as needed.
///
/// The file is created with `mode` (so the secret never exists world-readable)
/// and the mode is set again afterwards because the umask may have masked bits.
pub fn write_file_mode<P: AsRef<Path>, C: AsRef<[u8]>>(
    path: P,
    content: C,
    mode: u32,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(content.as_ref())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    Ok(())
}

/// Permission bits of `path` (without file type bits).
pub fn file_mode(path: &Path) -> Result<u32> {
    let meta = fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(meta.permissions().mode() & 0o7777)
}

/// Join a relative, declared path onto `root`, refusing anything that would
/// escape it (absolute paths, `..`).
pub fn join_under(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("Path '{}' must be relative and stay inside the tree", rel),
        }
    }
    Ok(root.join(rel_path))
}

/// Copy the contents of `src` into `dest`, overwriting files that exist.
///
/// Symlinks are recreated, not followed. Returns the number of files copied.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("{} escaped {}", entry.path().display(), src.display()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)
                    .with_context(|| format!("Failed to replace {}", target.display()))?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to link {}", target.display()))?;
            copied += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if target.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                fs::remove_file(&target)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Relative paths of every non-directory entry below `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_string_lossy().into_owned());
        }
    }
    Ok(files)
}

/// Total size in bytes of regular files below `root`.
pub fn tree_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Whether `dir` exists and has at least one entry.
pub fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_mode_sets_exact_mode() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("etc/NetworkManager/system-connections/a.nmconnection");
        write_file_mode(&path, "[connection]\n", 0o600).unwrap();
        assert_eq!(file_mode(&path).unwrap(), 0o600);

        // Rewriting a 0644 file tightens it.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        write_file_mode(&path, "[connection]\n", 0o600).unwrap();
        assert_eq!(file_mode(&path).unwrap(), 0o600);
    }

    #[test]
    fn test_join_under_rejects_escapes() {
        let root = Path::new("/work/squashfs-root");
        assert_eq!(
            join_under(root, "etc/skel").unwrap(),
            PathBuf::from("/work/squashfs-root/etc/skel")
        );
        assert!(join_under(root, "/etc/passwd").is_err());
        assert!(join_under(root, "etc/../../outside").is_err());
    }

    #[test]
    fn test_copy_tree_overwrites_and_is_repeatable() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("overlay");
        let dest = temp.path().join("root");
        write_file_with_dirs(src.join("etc/motd"), "welcome\n").unwrap();
        std::os::unix::fs::symlink("motd", src.join("etc/motd.link")).unwrap();
        write_file_with_dirs(dest.join("etc/motd"), "stock\n").unwrap();

        assert_eq!(copy_tree(&src, &dest).unwrap(), 2);
        assert_eq!(copy_tree(&src, &dest).unwrap(), 2);

        assert_eq!(fs::read_to_string(dest.join("etc/motd")).unwrap(), "welcome\n");
        assert_eq!(
            fs::read_link(dest.join("etc/motd.link")).unwrap(),
            PathBuf::from("motd")
        );
    }

    #[test]
    fn test_list_files_and_tree_size() {
        let temp = TempDir::new().unwrap();
        write_file_with_dirs(temp.path().join("b/two"), "22").unwrap();
        write_file_with_dirs(temp.path().join("a/one"), "1").unwrap();

        assert_eq!(list_files(temp.path()).unwrap(), vec!["a/one", "b/two"]);
        assert_eq!(tree_size(temp.path()).unwrap(), 3);
        assert!(dir_has_entries(temp.path()));
        assert!(!dir_has_entries(&temp.path().join("missing")));
    }
}
