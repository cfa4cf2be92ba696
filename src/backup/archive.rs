//! tar + zstd archive helpers for backup sets.
//!
//! Archives are written deterministically (sorted entries, zeroed mtimes and
//! owners) and carry a small JSON header entry so a stray `.tar.zst` in the
//! backup directory is never mistaken for a backup set.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use super::BackupKind;

/// Name of the metadata entry inside every archive.
pub const HEADER_ENTRY: &str = ".stationiso-backup.json";

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub kind: BackupKind,
    pub captured_at: String,
    pub paths: Vec<String>,
}

/// Archive `paths` (relative to `source`) into `out`.
///
/// Paths that don't exist under `source` are left out. Returns the paths
/// that were actually archived.
pub fn write_archive(
    source: &Path,
    paths: &[String],
    header: &ArchiveHeader,
    out: &Path,
) -> Result<Vec<String>> {
    let file = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let encoder = zstd::stream::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = Builder::new(encoder);

    let mut present = Vec::new();
    let mut entries: Vec<PathBuf> = Vec::new();
    for rel in paths {
        let top = source.join(rel);
        if top.symlink_metadata().is_err() {
            continue;
        }
        present.push(rel.clone());
        for ent in WalkDir::new(&top).follow_links(false) {
            let ent = ent.with_context(|| format!("Failed to walk {}", top.display()))?;
            entries.push(ent.path().to_path_buf());
        }
    }
    entries.sort();
    entries.dedup();

    let mut recorded = header.clone();
    recorded.paths = present.clone();
    let json = serde_json::to_vec_pretty(&recorded)?;
    let mut meta = new_header(EntryType::Regular, 0o644, json.len() as u64);
    builder.append_data(&mut meta, HEADER_ENTRY, json.as_slice())?;

    for path in entries {
        let rel = path
            .strip_prefix(source)
            .with_context(|| format!("{} is outside {}", path.display(), source.display()))?;
        append_path(&mut builder, &path, rel)?;
    }

    let encoder = builder
        .into_inner()
        .context("Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(present)
}

fn new_header(kind: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

fn append_path<W: io::Write>(builder: &mut Builder<W>, path: &Path, rel: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let md = fs::symlink_metadata(path)?;
    let mode = md.permissions().mode() & 0o7777;

    if md.is_dir() {
        let mut header = new_header(EntryType::Directory, mode, 0);
        builder.append_data(&mut header, rel, io::empty())?;
    } else if md.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        let mut header = new_header(EntryType::Symlink, mode, 0);
        builder.append_link(&mut header, rel, &target)?;
    } else if md.is_file() {
        let mut file = File::open(path)?;
        let mut header = new_header(EntryType::Regular, mode, md.len());
        builder.append_data(&mut header, rel, &mut file)?;
    }
    Ok(())
}

fn open(archive: &Path) -> Result<Archive<zstd::stream::Decoder<'static, io::BufReader<File>>>> {
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let decoder = zstd::stream::Decoder::new(file)
        .with_context(|| format!("{} is not a zstd stream", archive.display()))?;
    Ok(Archive::new(decoder))
}

/// Read every entry of the archive to the end.
///
/// Catches truncation and zstd checksum errors, and refuses entries that
/// would land outside the destination. Returns the header.
pub fn validate_archive(path: &Path) -> Result<ArchiveHeader> {
    let mut archive = open(path)?;
    let mut header: Option<ArchiveHeader> = None;

    for entry in archive.entries().context("Unreadable tar stream")? {
        let mut entry = entry.context("Corrupt tar entry")?;
        let entry_path = entry.path().context("Bad entry path")?.into_owned();
        check_entry_path(&entry_path)?;

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("Truncated entry {}", entry_path.display()))?;
        if data.len() as u64 != entry.size() {
            bail!(
                "Truncated entry {} ({} of {} bytes)",
                entry_path.display(),
                data.len(),
                entry.size()
            );
        }

        if entry_path == Path::new(HEADER_ENTRY) {
            header = Some(serde_json::from_slice(&data).context("Bad backup header")?);
        }
    }

    header.with_context(|| format!("{} has no {} entry", path.display(), HEADER_ENTRY))
}

fn check_entry_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("Entry {} escapes the restore root", path.display()),
        }
    }
    Ok(())
}

/// Unpack every entry except the header into `dest`, overwriting files.
pub fn unpack_archive(path: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut archive = open(path)?;
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);

    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        if entry_path == Path::new(HEADER_ENTRY) {
            continue;
        }
        let target = dest.join(&entry_path);
        // A symlink left by an earlier unit would redirect the write.
        if entry.header().entry_type() != EntryType::Directory
            && target
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
        {
            fs::remove_file(&target)?;
        }
        entry
            .unpack_in(dest)
            .with_context(|| format!("Failed to restore {}", entry_path.display()))?;
        if entry.header().entry_type() != EntryType::Directory {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::write_file_with_dirs;
    use tempfile::TempDir;

    fn header() -> ArchiveHeader {
        ArchiveHeader {
            kind: BackupKind::Rolling,
            captured_at: "20261019T080000Z".into(),
            paths: vec![],
        }
    }

    #[test]
    fn test_archive_validates_and_unpacks() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        write_file_with_dirs(home.join(".config/js8call/js8call.ini"), "[Config]\nMyCall=KT7RUN\n").unwrap();
        write_file_with_dirs(home.join(".bashrc"), "ignored\n").unwrap();

        let out = temp.path().join("rolling.tar.zst");
        let present = write_archive(
            &home,
            &[".config/js8call".into(), ".missing".into()],
            &header(),
            &out,
        )
        .unwrap();
        assert_eq!(present, vec![".config/js8call"]);

        let recorded = validate_archive(&out).unwrap();
        assert_eq!(recorded.paths, vec![".config/js8call"]);

        let dest = temp.path().join("skel");
        assert_eq!(unpack_archive(&out, &dest).unwrap(), 1);
        assert!(dest.join(".config/js8call/js8call.ini").exists());
        assert!(!dest.join(".bashrc").exists());
        assert!(!dest.join(HEADER_ENTRY).exists());
    }

    #[test]
    fn test_truncated_archive_fails_validation() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        let big: String = (0..20_000).map(|i| format!("line {}\n", i)).collect();
        write_file_with_dirs(home.join(".config/app/state"), big).unwrap();

        let out = temp.path().join("rolling.tar.zst");
        write_archive(&home, &[".config".into()], &header(), &out).unwrap();

        let bytes = fs::read(&out).unwrap();
        fs::write(&out, &bytes[..bytes.len() / 2]).unwrap();
        assert!(validate_archive(&out).is_err());
    }

    #[test]
    fn test_garbage_file_fails_validation() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("rolling.tar.zst");
        fs::write(&out, b"not an archive at all").unwrap();
        assert!(validate_archive(&out).is_err());
    }

    #[test]
    fn test_archive_without_header_is_rejected() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("foreign.tar.zst");
        let file = File::create(&out).unwrap();
        let encoder = zstd::stream::Encoder::new(file, 3).unwrap();
        let mut builder = Builder::new(encoder);
        let mut h = new_header(EntryType::Regular, 0o644, 3);
        builder.append_data(&mut h, "file", &b"abc"[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = validate_archive(&out).unwrap_err();
        assert!(err.to_string().contains(HEADER_ENTRY));
    }
}
