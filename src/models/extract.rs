//! Allow-list driven tar extraction.
//!
//! Every entry is checked before anything touches the disk: links and special
//! files are refused, paths must stay relative without `..`, and only files
//! named in the manifest may be written. After unpacking into a fresh
//! temporary directory each member is re-verified, and only then is the
//! directory renamed into the models area.

use crate::error::{ExtractError, VerifyError};
use crate::models::layout::remove_path;
use crate::models::manifest::ArchiveMember;
use crate::models::verify::verify_member;
use flate2::read::GzDecoder;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Inputs for one archive extraction
#[derive(Debug, Clone, Copy)]
pub struct ExtractPlan<'a> {
    pub members: &'a [ArchiveMember],
    pub strip_components: u8,
    /// Fresh holding directory, removed on failure
    pub temp_dir: &'a Path,
    /// Final model directory the holding directory is renamed to
    pub final_dir: &'a Path,
}

/// Unpack, verify every member, then promote with a single rename
pub fn extract(
    archive_path: &Path,
    plan: &ExtractPlan<'_>,
    cancel: &CancellationToken,
) -> Result<(), ExtractError> {
    remove_path(plan.temp_dir)
        .map_err(|e| ExtractError::io("failed to clear extraction directory", e))?;
    fs::create_dir_all(plan.temp_dir)
        .map_err(|e| ExtractError::io("failed to create extraction directory", e))?;

    let result = open_archive(archive_path)
        .and_then(|mut archive| {
            unpack(
                &mut archive,
                plan.members,
                plan.strip_components,
                plan.temp_dir,
                cancel,
            )
        })
        .and_then(|()| verify_members(plan.temp_dir, plan.members, cancel))
        .and_then(|()| promote(plan.temp_dir, plan.final_dir));

    if result.is_err() {
        if let Err(e) = remove_path(plan.temp_dir) {
            tracing::warn!(
                "Failed to discard extraction directory {}: {e}",
                plan.temp_dir.display()
            );
        }
    }

    result
}

/// Open a tar archive, transparently gunzipping when the gzip magic is present
pub fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>, ExtractError> {
    let mut file =
        File::open(path).map_err(|e| ExtractError::io(format!("failed to open {}", path.display()), e))?;

    let mut magic = [0u8; 2];
    let gzipped = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(ExtractError::io("failed to read archive header", e)),
    };
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ExtractError::io("failed to rewind archive", e))?;

    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(Archive::new(reader))
}

/// Unpack the listed members of `archive` into `destination`
pub fn unpack<R: Read>(
    archive: &mut Archive<R>,
    members: &[ArchiveMember],
    strip_components: u8,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<(), ExtractError> {
    let root = destination
        .canonicalize()
        .map_err(|e| ExtractError::io("failed to resolve extraction directory", e))?;

    let allowed: HashMap<PathBuf, &ArchiveMember> = members
        .iter()
        .map(|m| (PathBuf::from(&m.path), m))
        .collect();
    let allowed_dirs: HashSet<PathBuf> = members
        .iter()
        .flat_map(|m| Path::new(&m.path).ancestors().skip(1))
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
    let mut written = HashSet::new();

    let entries = archive
        .entries()
        .map_err(|e| ExtractError::io("failed to read archive", e))?;

    for entry_result in entries {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let mut entry =
            entry_result.map_err(|e| ExtractError::io("failed to read archive entry", e))?;
        let raw_path = entry
            .path()
            .map_err(|e| ExtractError::io("failed to read archive entry path", e))?
            .into_owned();
        let name = raw_path.display().to_string();
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Symlink => {
                return Err(ExtractError::UnsupportedEntryType {
                    entry: name,
                    kind: "symlink".to_string(),
                })
            }
            EntryType::Link => {
                return Err(ExtractError::UnsupportedEntryType {
                    entry: name,
                    kind: "hard link".to_string(),
                })
            }
            EntryType::XGlobalHeader => continue,
            _ => {}
        }

        let Some(relative) = relative_entry_path(&raw_path, strip_components)? else {
            // Archive root or a stripped top-level directory
            if entry_type == EntryType::Directory {
                continue;
            }
            return Err(ExtractError::UnexpectedMember(name));
        };

        match entry_type {
            EntryType::Directory => {
                if !allowed_dirs.contains(&relative) {
                    return Err(ExtractError::UnexpectedMember(name));
                }
                let target = destination.join(&relative);
                fs::create_dir_all(&target).map_err(|e| {
                    ExtractError::io(format!("failed to create directory {}", target.display()), e)
                })?;
                ensure_within(&root, &target, &name)?;
            }
            EntryType::Regular => {
                let Some(member) = allowed.get(&relative).copied() else {
                    return Err(ExtractError::UnexpectedMember(name));
                };
                if !written.insert(relative.clone()) {
                    return Err(ExtractError::DuplicateEntry(name));
                }

                let target = destination.join(&relative);
                let size = entry
                    .header()
                    .size()
                    .map_err(|e| ExtractError::io(format!("failed to read size of {name}"), e))?;
                if size != member.size_bytes {
                    return Err(ExtractError::MemberMismatch {
                        member: member.path.clone(),
                        source: VerifyError::SizeMismatch {
                            path: target,
                            expected: member.size_bytes,
                            actual: size,
                        },
                    });
                }

                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        ExtractError::io(
                            format!("failed to create parent directory {}", parent.display()),
                            e,
                        )
                    })?;
                    ensure_within(&root, parent, &name)?;
                }

                tracing::debug!("Extracting {} -> {}", name, target.display());
                let mut out = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target)
                    .map_err(|e| {
                        ExtractError::io(format!("failed to create {}", target.display()), e)
                    })?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| ExtractError::io(format!("failed to unpack {name}"), e))?;
                ensure_within(&root, &target, &name)?;
            }
            other => {
                return Err(ExtractError::UnsupportedEntryType {
                    entry: name,
                    kind: format!("{other:?}"),
                })
            }
        }
    }

    Ok(())
}

/// Check every expected member against its size and digest
pub fn verify_members(
    destination: &Path,
    members: &[ArchiveMember],
    cancel: &CancellationToken,
) -> Result<(), ExtractError> {
    for member in members {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let path = destination.join(&member.path);
        let is_file = fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(ExtractError::MissingMember(member.path.clone()));
        }

        verify_member(&path, member).map_err(|source| ExtractError::MemberMismatch {
            member: member.path.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Atomically move the verified tree into place
fn promote(temp_dir: &Path, final_dir: &Path) -> Result<(), ExtractError> {
    remove_path(final_dir)
        .map_err(|e| ExtractError::io(format!("failed to replace {}", final_dir.display()), e))?;
    fs::rename(temp_dir, final_dir).map_err(|e| {
        ExtractError::io(
            format!(
                "failed to promote {} to {}",
                temp_dir.display(),
                final_dir.display()
            ),
            e,
        )
    })
}

/// Normalize an entry path and drop `strip` leading components.
///
/// `Ok(None)` means nothing is left after normalization and stripping.
fn relative_entry_path(raw: &Path, strip: u8) -> Result<Option<PathBuf>, ExtractError> {
    let mut segments = Vec::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(segment) => segments.push(segment),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::PathTraversal(raw.display().to_string()))
            }
        }
    }

    let relative: PathBuf = segments.into_iter().skip(usize::from(strip)).collect();
    if relative.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(relative))
    }
}

/// The real path of `path` must stay under `root`
fn ensure_within(root: &Path, path: &Path, entry: &str) -> Result<(), ExtractError> {
    let real = path
        .canonicalize()
        .map_err(|e| ExtractError::io(format!("failed to resolve {}", path.display()), e))?;
    if real.starts_with(root) {
        Ok(())
    } else {
        Err(ExtractError::PathTraversal(entry.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sha2::{Digest, Sha256};
    use std::io::{Cursor, Write};
    use tar::{Builder, Header};
    use tempfile::{tempdir, TempDir};

    fn member(path: &str, data: &[u8]) -> ArchiveMember {
        ArchiveMember {
            path: path.to_string(),
            size_bytes: data.len() as u64,
            sha256: hex::encode(Sha256::digest(data)),
        }
    }

    fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, Path::new(path), Cursor::new(data))
            .unwrap();
    }

    fn append_dir(builder: &mut Builder<Vec<u8>>, path: &str) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, Path::new(path), Cursor::new(Vec::new()))
            .unwrap();
    }

    /// Write the name bytes straight into the header, bypassing tar's own path checks
    fn append_raw(builder: &mut Builder<Vec<u8>>, path: &str, entry_type: EntryType, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.as_gnu_mut().unwrap().name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_entry_type(entry_type);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    struct Fixture {
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempdir().unwrap();
            fs::create_dir_all(root.path().join("extracting")).unwrap();
            fs::create_dir_all(root.path().join("models")).unwrap();
            Self { root }
        }

        fn temp_dir(&self) -> PathBuf {
            self.root.path().join("extracting/model.extracting")
        }

        fn final_dir(&self) -> PathBuf {
            self.root.path().join("models/model")
        }

        fn write_archive(&self, bytes: &[u8]) -> PathBuf {
            let path = self.root.path().join("model.tar.partial");
            fs::write(&path, bytes).unwrap();
            path
        }

        fn run(&self, archive: &[u8], members: &[ArchiveMember], strip: u8) -> Result<(), ExtractError> {
            let archive_path = self.write_archive(archive);
            let temp_dir = self.temp_dir();
            let final_dir = self.final_dir();
            let plan = ExtractPlan {
                members,
                strip_components: strip,
                temp_dir: &temp_dir,
                final_dir: &final_dir,
            };
            extract(&archive_path, &plan, &CancellationToken::new())
        }

        fn assert_untouched(&self) {
            assert!(!self.final_dir().exists(), "final directory must not exist");
            assert!(!self.temp_dir().exists(), "temp directory must be discarded");
            assert!(!self.root.path().join("etc").exists());
        }
    }

    #[test]
    fn test_extracts_and_promotes_member_tree() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "encoder-model.int8.onnx", b"encoder");
        append_dir(&mut builder, "vocab");
        append_file(&mut builder, "vocab/vocab.txt", b"a b c");
        let data = builder.into_inner().unwrap();

        let members = [
            member("encoder-model.int8.onnx", b"encoder"),
            member("vocab/vocab.txt", b"a b c"),
        ];
        fixture.run(&data, &members, 0).unwrap();

        let final_dir = fixture.final_dir();
        assert_eq!(fs::read(final_dir.join("encoder-model.int8.onnx")).unwrap(), b"encoder");
        assert_eq!(fs::read(final_dir.join("vocab/vocab.txt")).unwrap(), b"a b c");
        assert!(!fixture.temp_dir().exists());
    }

    #[test]
    fn test_gzip_archive_with_strip_components() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_dir(&mut builder, "parakeet-v3");
        append_file(&mut builder, "parakeet-v3/decoder.onnx", b"decoder");
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        let gz = encoder.finish().unwrap();

        fixture
            .run(&gz, &[member("decoder.onnx", b"decoder")], 1)
            .unwrap();
        assert_eq!(
            fs::read(fixture.final_dir().join("decoder.onnx")).unwrap(),
            b"decoder"
        );
    }

    #[test]
    fn test_rejects_parent_dir_traversal() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "encoder-model.int8.onnx", b"encoder");
        append_raw(&mut builder, "../../etc/passwd", EntryType::Regular, b"root:x:0:0");
        let data = builder.into_inner().unwrap();

        let err = fixture
            .run(&data, &[member("encoder-model.int8.onnx", b"encoder")], 0)
            .unwrap_err();
        assert!(matches!(err, ExtractError::PathTraversal(p) if p.contains("etc/passwd")));
        fixture.assert_untouched();
    }

    #[test]
    fn test_rejects_absolute_path() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_raw(&mut builder, "/etc/passwd", EntryType::Regular, b"root");
        let data = builder.into_inner().unwrap();

        let err = fixture.run(&data, &[member("a", b"a")], 0).unwrap_err();
        assert!(matches!(err, ExtractError::PathTraversal(_)));
        fixture.assert_untouched();
    }

    #[test]
    fn test_rejects_symlink() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_path(Path::new("link")).unwrap();
        header.set_link_name(Path::new("../evil")).unwrap();
        header.set_cksum();
        builder.append(&header, Cursor::new(Vec::new())).unwrap();
        let data = builder.into_inner().unwrap();

        let err = fixture.run(&data, &[member("link", b"")], 0).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedEntryType { ref kind, .. } if kind == "symlink"));
        fixture.assert_untouched();
    }

    #[test]
    fn test_rejects_hard_link_even_inside_root() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "a.onnx", b"model");
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Link);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_path(Path::new("b.onnx")).unwrap();
        header.set_link_name(Path::new("a.onnx")).unwrap();
        header.set_cksum();
        builder.append(&header, Cursor::new(Vec::new())).unwrap();
        let data = builder.into_inner().unwrap();

        let members = [member("a.onnx", b"model"), member("b.onnx", b"model")];
        let err = fixture.run(&data, &members, 0).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedEntryType { ref kind, .. } if kind == "hard link"));
        fixture.assert_untouched();
    }

    #[test]
    fn test_rejects_fifo() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_raw(&mut builder, "pipe", EntryType::Fifo, b"");
        let data = builder.into_inner().unwrap();

        let err = fixture.run(&data, &[member("pipe", b"")], 0).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedEntryType { .. }));
    }

    #[test]
    fn test_rejects_unlisted_member() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "model.onnx", b"model");
        append_file(&mut builder, "payload.sh", b"#!/bin/sh");
        let data = builder.into_inner().unwrap();

        let err = fixture
            .run(&data, &[member("model.onnx", b"model")], 0)
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnexpectedMember(p) if p == "payload.sh"));
        fixture.assert_untouched();
    }

    #[test]
    fn test_rejects_duplicate_entry() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "model.onnx", b"model");
        append_raw(&mut builder, "./model.onnx", EntryType::Regular, b"other");
        let data = builder.into_inner().unwrap();

        let err = fixture
            .run(&data, &[member("model.onnx", b"model")], 0)
            .unwrap_err();
        assert!(matches!(err, ExtractError::DuplicateEntry(_)));
    }

    #[test]
    fn test_member_digest_mismatch_discards_everything() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "model.onnx", b"tampered");
        let data = builder.into_inner().unwrap();

        let err = fixture
            .run(&data, &[member("model.onnx", b"original")], 0)
            .unwrap_err();
        assert!(matches!(err, ExtractError::MemberMismatch { .. }));
        fixture.assert_untouched();
    }

    #[test]
    fn test_member_size_mismatch_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "model.onnx", &[7u8; 4096]);
        let data = builder.into_inner().unwrap();

        let listed = member("model.onnx", b"small");
        let mut archive = Archive::new(Cursor::new(data));
        let err = unpack(
            &mut archive,
            std::slice::from_ref(&listed),
            0,
            dir.path(),
            &CancellationToken::new(),
        )
        .unwrap_err();

        match err {
            ExtractError::MemberMismatch {
                member,
                source: VerifyError::SizeMismatch {
                    expected, actual, ..
                },
            } => {
                assert_eq!(member, "model.onnx");
                assert_eq!(expected, 5);
                assert_eq!(actual, 4096);
            }
            other => panic!("Expected a member size mismatch, got {other:?}"),
        }
        assert!(!dir.path().join("model.onnx").exists());
    }

    #[test]
    fn test_missing_member() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "a.onnx", b"a");
        let data = builder.into_inner().unwrap();

        let members = [member("a.onnx", b"a"), member("b.onnx", b"b")];
        let err = fixture.run(&data, &members, 0).unwrap_err();
        assert!(matches!(err, ExtractError::MissingMember(p) if p == "b.onnx"));
        fixture.assert_untouched();
    }

    #[test]
    fn test_cancelled_before_first_entry() {
        let fixture = Fixture::new();
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "a.onnx", b"a");
        let data = builder.into_inner().unwrap();
        let archive_path = fixture.write_archive(&data);

        let members = [member("a.onnx", b"a")];
        let temp_dir = fixture.temp_dir();
        let final_dir = fixture.final_dir();
        let plan = ExtractPlan {
            members: &members,
            strip_components: 0,
            temp_dir: &temp_dir,
            final_dir: &final_dir,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = extract(&archive_path, &plan, &cancel).unwrap_err();
        assert!(matches!(err, ExtractError::Cancelled));
        fixture.assert_untouched();
    }

    #[test]
    fn test_relative_entry_path() {
        assert_eq!(
            relative_entry_path(Path::new("./a/b"), 0).unwrap(),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(
            relative_entry_path(Path::new("top/a"), 1).unwrap(),
            Some(PathBuf::from("a"))
        );
        assert_eq!(relative_entry_path(Path::new("top/"), 1).unwrap(), None);
        assert!(relative_entry_path(Path::new("a/../../b"), 0).is_err());
    }
}
