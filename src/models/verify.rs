use crate::error::VerifyError;
use crate::models::manifest::{ArchiveMember, ModelEntry};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Size of chunks for streaming hash computation
const CHUNK_SIZE: usize = 64 * 1024;

/// Verify a staged artifact against its manifest entry
pub fn verify(path: &Path, expected: &ModelEntry) -> Result<(), VerifyError> {
    verify_file(path, expected.size_bytes, &expected.sha256)
}

/// Verify one extracted archive member
pub fn verify_member(path: &Path, member: &ArchiveMember) -> Result<(), VerifyError> {
    verify_file(path, member.size_bytes, &member.sha256)
}

/// Check size first, then stream the file through sha256.
///
/// The digest comparison ignores case.
pub fn verify_file(path: &Path, expected_size: u64, expected_digest: &str) -> Result<(), VerifyError> {
    let io_err = |source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    };

    let actual_size = fs::metadata(path).map_err(io_err)?.len();
    if actual_size != expected_size {
        return Err(VerifyError::SizeMismatch {
            path: path.to_path_buf(),
            expected: expected_size,
            actual: actual_size,
        });
    }

    let actual = sha256_file(path).map_err(io_err)?;
    if !actual.eq_ignore_ascii_case(expected_digest) {
        return Err(VerifyError::DigestMismatch {
            path: path.to_path_buf(),
            expected: expected_digest.to_ascii_lowercase(),
            actual,
        });
    }

    Ok(())
}

/// Run [`verify`] on the blocking pool so hashing never stalls network tasks
pub async fn verify_blocking(path: PathBuf, expected: ModelEntry) -> Result<(), VerifyError> {
    let join_path = path.clone();
    tokio::task::spawn_blocking(move || verify(&path, &expected))
        .await
        .map_err(|e| VerifyError::Io {
            path: join_path,
            source: std::io::Error::other(e),
        })?
}

/// Lowercase hex sha256 of a file, read in fixed-size chunks
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
