//! Scratch-directory blob helpers.
//!
//! Dump blobs live in a scratch directory shared by every stage worker on a
//! host. File names carry a random suffix per job so no locking is needed,
//! and every blob travels with an `ALGO:hex` checksum so the transfer side
//! can verify it with whatever algorithm the dump side used.

use std::path::Path;

use cellcc_config::ChecksumAlgo;

/// Generate a unique scratch file name for a job's dump blob.
pub fn dump_file_name(volname: &str, job_id: impl std::fmt::Display) -> String {
    format!("{volname}.{job_id}.{:016x}.dump", rand::random::<u64>())
}

/// Errors from checksum verification.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The recorded checksum string is not `ALGO:hex`.
    #[error("Malformed checksum string {checksum:?}")]
    Malformed { checksum: String },

    /// The recorded algorithm is not one we can compute.
    #[error("Unsupported checksum algorithm {algo:?}")]
    UnsupportedAlgo { algo: String },

    /// The blob's bytes do not match the recorded checksum.
    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    Mismatch { expected: String, computed: String },
}

/// Compute a blob's checksum, formatted `ALGO:hex`.
pub async fn checksum_file(path: &Path, algo: ChecksumAlgo) -> Result<String, ChecksumError> {
    let digest = match algo {
        ChecksumAlgo::Md5 => hash_file::<md5::Md5>(path).await?,
        ChecksumAlgo::Sha256 => hash_file::<sha2::Sha256>(path).await?,
        ChecksumAlgo::Sha512 => hash_file::<sha2::Sha512>(path).await?,
    };
    Ok(format!("{algo}:{digest}"))
}

/// Verify a blob against a recorded `ALGO:hex` checksum.
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<(), ChecksumError> {
    let (algo_name, _) = expected
        .split_once(':')
        .ok_or_else(|| ChecksumError::Malformed {
            checksum: expected.to_string(),
        })?;
    let algo: ChecksumAlgo =
        algo_name
            .parse()
            .map_err(|_| ChecksumError::UnsupportedAlgo {
                algo: algo_name.to_string(),
            })?;

    let computed = checksum_file(path, algo).await?;
    if computed == expected {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch {
            expected: expected.to_string(),
            computed,
        })
    }
}

async fn hash_file<D>(path: &Path) -> Result<String, ChecksumError>
where
    D: sha2::Digest + Default,
{
    use tokio::io::AsyncReadExt as _;

    let io_err = |source| ChecksumError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let mut hasher = D::default();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Available bytes on the filesystem holding `path`.
///
/// Returns `None` when the path matches no mounted filesystem (notably in
/// minimal containers); callers treat that as "unknown" and proceed.
pub fn free_space(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_file_names_are_unique_per_call() {
        let a = dump_file_name("u.alice", 7);
        let b = dump_file_name("u.alice", 7);
        assert_ne!(a, b, "random suffix must differ");
        assert!(a.starts_with("u.alice.7."));
        assert!(a.ends_with(".dump"));
    }

    #[tokio::test]
    async fn checksum_round_trips() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"hello world").await.expect("write blob");

        //* When
        let checksum = checksum_file(&path, ChecksumAlgo::Sha256)
            .await
            .expect("checksum");

        //* Then
        assert_eq!(
            checksum,
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        verify_checksum(&path, &checksum)
            .await
            .expect("verification of an unmodified blob succeeds");
    }

    #[tokio::test]
    async fn corrupted_blob_fails_verification() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"hello world").await.expect("write blob");
        let checksum = checksum_file(&path, ChecksumAlgo::Md5).await.expect("checksum");
        tokio::fs::write(&path, b"hello worlb").await.expect("corrupt blob");

        //* When
        let result = verify_checksum(&path, &checksum).await;

        //* Then
        assert!(matches!(result, Err(ChecksumError::Mismatch { .. })));
    }

    #[tokio::test]
    async fn malformed_checksum_strings_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"x").await.expect("write blob");

        assert!(matches!(
            verify_checksum(&path, "deadbeef").await,
            Err(ChecksumError::Malformed { .. })
        ));
        assert!(matches!(
            verify_checksum(&path, "crc32:deadbeef").await,
            Err(ChecksumError::UnsupportedAlgo { .. })
        ));
    }
}
