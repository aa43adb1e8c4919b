//! Verification of downloaded artifacts against archive-declared digests.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{ChecksumAlgorithm, FileDescriptor};

const READ_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ChecksumValidator {
    enabled: bool,
}

impl ChecksumValidator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Checks a local artifact. The rules are applied in order:
    ///
    /// 1. validation disabled: accepted
    /// 2. missing or zero-length file: rejected
    /// 3. no checksum or no algorithm: accepted
    /// 4. algorithm not implemented: accepted with a warning
    /// 5. otherwise the hex digest must equal `expected` exactly
    pub fn validate(
        &self,
        path: &Path,
        expected: Option<&str>,
        algorithm: Option<&ChecksumAlgorithm>,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let len = match path.metadata() {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return false,
        };
        if len == 0 {
            return false;
        }

        let (Some(expected), Some(algorithm)) = (expected, algorithm) else {
            return true;
        };
        if expected.is_empty() {
            return true;
        }

        if let ChecksumAlgorithm::Unsupported(label) = algorithm {
            warn!(
                path = %path.display(),
                algorithm = %label,
                "unknown checksum method, accepting without verification"
            );
            return true;
        }

        match file_digest(path, algorithm) {
            Ok(actual) => {
                let matches = actual == expected;
                if !matches {
                    debug!(
                        path = %path.display(),
                        %expected,
                        %actual,
                        "checksum mismatch"
                    );
                }
                matches
            }
            Err(err) => {
                warn!(path = %path.display(), "could not compute checksum: {err}");
                true
            }
        }
    }

    pub fn validate_file(&self, path: &Path, file: &FileDescriptor) -> bool {
        self.validate(
            path,
            file.checksum.as_deref(),
            file.checksum_algorithm.as_ref(),
        )
    }
}

/// Lowercase hex digest of the full file content. Algorithms without an
/// implementation yield `ErrorKind::Unsupported`.
pub fn file_digest(path: &Path, algorithm: &ChecksumAlgorithm) -> std::io::Result<String> {
    let file = File::open(path)?;
    let reader = BufReader::with_capacity(READ_BUFFER, file);
    match algorithm {
        ChecksumAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            consume(reader, &mut hasher)?;
            Ok(format!("{:x}", hasher.finalize()))
        }
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            consume(reader, &mut hasher)?;
            Ok(format!("{:x}", hasher.finalize()))
        }
        ChecksumAlgorithm::Unsupported(label) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("no digest implementation for {label}"),
        )),
    }
}

fn consume<D: Digest, R: Read>(mut reader: R, hasher: &mut D) -> std::io::Result<()> {
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..n]);
    }
}
