//! Command fingerprints.
//!
//! A fingerprint is a stable digest over the compiler identity, the
//! normalized command line, and the content hashes of every declared input.
//! Nodes with equal fingerprints are interchangeable; the compile cache is
//! keyed by them.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Content hash of one file, 64K chunks.
pub fn file_digest(path: &Path) -> io::Result<blake3::Hash> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 65536];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Digest a build command: identity, argv, then each input's path and
/// content hash in sorted path order so the result is independent of
/// discovery order.
pub fn node_fingerprint(
    identity: &str,
    argv: &[String],
    inputs: &[PathBuf],
) -> io::Result<Fingerprint> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(identity.as_bytes());
    hasher.update(b"\0");
    for arg in argv {
        hasher.update(arg.as_bytes());
        hasher.update(b"\0");
    }

    let mut sorted: Vec<&PathBuf> = inputs.iter().collect();
    sorted.sort();
    sorted.dedup();
    for input in sorted {
        hasher.update(input.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(file_digest(input)?.as_bytes());
    }
    Ok(Fingerprint(*hasher.finalize().as_bytes()))
}

/// Digest a derived command (archive, link, test-run) from its argv and the
/// fingerprints of the nodes it consumes. Plan-time computable: no outputs
/// need to exist yet, and any change in a transitive input shows up through
/// the dependency fingerprints.
pub fn derived_fingerprint(
    identity: &str,
    argv: &[String],
    dep_fingerprints: &[Fingerprint],
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(identity.as_bytes());
    hasher.update(b"\0");
    for arg in argv {
        hasher.update(arg.as_bytes());
        hasher.update(b"\0");
    }
    for fp in dep_fingerprints {
        hasher.update(&fp.0);
    }
    Fingerprint(*hasher.finalize().as_bytes())
}

/// Digest of a produced output file, recorded into the compile cache.
pub fn output_digest(path: &Path) -> io::Result<String> {
    Ok(file_digest(path)?.to_hex().to_string())
}
