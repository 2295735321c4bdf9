//! Hashing utilities for checksums and signatures.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256, Sha512};

/// Compute SHA256 hash of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA256 hash of a string.
pub fn sha256_str(s: &str) -> String {
    sha256_bytes(s.as_bytes())
}

/// Compute SHA256 hash of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    digest_file::<Sha256>(path)
}

/// Compute SHA512 hash of a file.
pub fn sha512_file(path: &Path) -> Result<String> {
    digest_file::<Sha512>(path)
}

/// Stream a file through any `sha2` digest and return the lowercase hex result.
fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a JSON value in canonical form.
///
/// Object keys are sorted recursively before serialization, so two values
/// that differ only in field order hash identically.
pub fn sha256_canonical_json(value: &serde_json::Value) -> Result<String> {
    let bytes =
        serde_json::to_vec(&canonicalize(value)).context("failed to serialize canonical json")?;
    Ok(sha256_bytes(&bytes))
}

/// Rebuild a JSON value with every object's keys in sorted order.
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let sorted = entries
                .into_iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect::<serde_json::Map<_, _>>();
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}
