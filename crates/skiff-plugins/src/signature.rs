//! Plugin package signatures
//!
//! `checksums.json` lists a SHA-256 digest for every shipped file and must
//! cover everything under `bin/`. `signature.sig` is a detached Ed25519
//! signature over the exact bytes of `checksums.json`, raw or base64.

use crate::{PluginError, PluginResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

pub const CHECKSUMS_FILE: &str = "checksums.json";
pub const SIGNATURE_FILE: &str = "signature.sig";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    Unsigned,
    Untrusted,
    Official,
}

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::Untrusted => "untrusted",
            Self::Official => "official",
        }
    }

    pub fn parse(s: &str) -> PluginResult<Self> {
        match s {
            "unsigned" => Ok(Self::Unsigned),
            "untrusted" => Ok(Self::Untrusted),
            "official" => Ok(Self::Official),
            other => Err(PluginError::InvalidInput(format!(
                "unknown signature status {other:?}"
            ))),
        }
    }

    pub fn is_official(&self) -> bool {
        matches!(self, Self::Official)
    }
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `checksums.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checksums {
    #[serde(default)]
    pub algo: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Checksums {
    fn validate(&self) -> Result<(), String> {
        let algo = self.algo.trim();
        if !algo.is_empty() && !algo.eq_ignore_ascii_case("sha256") {
            return Err(format!("unsupported checksum algorithm {algo:?}"));
        }
        if self.files.is_empty() {
            return Err("checksums.json lists no files".to_string());
        }
        for (path, digest) in &self.files {
            if path.is_empty()
                || path.starts_with('/')
                || path.starts_with('\\')
                || path.contains("..")
                || path.contains(':')
            {
                return Err(format!("invalid checksum path {path:?}"));
            }
            let digest = digest.trim();
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("invalid sha256 digest for {path}"));
            }
        }
        Ok(())
    }

    fn digest_for(&self, rel: &str) -> Option<String> {
        self.files.get(rel).map(|d| d.trim().to_ascii_lowercase())
    }
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let data = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, String> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(format!("read {}: {e}", path.display())),
    }
}

fn decode_signature(raw: &[u8]) -> Result<Signature, String> {
    if raw.len() == ed25519_dalek::SIGNATURE_LENGTH {
        return Signature::from_slice(raw).map_err(|e| format!("invalid signature: {e}"));
    }
    let text = std::str::from_utf8(raw).map_err(|_| "signature is neither raw nor base64")?;
    let decoded = BASE64_STANDARD
        .decode(text.trim())
        .map_err(|e| format!("invalid signature encoding: {e}"))?;
    if decoded.len() != ed25519_dalek::SIGNATURE_LENGTH {
        return Err(format!("signature must be 64 bytes, got {}", decoded.len()));
    }
    Signature::from_slice(&decoded).map_err(|e| format!("invalid signature: {e}"))
}

/// Every file under `bin/` must be listed in the checksums
fn check_bin_coverage(dir: &Path, checksums: &Checksums) -> Result<(), String> {
    let bin = dir.join("bin");
    if !bin.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(&bin).follow_links(false) {
        let entry = entry.map_err(|e| format!("walk bin/: {e}"))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| format!("strip prefix: {e}"))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !checksums.files.contains_key(&rel) {
            return Err(format!("{rel} is not covered by checksums.json"));
        }
    }
    Ok(())
}

fn check_digests(dir: &Path, checksums: &Checksums) -> Result<(), String> {
    for rel in checksums.files.keys() {
        let path = dir.join(rel.replace('\\', "/"));
        let metadata = fs::symlink_metadata(&path).map_err(|e| format!("{rel}: {e}"))?;
        if !metadata.file_type().is_file() {
            return Err(format!("{rel} is not a regular file"));
        }
        let actual = sha256_file(&path).map_err(|e| format!("{rel}: {e}"))?;
        if Some(actual) != checksums.digest_for(rel) {
            return Err(format!("checksum mismatch for {rel}"));
        }
    }
    Ok(())
}

fn verify(dir: &Path, trusted_keys: &[[u8; 32]]) -> Result<SignatureStatus, String> {
    let Some(checksums_raw) = read_optional(&dir.join(CHECKSUMS_FILE))? else {
        return Ok(SignatureStatus::Unsigned);
    };
    let Some(signature_raw) = read_optional(&dir.join(SIGNATURE_FILE))? else {
        return Ok(SignatureStatus::Unsigned);
    };

    let checksums: Checksums = serde_json::from_slice(&checksums_raw)
        .map_err(|e| format!("malformed checksums.json: {e}"))?;
    checksums.validate()?;
    check_bin_coverage(dir, &checksums)?;
    check_digests(dir, &checksums)?;

    let signature = decode_signature(&signature_raw)?;
    for key in trusted_keys {
        let Ok(verifying_key) = VerifyingKey::from_bytes(key) else {
            continue;
        };
        if verifying_key.verify(&checksums_raw, &signature).is_ok() {
            return Ok(SignatureStatus::Official);
        }
    }
    Err("no trusted key verifies the signature".to_string())
}

/// Classify a plugin directory as unsigned, untrusted or official
pub fn verify_plugin_dir(dir: &Path, trusted_keys: &[[u8; 32]]) -> SignatureStatus {
    match verify(dir, trusted_keys) {
        Ok(status) => status,
        Err(reason) => {
            debug!(dir = %dir.display(), reason = %reason, "plugin signature not trusted");
            SignatureStatus::Untrusted
        }
    }
}
