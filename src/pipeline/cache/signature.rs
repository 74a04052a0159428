use std::fmt;
use std::fs::{File, Metadata};
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sentinel signature for files that cannot be stat-ed.
pub const MISSING_SIGNATURE: &str = "missing";

/// Bytes hashed from the start of the file in hybrid mode.
pub const DEFAULT_HYBRID_BYTES: u64 = 2_000_000;

// ═══════════════════════════════════════════════════════════
// Signature mode
// ═══════════════════════════════════════════════════════════

/// How much of the file participates in its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// `mtime_ns:size`
    #[default]
    Fast,
    /// `mtime_ns:size:sha256(file)`
    Strict,
    /// `mtime_ns:size:sha256(first N bytes)`
    Hybrid,
}

impl SignatureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Strict => "strict",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "strict" => Some(Self::Strict),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

impl fmt::Display for SignatureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Signature and key newtypes
// ═══════════════════════════════════════════════════════════

/// Fingerprint of a file's on-disk state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentSignature(String);

impl DocumentSignature {
    pub fn missing() -> Self {
        Self(MISSING_SIGNATURE.to_string())
    }

    pub fn is_missing(&self) -> bool {
        self.0 == MISSING_SIGNATURE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic identifier for one (label, filename, signature) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════
// Builders
// ═══════════════════════════════════════════════════════════

/// Compute the signature of `root/filename` with the default hybrid prefix length.
///
/// Never fails: anything that cannot be stat-ed (or is not a regular file)
/// yields the `missing` sentinel, which never equals a real signature.
pub fn compute_signature(root: &Path, filename: &str, mode: SignatureMode) -> DocumentSignature {
    compute_signature_with(root, filename, mode, DEFAULT_HYBRID_BYTES)
}

/// Same as [`compute_signature`] with an explicit hybrid prefix length.
pub fn compute_signature_with(
    root: &Path,
    filename: &str,
    mode: SignatureMode,
    hybrid_bytes: u64,
) -> DocumentSignature {
    if filename.is_empty() {
        return DocumentSignature::missing();
    }

    let path = root.join(filename);
    let metadata = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m,
        _ => return DocumentSignature::missing(),
    };

    let fast = format!("{}:{}", mtime_ns(&metadata), metadata.len());

    let digest = match mode {
        SignatureMode::Fast => return DocumentSignature(fast),
        SignatureMode::Strict => sha256_file(&path, None),
        SignatureMode::Hybrid => sha256_file(&path, Some(hybrid_bytes)),
    };

    match digest {
        Ok(hex) => DocumentSignature(format!("{fast}:{hex}")),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                mode = %mode,
                error = %e,
                "File stat succeeded but hashing failed, treating as missing"
            );
            DocumentSignature::missing()
        }
    }
}

/// Derive the cache key for a (label, filename, signature) triple.
///
/// The material is a JSON object with sorted keys, so field order never
/// affects the result. Values are hashed exactly as given (no trimming,
/// no case folding).
pub fn make_key(label: &str, pdf_filename: &str, signature: &DocumentSignature) -> DocumentKey {
    let material = serde_json::json!({
        "label": label,
        "pdf_filename": pdf_filename,
        "sig": signature.as_str(),
    })
    .to_string();

    let digest = Sha256::digest(material.as_bytes());
    DocumentKey(format!("{digest:x}"))
}

/// Modification time in nanoseconds since the Unix epoch (negative before it).
fn mtime_ns(metadata: &Metadata) -> i128 {
    match metadata.modified() {
        Ok(modified) => match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i128,
            Err(e) => -(e.duration().as_nanos() as i128),
        },
        Err(_) => 0,
    }
}

/// SHA-256 of the whole file, or of its first `max_bytes` bytes.
fn sha256_file(path: &Path, max_bytes: Option<u64>) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();

    match max_bytes {
        Some(limit) => {
            io::copy(&mut file.by_ref().take(limit), &mut hasher)?;
        }
        None => {
            io::copy(&mut file, &mut hasher)?;
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}
