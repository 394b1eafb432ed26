use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::AppError;

pub const CONTENT_HASH_PREFIX: &str = "sha256:";

/// Hash of canonicalized text input, encoded as `sha256:` + 64 lowercase
/// hex characters. Text is NFC-normalized first so that visually identical
/// submissions collapse to the same queue entry.
pub fn hash_text(text: &str) -> String {
    let canonical: String = text.nfc().collect();
    hash_bytes(canonical.as_bytes())
}

/// Hash of raw input bytes (files, images), same encoding as [`hash_text`].
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{CONTENT_HASH_PREFIX}{:x}", hasher.finalize())
}

/// Fingerprint used to gate checkpoint resumes. Same derivation as the
/// content hash; kept as a separate entry point because the two values
/// guard different invariants.
pub fn input_fingerprint(bytes: &[u8]) -> String {
    hash_bytes(bytes)
}

pub fn validate_content_hash(hash: &str) -> Result<(), AppError> {
    let hex = hash.strip_prefix(CONTENT_HASH_PREFIX).ok_or_else(|| {
        AppError::Validation(format!("content hash must start with '{CONTENT_HASH_PREFIX}'"))
    })?;

    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(AppError::Validation(
            "content hash must be 64 lowercase hex characters".into(),
        ));
    }

    Ok(())
}
