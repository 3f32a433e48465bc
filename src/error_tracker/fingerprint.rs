//! Stable fingerprints for error deduplication.
//!
//! Messages are normalized before hashing so errors that differ only in
//! embedded numbers, quoting or spacing share a fingerprint. Stack traces are
//! reduced to their first frames with paths and line numbers removed. The
//! hash is keyed with a per-installation salt.

const KEY_CONTEXT: &str = "zola-telemetry fingerprint v1";
const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// Lowercases, strips quotes, collapses digit runs to `#` and whitespace to single spaces.
pub fn normalize_message(message: &str) -> String {
    let mut normalized = String::with_capacity(message.len());
    let mut in_digits = false;
    let mut pending_space = false;

    for c in message.chars() {
        if matches!(c, '"' | '\'' | '`') {
            continue;
        }
        if c.is_whitespace() {
            pending_space = !normalized.is_empty();
            in_digits = false;
            continue;
        }
        if pending_space {
            normalized.push(' ');
            pending_space = false;
        }
        if c.is_ascii_digit() {
            if !in_digits {
                normalized.push('#');
                in_digits = true;
            }
            continue;
        }
        in_digits = false;
        normalized.extend(c.to_lowercase());
    }
    normalized
}

/// First `frames` non-empty frames of a stack, with file paths and numbers removed.
pub fn stack_signature(stack: &str, frames: usize) -> String {
    stack
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(frames)
        .map(|line| {
            line.split_whitespace()
                .filter(|token| !token.contains('/') && !token.contains('\\'))
                .map(|token| token.chars().filter(|c| !c.is_ascii_digit()).collect::<String>())
                .filter(|token| !token.chars().all(|c| c == ':' || c == ',' || c == '(' || c == ')'))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|frame| !frame.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keyed BLAKE3 fingerprinting.
#[derive(Clone)]
pub struct Fingerprinter {
    key: [u8; 32],
}

impl Fingerprinter {
    /// Derives the hashing key from an installation-specific salt.
    pub fn new(salt: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, salt.as_bytes()),
        }
    }

    /// Hashes the identifying parts of an error into 32 hex characters.
    ///
    /// `normalized_message` and `stack_signature` are expected to be the
    /// outputs of [`normalize_message`] and [`stack_signature`].
    pub fn fingerprint(
        &self,
        kind: &str,
        normalized_message: &str,
        stack_signature: &str,
        operation: Option<&str>,
        category: Option<&str>,
    ) -> String {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        for part in [
            kind,
            normalized_message,
            stack_signature,
            operation.unwrap_or(""),
            category.unwrap_or(""),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(FIELD_SEPARATOR);
        }
        let hash = hasher.finalize();
        hex::encode(&hash.as_bytes()[..16])
    }
}
