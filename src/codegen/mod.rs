//! Artifact byte handling: content hashing, canonicalization and formatting.

pub mod canonicalize;
pub mod formatter;
pub mod hash;

pub use canonicalize::{
    CanonicalOverride, CanonicalRules, Canonicalized, Canonicalizer, LineEnding,
    TrailingWhitespace, UnicodeForm, canonicalize,
};
pub use formatter::{ExternalFormatter, FailurePolicy, Formattable, FormatterConfig};
pub use hash::{HASH_ALGORITHM, canonical_json, hash_bytes, hash_canonical_json, hash_file, hash_str};
