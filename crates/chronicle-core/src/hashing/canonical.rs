//! Canonical string rendering of typed field tuples.
//!
//! Every field is stringified with a fixed, type-specific rule, escaped, and
//! joined with `|`. An optional discriminator is appended after `#`. The
//! three structural characters (`\`, `|`, `#`) are backslash-escaped inside
//! field text, which makes the rendering injective: `("ab","c")`,
//! `("a","bc")` and `("a|b","c")` all produce distinct strings.
//!
//! Nulls render as the empty string. A key made only of nulls therefore
//! always collapses to the same surrogate; callers route such keys to the
//! unknown sentinel rather than minting new entities.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ChronicleError, ChronicleResult};
use crate::models::{format_date, format_timestamp, FieldValue};

pub const FIELD_SEPARATOR: char = '|';
pub const DISCRIMINATOR_MARKER: char = '#';
const ESCAPE: char = '\\';

/// Normalisation applied to text fields before hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOptions {
    /// Strip leading and trailing whitespace from text fields.
    pub trim: bool,
    /// When false, text fields are upper-cased so `"abc"` and `"ABC"` hash
    /// alike.
    pub case_sensitive: bool,
}

impl KeyOptions {
    /// Defaults for business keys: trimmed, case-insensitive.
    pub const fn business_key() -> Self {
        Self {
            trim: true,
            case_sensitive: false,
        }
    }

    /// Defaults for fingerprints: untouched text, so any visible change in
    /// an attribute is a change of state.
    pub const fn fingerprint() -> Self {
        Self {
            trim: false,
            case_sensitive: true,
        }
    }
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self::business_key()
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        if ch == ESCAPE || ch == FIELD_SEPARATOR || ch == DISCRIMINATOR_MARKER {
            out.push(ESCAPE);
        }
        out.push(ch);
    }
}

fn normalise_text(raw: &str, options: &KeyOptions) -> String {
    let trimmed = if options.trim { raw.trim() } else { raw };
    if options.case_sensitive {
        trimmed.to_string()
    } else {
        trimmed.to_uppercase()
    }
}

/// Render a single field with its type-specific rule (unescaped).
pub fn canonical_field(value: &FieldValue, options: &KeyOptions) -> ChronicleResult<String> {
    let rendered = match value {
        FieldValue::Null => String::new(),
        FieldValue::Text(s) => normalise_text(s, options),
        FieldValue::Int(i) => i.to_string(),
        FieldValue::Float(f) => {
            if !f.is_finite() {
                return Err(ChronicleError::KeyDerivation(format!(
                    "non-finite float {f} has no canonical form"
                )));
            }
            if *f == 0.0 {
                // -0.0 and 0.0 are the same value.
                "0".to_string()
            } else {
                f.to_string()
            }
        }
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Date(d) => format_date(d),
        FieldValue::Timestamp(ts) => format_timestamp(ts),
        FieldValue::Bytes(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
    };
    Ok(rendered)
}

/// Render an ordered tuple (plus optional discriminator) to its canonical,
/// injective string.
pub fn canonical_join(
    fields: &[FieldValue],
    discriminator: Option<&str>,
    options: &KeyOptions,
) -> ChronicleResult<String> {
    let mut out = String::new();
    for (position, field) in fields.iter().enumerate() {
        if position > 0 {
            out.push(FIELD_SEPARATOR);
        }
        escape_into(&mut out, &canonical_field(field, options)?);
    }
    if let Some(disc) = discriminator {
        out.push(DISCRIMINATOR_MARKER);
        escape_into(&mut out, disc);
    }
    Ok(out)
}

/// SHA-256 of `input`, lowercase hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
