//! Canonical URL form used as the cache key for both persisted tables.

use std::fmt;

/// A URL after [`canonicalize`]. Only constructed through that function (or
/// when reading a table that was written with canonical keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Characters left as-is besides ASCII alphanumerics.
///
/// This is RFC 3986 unreserved plus the reserved delimiters, minus `%` and `+`.
/// Those two are always escaped so that decoding a canonical string gives back
/// exactly the bytes that were encoded.
const KEEP: &[u8] = b"-._~!#$&'()*,/:;=?@[]";

/// Canonicalize a raw URL.
///
/// Leading and trailing ASCII control characters (newlines, tabs) are dropped.
/// Spaces are kept, since `x=1 ` and `x=1%20` name the same resource.
/// Decodes form-style (`+` is a space, `%XX` is a byte, malformed escapes are
/// kept literally), then re-encodes every byte outside [`KEEP`] as uppercase
/// `%XX`. Because decode(encode(bytes)) is the identity, the function is
/// idempotent and any two spellings of the same bytes collapse to one key.
#[must_use]
pub fn canonicalize(raw: &str) -> CanonicalUrl {
    let plus_as_space = strip_controls(raw).replace('+', " ");
    let decoded = urlencoding::decode_binary(plus_as_space.as_bytes());

    let mut out = String::with_capacity(decoded.len());
    for &byte in decoded.iter() {
        if byte.is_ascii_alphanumeric() || KEEP.contains(&byte) {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(hex_digit(byte >> 4));
            out.push(hex_digit(byte & 0x0F));
        }
    }

    CanonicalUrl(out)
}

/// Drop the leading and trailing ASCII control characters that line-based
/// input leaves behind. Spaces are not controls and survive.
#[must_use]
pub fn strip_controls(raw: &str) -> &str {
    raw.trim_matches(|c: char| c.is_ascii_control())
}

fn hex_digit(nibble: u8) -> char {
    char::from(b"0123456789ABCDEF"[usize::from(nibble)])
}
