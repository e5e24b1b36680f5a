//! Reference normalization.
//!
//! Every cross-file reference in the source format is a URL-ish string:
//! a file path, an optional `#fragment` naming an asset inside that file,
//! and an unpredictable mix of percent-escaping and letter case. The same
//! entity can be spelled several different ways across files, so every
//! reference is canonicalized into a [`Ref`] before it touches the
//! registry. Two spellings of the same entity always normalize to the
//! same `Ref`.

use std::fmt;

/// A normalized asset reference: lower-cased file path, `#`, local id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(String);

impl Ref {
    /// Canonicalize an arbitrary reference string.
    ///
    /// Idempotent: `normalize(normalize(s)) == normalize(s)`.
    pub fn normalize(s: &str) -> Ref {
        let quoted = quote(s);
        let undone = undo_quote(&quoted);
        let mut out = lower_path(&undone);
        while out.contains("//") {
            out = out.replace("//", "/");
        }
        Ref(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The file portion, before any `#`.
    pub fn file(&self) -> &str {
        match self.0.find('#') {
            Some(pos) => &self.0[..pos],
            None => &self.0,
        }
    }

    /// The local id after `#`, if present.
    pub fn fragment(&self) -> Option<&str> {
        self.0.find('#').map(|pos| &self.0[pos + 1..])
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ref({})", self.0)
    }
}

/// Resolve a reference as used (`url` fields): a bare `#fragment` is
/// relative to the referencing file, anything else stands on its own.
pub fn get_ref(id: &str, fileref: &str) -> Ref {
    if let Some(frag) = id.strip_prefix('#') {
        Ref::normalize(&format!("{fileref}#{frag}"))
    } else {
        Ref::normalize(id)
    }
}

/// Resolve a reference as declared (`id` fields): bare names are local
/// to the defining file.
pub fn get_id(id: &str, fileref: &str) -> Ref {
    if id.starts_with('/') {
        Ref::normalize(id)
    } else {
        let frag = id.strip_prefix('#').unwrap_or(id);
        Ref::normalize(&format!("{fileref}#{frag}"))
    }
}

/// The instance-local part of a reference: everything after the last `#`.
pub fn inst_ref(s: &str) -> &str {
    match s.rfind('#') {
        Some(pos) => &s[pos + 1..],
        None => s,
    }
}

/// Percent-encode every byte outside the unreserved set, leaving `/`
/// intact. Uppercase hex, UTF-8 bytes.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}

/// Undo the escapes that may legitimately appear inside a reference.
///
/// `%25` must be decoded before the others so that pre-encoded input like
/// `a%2Db` (which [`quote`] turns into `a%252Db`) comes out as `a-b`.
/// A backslash escape decodes to a forward slash.
fn undo_quote(s: &str) -> String {
    const TABLE: &[(&str, &str)] = &[
        ("%23", "#"),
        ("%25", "%"),
        ("%2D", "-"),
        ("%2E", "."),
        ("%2F", "/"),
        ("%3F", "?"),
        ("%5C", "/"),
        ("%5F", "_"),
        ("%7C", "|"),
    ];
    let mut out = s.to_string();
    for (from, to) in TABLE {
        out = out.replace(from, to);
    }
    out
}

/// Lower-case the path portion only. Fragments are case-significant,
/// paths are not (the source format assumes a case-insensitive
/// filesystem). Relative references are left untouched.
fn lower_path(s: &str) -> String {
    if !s.starts_with('/') {
        return s.to_string();
    }
    match s.split_once('#') {
        Some((path, frag)) => format!("{}#{frag}", path.to_lowercase()),
        None => s.to_lowercase(),
    }
}

/// Fully percent-decode a string, for display names and path lookup.
pub fn unquote(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
