use sha2::{Digest, Sha256};
use url::Url;

use crate::types::ResourceKind;

pub const MAX_NAME_LEN: usize = 200;
/// Appended when neither the URL nor the content type gives away the format.
pub const UNKNOWN_BINARY_SUFFIX: &str = "_.bin";

// substring of the content type -> extension, first match wins
const CONTENT_TYPE_EXTENSIONS: [(&str, &str); 5] = [
    ("javascript", ".js"),
    ("css", ".css"),
    ("html", ".html"),
    ("font", ".woff2"),
    ("image", ".img"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnsupportedKind(ResourceKind),
    HttpStatus(u32),
    EmptyPayload,
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accept { file_name: String },
    Reject(Rejection),
}

impl Classification {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Classification::Accept { .. })
    }

    pub fn file_name(&self) -> Option<&str> {
        match self {
            Classification::Accept { file_name } => Some(file_name),
            Classification::Reject(_) => None,
        }
    }
}

/// The part of [`classify`] that does not need the payload, so a listener can
/// drop a response before asking the browser for its body.
pub fn precheck(kind: ResourceKind, status: u32) -> Result<(), Rejection> {
    if !kind.is_renderable() {
        return Err(Rejection::UnsupportedKind(kind));
    }
    if status >= 400 {
        return Err(Rejection::HttpStatus(status));
    }
    Ok(())
}

pub fn classify(
    url: &str,
    kind: ResourceKind,
    status: u32,
    content_type: Option<&str>,
    payload: &[u8],
) -> Classification {
    if let Err(r) = precheck(kind, status) {
        return Classification::Reject(r);
    }
    if payload.is_empty() {
        return Classification::Reject(Rejection::EmptyPayload);
    }
    match derive_file_name(url, content_type) {
        Some(file_name) => Classification::Accept { file_name },
        None => Classification::Reject(Rejection::InvalidUrl(url.to_string())),
    }
}

/// Absolute URL without its fragment. Returns `None` for anything that does
/// not parse as an absolute URL.
pub fn canonical_url(url: &str) -> Option<String> {
    let mut u = Url::parse(url.trim()).ok()?;
    u.set_fragment(None);
    Some(u.to_string())
}

/// `sanitize(host + path + query)` followed by the inferred extension, or by
/// [`UNKNOWN_BINARY_SUFFIX`] when nothing can be inferred. A URL that already
/// carries an extension keeps it inside the sanitized part.
pub fn derive_file_name(url: &str, content_type: Option<&str>) -> Option<String> {
    let u = Url::parse(url.trim()).ok()?;
    let mut raw = String::new();
    raw.push_str(u.host_str().unwrap_or(""));
    raw.push_str(u.path());
    if let Some(q) = u.query() {
        raw.push('?');
        raw.push_str(q);
    }
    let base = sanitize(&raw);

    if path_extension(u.path()).is_some() {
        return Some(base);
    }
    match content_type.and_then(extension_for_content_type) {
        Some(ext) => Some(format!("{}{}", base, ext)),
        None => Some(format!("{}{}", base, UNKNOWN_BINARY_SUFFIX)),
    }
}

pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect()
}

/// Extension of the last path segment, dot included. A leading dot
/// (`/.htaccess`) does not count as an extension.
pub fn path_extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&segment[idx..]),
    }
}

pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let ct = content_type.to_ascii_lowercase();
    CONTENT_TYPE_EXTENSIONS
        .iter()
        .find(|(needle, _)| ct.contains(needle))
        .map(|(_, ext)| *ext)
}

/// Alternative name for a resource whose derived name is already taken by a
/// different URL in the same session. Depends only on the URL and the name.
pub fn disambiguate(file_name: &str, canonical_url: &str) -> String {
    let digest = hex::encode(Sha256::digest(canonical_url.as_bytes()));
    format!("{}-{}", &digest[..8], file_name)
}
