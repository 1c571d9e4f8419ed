//! File identity resolution.
//!
//! A remote file is identified by a [`FileId`] derived from its URL. Volatile
//! query parameters (session tokens, download markers), revision path segments
//! and the fragment are removed before hashing, so the same logical resource
//! keeps one identity while its URL churns. The identity keeps a readable
//! filename in front of the hash so stored files stay recognisable on disk.

use crate::hash::ContentHash;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Query parameters that never change which resource a URL points at.
const VOLATILE_PARAMS: &[&str] = &["token", "forcedownload", "preview", "offline"];

const TOKEN_PLUGINFILE: &str = "/tokenpluginfile.php/";
const WEBSERVICE_PLUGINFILE: &str = "/webservice/pluginfile.php/";

/// Path segment that precedes a numeric revision (`.../content/<rev>/...`).
const REVISION_SEGMENT: &str = "content";

/// Query parameter that embeds the real filename in some download endpoints.
const FILE_PARAM: &str = "file";

const MAX_FILENAME_LEN: usize = 100;
const MAX_EXTENSION_LEN: usize = 8;
const FALLBACK_FILENAME: &str = "file";

/// Stable identifier of a remote file inside the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Derive the identity of the resource a URL points at.
    pub fn from_url(url: &str) -> Self {
        let normalized = normalize_url(url);
        let filename = guess_filename(&normalized);
        let hash = ContentHash::compute(normalized.as_bytes()).identity_hex();
        let id = match split_extension(&filename) {
            Some((stem, ext)) => format!("{stem}_{hash}.{ext}"),
            None => format!("{filename}_{hash}"),
        };
        Self(id)
    }

    /// Wrap an identifier read back from storage.
    pub fn from_stored(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extension carried over from the guessed filename, if any.
    pub fn extension(&self) -> Option<&str> {
        split_extension(&self.0).map(|(_, ext)| ext)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical form of a URL used for hashing.
///
/// Decodes HTML-escaped ampersands, drops the fragment, rewrites token-scoped
/// download paths to their plain form, zeroes the revision segment, removes
/// volatile query parameters and finally percent-decodes the result.
pub fn normalize_url(url: &str) -> String {
    let unescaped = url.trim().replace("&amp;", "&");
    let canonical = canonical_download_path(strip_fragment(&unescaped));

    let stripped = match Url::parse(&canonical) {
        Ok(mut parsed) => {
            zero_revision_segment(&mut parsed);
            strip_volatile_params(&mut parsed);
            parsed.to_string()
        }
        Err(_) => canonical,
    };

    percent_decode_str(&stripped).decode_utf8_lossy().into_owned()
}

/// Remove session tokens and download markers from a URL's query string.
///
/// Unparseable input is returned unchanged.
pub fn remove_volatile_params(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            strip_volatile_params(&mut parsed);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Numeric revision embedded in the URL path, if present.
pub fn revision_from_url(url: &str) -> Option<i64> {
    let path = strip_query(strip_fragment(url));
    let segments: Vec<&str> = path.split('/').collect();
    revision_position(&segments).and_then(|i| segments[i].parse().ok())
}

/// The URL without its `#fragment`.
pub fn strip_fragment(url: &str) -> &str {
    url.split_once('#').map_or(url, |(head, _)| head)
}

/// The fragment of a URL (without `#`), if it has a non-empty one.
pub fn url_fragment(url: &str) -> Option<&str> {
    url.split_once('#')
        .map(|(_, fragment)| fragment)
        .filter(|fragment| !fragment.is_empty())
}

/// Append a fragment taken from `original_url` to a resolved location.
pub fn with_fragment_of(location: String, original_url: &str) -> String {
    match url_fragment(original_url) {
        Some(fragment) => format!("{location}#{fragment}"),
        None => location,
    }
}

/// Best guess of the filename a URL downloads to.
///
/// Prefers a `file=` query parameter, then the last path segment.
pub fn guess_filename(url: &str) -> String {
    let url = strip_fragment(url);
    let (path, query) = url.split_once('?').unwrap_or((url, ""));

    let from_param = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == FILE_PARAM)
        .and_then(|(_, value)| last_segment(value));

    let raw = from_param
        .or_else(|| last_segment(path.split_once("://").map_or(path, |(_, rest)| rest)))
        .unwrap_or(FALLBACK_FILENAME);

    let sanitized = sanitize_filename(raw);
    if sanitized.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Replace characters that are unsafe in file names.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_replacement = false;
    for c in name.chars() {
        let unsafe_char = matches!(c, '#' | ':' | '/' | '?' | '\\' | '*' | '"' | '<' | '>' | '|')
            || c.is_control();
        if unsafe_char {
            if !last_was_replacement {
                out.push('_');
            }
            last_was_replacement = true;
        } else {
            out.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = out.trim();
    match trimmed.char_indices().nth(MAX_FILENAME_LEN) {
        Some((cut, _)) => trimmed[..cut].to_string(),
        None => trimmed.to_string(),
    }
}

/// Split `name` into stem and a short alphanumeric extension.
pub fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some((stem, ext))
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(head, _)| head)
}

fn last_segment(path: &str) -> Option<&str> {
    path.rsplit('/').find(|segment| !segment.is_empty())
}

fn canonical_download_path(url: &str) -> String {
    let Some(start) = url.find(TOKEN_PLUGINFILE) else {
        return url.to_string();
    };
    let rest = &url[start + TOKEN_PLUGINFILE.len()..];
    match rest.split_once('/') {
        Some((_token, tail)) => format!("{}{WEBSERVICE_PLUGINFILE}{tail}", &url[..start]),
        None => url.to_string(),
    }
}

/// Index of the revision segment; a filename must follow it.
fn revision_position(segments: &[&str]) -> Option<usize> {
    segments
        .windows(3)
        .position(|w| {
            w[0] == REVISION_SEGMENT
                && !w[1].is_empty()
                && w[1].chars().all(|c| c.is_ascii_digit())
                && !w[2].is_empty()
        })
        .map(|i| i + 1)
}

fn zero_revision_segment(parsed: &mut Url) {
    let path = parsed.path().to_string();
    let mut segments: Vec<&str> = path.split('/').collect();
    if let Some(i) = revision_position(&segments) {
        segments[i] = "0";
        parsed.set_path(&segments.join("/"));
    }
}

fn is_volatile(key: &str) -> bool {
    VOLATILE_PARAMS.iter().any(|p| key.eq_ignore_ascii_case(p))
}

fn strip_volatile_params(parsed: &mut Url) {
    if parsed.query().is_none() {
        return;
    }

    // Always re-serialise so encodings of kept pairs are uniform.
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !is_volatile(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(kept);
    }
}
