//! Static asset sources for the terminal page.
//!
//! The terminal's `web_root` selects where the xterm.js bundle comes from:
//! the `PAYLOAD:/` prefix serves the compiled-in bundle, anything else is
//! treated as a filesystem tree. Both implement [`AssetProvider`] so the
//! HTTP handlers stay agnostic of the source.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// `web_root` values with this prefix select the compiled-in bundle.
pub const PAYLOAD_PREFIX: &str = "PAYLOAD:/";

const INDEX_HTML: &str = include_str!("../../assets/terminal/index.html");
const TERMINAL_JS: &str = include_str!("../../assets/terminal/terminal.js");
const TERMINAL_CSS: &str = include_str!("../../assets/terminal/terminal.css");

/// One servable asset.
pub struct Asset {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Debug)]
pub enum AssetError {
    NotFound,
    Io(std::io::Error),
}

impl fmt::Display for AssetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetError::NotFound => write!(f, "asset not found"),
            AssetError::Io(e) => write!(f, "asset read failed: {e}"),
        }
    }
}

/// Opaque source of static files.
pub trait AssetProvider: Send + Sync {
    /// Fetch the asset at `path` (relative, no leading slash; `""` and
    /// `"index.html"` both mean the terminal page).
    fn fetch(&self, path: &str) -> Result<Asset, AssetError>;
}

/// Pick a provider for the configured `web_root`.
pub fn provider_for(web_root: &str) -> Arc<dyn AssetProvider> {
    if web_root.starts_with(PAYLOAD_PREFIX) {
        Arc::new(PayloadAssets)
    } else {
        Arc::new(DirAssets::new(web_root))
    }
}

/// Compiled-in terminal bundle.
pub struct PayloadAssets;

impl AssetProvider for PayloadAssets {
    fn fetch(&self, path: &str) -> Result<Asset, AssetError> {
        let text = match path {
            "" | "index.html" => INDEX_HTML,
            "terminal.js" => TERMINAL_JS,
            "terminal.css" => TERMINAL_CSS,
            _ => return Err(AssetError::NotFound),
        };
        Ok(Asset {
            bytes: text.as_bytes().to_vec(),
            content_type: content_type_for(if path.is_empty() { "index.html" } else { path }),
        })
    }
}

/// Filesystem tree provider with traversal guarding.
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: &str) -> Self {
        Self {
            root: PathBuf::from(root),
        }
    }
}

impl AssetProvider for DirAssets {
    fn fetch(&self, path: &str) -> Result<Asset, AssetError> {
        let rel = if path.is_empty() { "index.html" } else { path };
        // Only plain relative components are accepted
        let candidate = Path::new(rel);
        if !candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(AssetError::NotFound);
        }
        let full = self.root.join(candidate);
        match std::fs::read(&full) {
            Ok(bytes) => Ok(Asset {
                bytes,
                content_type: content_type_for(rel),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AssetError::NotFound),
            Err(e) => Err(AssetError::Io(e)),
        }
    }
}

/// Infer a content type from the file extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" => "application/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Parse a single-range `Range` header against an asset of `len` bytes.
///
/// Returns the inclusive `(start, end)` byte span, or `None` when the header
/// is malformed, multi-range, or out of bounds (callers answer 416).
pub fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let ranges = header.strip_prefix("bytes=")?;
    if ranges.contains(',') {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    if start.is_empty() {
        // Suffix range: last N bytes
        let n: u64 = end.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((len.saturating_sub(n), len - 1));
    }
    let start: u64 = start.parse().ok()?;
    if start >= len {
        return None;
    }
    let end: u64 = if end.is_empty() {
        len - 1
    } else {
        end.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end.min(len - 1)))
}
