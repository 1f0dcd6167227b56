// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Content sources: where module bytes come from.
//!
//! The loader treats storage as an opaque capability. A [`ContentSource`]
//! answers "found", "not found", or fails; it never interprets content.

use crate::error::{LoaderError, Result};
use crate::hooks::{LoadRequest, Loaded};
use crate::registry::ModuleFormat;
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use std::sync::Arc;

/// Source text of a module as handed to load hooks and the evaluator
#[derive(Debug, Clone, Default)]
pub struct SourceText {
    bytes: Bytes,
}

impl SourceText {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Raw content
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Content as UTF-8, if valid
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Content length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the content is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<&str> for SourceText {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for SourceText {
    fn from(s: String) -> Self {
        Self::from_bytes(s.into_bytes())
    }
}

/// Capability to read content at a resolved location.
///
/// `Ok(None)` means the location has no content; `Err` means the backing
/// store was unreadable. The async variant defaults to the blocking read so
/// simple sources only implement `read_sync`.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Blocking read used by the synchronous pipeline
    fn read_sync(&self, location: &str) -> Result<Option<Bytes>>;

    /// Suspending read used by the asynchronous pipeline
    async fn read(&self, location: &str) -> Result<Option<Bytes>> {
        self.read_sync(location)
    }
}

/// Reads modules from the local filesystem
#[derive(Debug, Default)]
pub struct FsSource;

#[async_trait]
impl ContentSource for FsSource {
    fn read_sync(&self, location: &str) -> Result<Option<Bytes>> {
        match std::fs::read(location) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, location: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(location).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decode a `data:` URL into its mime type and payload.
///
/// Supports `;base64` payloads and percent-encoded plain payloads. An empty
/// mime defaults to `text/plain` per RFC 2397.
pub fn decode_data_url(url: &str) -> Result<(String, Bytes)> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| LoaderError::InvalidSpecifier(url.to_string()))?;
    let Some((meta, payload)) = rest.split_once(',') else {
        return Err(LoaderError::InvalidSpecifier(url.to_string()));
    };

    if let Some(mime) = meta.strip_suffix(";base64") {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.as_bytes())
            .map_err(|e| LoaderError::load_failed(url, format!("invalid base64 payload: {e}")))?;
        Ok((normalize_mime(mime), Bytes::from(bytes)))
    } else {
        Ok((normalize_mime(meta), percent_decode(payload)))
    }
}

fn normalize_mime(mime: &str) -> String {
    // Parameters (";charset=...") are irrelevant to format detection
    let mime = mime.split(';').next().unwrap_or("");
    if mime.is_empty() {
        "text/plain".to_string()
    } else {
        mime.to_ascii_lowercase()
    }
}

fn percent_decode(payload: &str) -> Bytes {
    fn hex(b: u8) -> Option<u8> {
        (b as char).to_digit(16).map(|d| d as u8)
    }

    let raw = payload.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            if let (Some(hi), Some(lo)) = (hex(raw[i + 1]), hex(raw[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    Bytes::from(out)
}

/// The innermost load link: serves inline content produced during
/// resolution, otherwise reads through the content source.
pub(crate) struct DefaultLoad {
    content: Arc<dyn ContentSource>,
}

impl DefaultLoad {
    pub(crate) fn new(content: Arc<dyn ContentSource>) -> Self {
        Self { content }
    }

    pub(crate) fn load(&self, request: &LoadRequest) -> Result<Loaded> {
        let source = match &request.source {
            Some(text) => text.clone(),
            None => match self.content.read_sync(&request.id)? {
                Some(bytes) => SourceText::from_bytes(bytes),
                None => {
                    return Err(LoaderError::load_failed(
                        &request.id,
                        "no content available at this location",
                    ));
                }
            },
        };
        verify_format(&request.id, request.format, &source)?;
        Ok(Loaded {
            format: request.format,
            source,
            short_circuit: false,
        })
    }

    pub(crate) async fn load_async(&self, request: &LoadRequest) -> Result<Loaded> {
        let source = match &request.source {
            Some(text) => text.clone(),
            None => match self.content.read(&request.id).await? {
                Some(bytes) => SourceText::from_bytes(bytes),
                None => {
                    return Err(LoaderError::load_failed(
                        &request.id,
                        "no content available at this location",
                    ));
                }
            },
        };
        verify_format(&request.id, request.format, &source)?;
        Ok(Loaded {
            format: request.format,
            source,
            short_circuit: false,
        })
    }
}

/// Cheap sanity checks that content can be what its format claims
fn verify_format(id: &str, format: ModuleFormat, source: &SourceText) -> Result<()> {
    match format {
        ModuleFormat::Json => {
            serde_json::from_slice::<serde_json::Value>(source.as_bytes())
                .map_err(|e| LoaderError::format_mismatch(id, format!("not valid JSON: {e}")))?;
        }
        ModuleFormat::CommonJs | ModuleFormat::Esm | ModuleFormat::DataUrl => {
            if source.as_str().is_none() {
                return Err(LoaderError::format_mismatch(id, "source is not valid UTF-8"));
            }
        }
        // Addon payloads are opaque to the loader; built-ins never load
        ModuleFormat::Addon | ModuleFormat::Builtin => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_source_missing_file() {
        let source = FsSource;
        let result = source.read_sync("/nonexistent/definitely/not/here.js").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_plain_data_url() {
        let (mime, bytes) = decode_data_url("data:text/javascript,export%20const%20x%3D1").unwrap();
        assert_eq!(mime, "text/javascript");
        assert_eq!(&bytes[..], b"export const x=1");
    }

    #[test]
    fn test_decode_base64_data_url() {
        // "export const x = 1" base64-encoded
        let (mime, bytes) =
            decode_data_url("data:text/javascript;base64,ZXhwb3J0IGNvbnN0IHggPSAx").unwrap();
        assert_eq!(mime, "text/javascript");
        assert_eq!(&bytes[..], b"export const x = 1");
    }

    #[test]
    fn test_decode_defaults_mime() {
        let (mime, _) = decode_data_url("data:,hello").unwrap();
        assert_eq!(mime, "text/plain");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_data_url("data:no-comma").is_err());
        assert!(matches!(
            decode_data_url("data:;base64,!!!"),
            Err(LoaderError::LoadFailed { .. })
        ));
    }

    #[test]
    fn test_verify_json_format() {
        let good = SourceText::from(r#"{"a": 1}"#);
        assert!(verify_format("m.json", ModuleFormat::Json, &good).is_ok());
        let bad = SourceText::from("not json");
        assert!(matches!(
            verify_format("m.json", ModuleFormat::Json, &bad),
            Err(LoaderError::FormatMismatch { .. })
        ));
    }
}
