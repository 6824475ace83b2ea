//! In-memory resource store issuing local handles for fetched bytes.
//!
//! A handle is the in-page counterpart of a browser object URL: once bytes
//! are in the store, anything referencing the handle can be rendered without
//! further network access. Handles are content-addressed, so fetching the
//! same bytes twice yields the same handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use url::Url;

use crate::dom::Document;
use crate::{Error, Result};

/// Prefix shared by every handle issued by a [`ResourceStore`].
pub const HANDLE_PREFIX: &str = "blob:pageprep/";

// Hex characters following the prefix (first 16 digest bytes)
const HANDLE_DIGEST_LEN: usize = 32;

/// Fetched binary content plus its mime type.
#[derive(Debug, Clone)]
pub struct Resource {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Thread-safe map from handle to stored resource.
#[derive(Debug, Default)]
pub struct ResourceStore {
    objects: Mutex<HashMap<String, Arc<Resource>>>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes and return their handle.
    pub fn insert(&self, bytes: Vec<u8>, mime: impl Into<String>) -> String {
        let digest = Sha256::digest(&bytes);
        let handle = format!("{HANDLE_PREFIX}{}", hex::encode(&digest[..16]));
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.entry(handle.clone()).or_insert_with(|| {
            Arc::new(Resource {
                bytes,
                mime: mime.into(),
            })
        });
        handle
    }

    /// Look up a stored resource by handle.
    pub fn get(&self, handle: &str) -> Option<Arc<Resource>> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.get(handle).cloned()
    }

    /// Base64 `data:` URL for a stored resource, usable without the store.
    pub fn data_url(&self, handle: &str) -> Result<String> {
        let resource = self
            .get(handle)
            .ok_or_else(|| Error::ResourceError(handle.to_string()))?;
        Ok(format!(
            "data:{};base64,{}",
            resource.mime,
            BASE64.encode(&resource.bytes)
        ))
    }

    pub fn len(&self) -> usize {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch a URL and store the response body, returning the handle.
    ///
    /// A non-OK status is a fetch failure: the capture pipeline must never
    /// end up rendering an error page's body as an image.
    pub async fn fetch_into(&self, client: &reqwest::Client, url: &Url) -> Result<String> {
        log::debug!("fetching `{url}`");
        let resp = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::FetchError(format!("GET {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::FetchError(format!("GET {url} failed: {e}")))?;

        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::FetchError(format!("reading body of {url} failed: {e}")))?;

        Ok(self.insert(bytes.to_vec(), mime))
    }
}

/// Replace every store handle occurring in attribute values (including
/// inline styles) with its `data:` URL, making the document self-contained.
pub fn inline_handles(doc: &mut Document, store: &ResourceStore) {
    doc.rewrite_attribute_values(|value| {
        if !value.contains(HANDLE_PREFIX) {
            return None;
        }
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(pos) = rest.find(HANDLE_PREFIX) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            let end = HANDLE_PREFIX.len() + HANDLE_DIGEST_LEN;
            // `get` also rejects an `end` that falls inside a multibyte char
            let is_handle = tail
                .get(HANDLE_PREFIX.len()..end)
                .map_or(false, |digest| digest.bytes().all(|b| b.is_ascii_hexdigit()));
            if is_handle {
                let handle = &tail[..end];
                match store.data_url(handle) {
                    Ok(data) => out.push_str(&data),
                    // Unknown handle: leave it alone rather than corrupt the page
                    Err(e) => {
                        log::warn!("cannot inline: {e}");
                        out.push_str(handle);
                    }
                }
                rest = &tail[end..];
            } else {
                out.push_str(HANDLE_PREFIX);
                rest = &tail[HANDLE_PREFIX.len()..];
            }
        }
        out.push_str(rest);
        Some(out)
    });
}
