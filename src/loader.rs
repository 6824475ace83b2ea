//! Lazy resource loader: resolves marker-attribute references into store
//! handles before capture.
//!
//! Page templates mark deferred resources with `data-background-image` or
//! `data-src`. The loader fetches each referenced URL, stores the bytes, and
//! applies the handle through the setter associated with the attribute; the
//! marker attribute is removed only after the setter ran, so a failed load
//! leaves the attribute in place and the element distinguishable from a
//! processed one.

use std::sync::Arc;

use futures::future::join_all;
use url::Url;

use crate::dom::{self, Document, ElementId, SharedDocument};
use crate::plugins::{settle, Settled};
use crate::resources::ResourceStore;
use crate::{Error, Result};

/// Applies a loaded resource handle to an element.
///
/// Setters must not fail for elements of the wrong kind: a setter that does
/// not apply to the element's tag silently does nothing.
pub type PropSetter = fn(&mut Document, ElementId, &str);

/// The fixed lazy-attribute mapping. Keys are unique.
pub fn prop_setters() -> &'static [(&'static str, PropSetter)] {
    &[
        ("data-background-image", set_background_image),
        ("data-src", set_src),
    ]
}

fn set_background_image(doc: &mut Document, id: ElementId, handle: &str) {
    doc.append_style_declaration(id, "background-image", &format!("url({handle})"));
}

fn set_src(doc: &mut Document, id: ElementId, handle: &str) {
    if doc.tag_name(id) == "img" {
        doc.set_attribute(id, "src", handle);
    }
}

/// Scans the document for marker attributes and resolves them.
pub struct LazyLoader {
    client: reqwest::Client,
    store: Arc<ResourceStore>,
    doc: SharedDocument,
    base_url: Option<Url>,
}

impl LazyLoader {
    pub fn new(
        client: reqwest::Client,
        store: Arc<ResourceStore>,
        doc: SharedDocument,
        base_url: Option<Url>,
    ) -> Self {
        Self {
            client,
            store,
            doc,
            base_url,
        }
    }

    fn resolve_url(&self, raw: &str) -> Result<Url> {
        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base
                    .join(raw)
                    .map_err(|e| Error::FetchError(format!("cannot resolve `{raw}`: {e}"))),
                None => Err(Error::FetchError(format!(
                    "relative URL `{raw}` but no base URL configured"
                ))),
            },
            Err(e) => Err(Error::FetchError(format!("invalid URL `{raw}`: {e}"))),
        }
    }

    /// Resolve one marker attribute on one element.
    ///
    /// An absent or empty attribute is a no-op, not an error; a second pass
    /// over an already-processed element therefore does nothing.
    pub async fn load_one(&self, id: ElementId, attr: &str, setter: PropSetter) -> Result<()> {
        let raw = {
            let doc = dom::lock(&self.doc);
            doc.attribute(id, attr).map(str::to_string)
        };
        let Some(raw) = raw.filter(|v| !v.is_empty()) else {
            return Ok(());
        };

        let url = self.resolve_url(&raw)?;
        let handle = self.store.fetch_into(&self.client, &url).await?;

        let mut doc = dom::lock(&self.doc);
        setter(&mut doc, id, &handle);
        doc.remove_attribute(id, attr);
        log::debug!("resolved `{attr}` on <{}> to {handle}", doc.tag_name(id));
        Ok(())
    }

    /// Resolve every element under `<body>` carrying the given attribute.
    ///
    /// Per-element loads run concurrently; a failed element is logged and
    /// skipped so it cannot take the rest of the group down with it. Returns
    /// once every attempt has settled.
    pub async fn load_all_for_attribute(&self, attr: &'static str, setter: PropSetter) {
        let ids = {
            let doc = dom::lock(&self.doc);
            doc.elements_with_attribute(attr)
        };
        log::debug!("lazy-loading {} `{attr}` element(s)", ids.len());
        let attempts = ids.into_iter().map(|id| async move {
            if let Settled::Failed(msg) = settle(self.load_one(id, attr, setter)).await {
                log::error!("lazy load of `{attr}` element failed: {msg}");
            }
        });
        join_all(attempts).await;
    }

    /// Resolve all attribute groups concurrently. This is the task the
    /// session registers into the plugin registry; it settles every element
    /// and never fails itself.
    pub async fn load_all(&self) {
        let groups = prop_setters()
            .iter()
            .map(|&(attr, setter)| self.load_all_for_attribute(attr, setter));
        join_all(groups).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::HANDLE_PREFIX;

    fn shared(html: &str) -> SharedDocument {
        Document::parse(html).into_shared()
    }

    fn loader(doc: &SharedDocument) -> LazyLoader {
        LazyLoader::new(
            reqwest::Client::new(),
            Arc::new(ResourceStore::new()),
            doc.clone(),
            None,
        )
    }

    fn serve_png(body: &'static [u8]) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                if request.url().ends_with("/missing.png") {
                    let _ = request
                        .respond(tiny_http::Response::from_string("gone").with_status_code(404));
                } else {
                    let response = tiny_http::Response::from_data(body.to_vec()).with_header(
                        "Content-Type: image/png".parse::<tiny_http::Header>().unwrap(),
                    );
                    let _ = request.respond(response);
                }
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_load_all_resolves_markers() {
        // Skip on CI where network may not be available
        if std::env::var("CI").is_ok() {
            return;
        }

        let base = serve_png(b"pixels");
        let doc = shared(&format!(
            "<html><body>\
             <img data-src=\"{base}/a.png\">\
             <div class=\"main-background\" data-background-image=\"{base}/b.png\">x</div>\
             </body></html>"
        ));
        loader(&doc).load_all().await;

        let doc = doc.lock().unwrap();
        assert!(doc.elements_with_attribute("data-src").is_empty());
        assert!(doc.elements_with_attribute("data-background-image").is_empty());
        let html = doc.to_html();
        assert!(html.contains(&format!("src=\"{HANDLE_PREFIX}")));
        assert!(html.contains(&format!("background-image: url({HANDLE_PREFIX}")));
    }

    #[tokio::test]
    async fn test_failed_load_leaves_marker_in_place() {
        if std::env::var("CI").is_ok() {
            return;
        }

        let base = serve_png(b"pixels");
        let doc = shared(&format!(
            "<html><body><div data-background-image=\"{base}/missing.png\">x</div></body></html>"
        ));
        loader(&doc).load_all().await;

        let doc = doc.lock().unwrap();
        let marked = doc.elements_with_attribute("data-background-image");
        assert_eq!(marked.len(), 1);
        // rendering property untouched
        assert!(doc.attribute(marked[0], "style").is_none());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_element() {
        if std::env::var("CI").is_ok() {
            return;
        }

        let base = serve_png(b"pixels");
        let doc = shared(&format!(
            "<html><body>\
             <img data-src=\"{base}/missing.png\">\
             <img data-src=\"{base}/ok.png\">\
             </body></html>"
        ));
        loader(&doc).load_all().await;

        let doc = doc.lock().unwrap();
        let marked = doc.elements_with_attribute("data-src");
        assert_eq!(marked.len(), 1, "only the failed element keeps its marker");
        let html = doc.to_html();
        assert!(html.contains(&format!("src=\"{HANDLE_PREFIX}")));
    }

    #[tokio::test]
    async fn test_empty_and_absent_attributes_are_noops() {
        let doc = shared("<html><body><img data-src=\"\"><p>plain</p></body></html>");
        let before = doc.lock().unwrap().to_html();
        loader(&doc).load_all().await;
        let after = doc.lock().unwrap().to_html();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_src_setter_ignores_non_image_elements() {
        if std::env::var("CI").is_ok() {
            return;
        }

        let base = serve_png(b"pixels");
        let doc = shared(&format!(
            "<html><body><div data-src=\"{base}/a.png\">x</div></body></html>"
        ));
        loader(&doc).load_all().await;

        let doc = doc.lock().unwrap();
        // the load itself succeeded, so the marker is gone, but a <div>
        // cannot hold a source and gains no src attribute
        assert!(doc.elements_with_attribute("data-src").is_empty());
        assert!(!doc.to_html().contains("src="));
    }

    #[tokio::test]
    async fn test_relative_url_without_base_fails_load() {
        let doc = shared("<html><body><img data-src=\"img/a.png\"></body></html>");
        loader(&doc).load_all().await;
        let doc = doc.lock().unwrap();
        assert_eq!(doc.elements_with_attribute("data-src").len(), 1);
    }

    #[test]
    fn test_setter_map_keys_are_unique() {
        let mut keys: Vec<_> = prop_setters().iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), prop_setters().len());
    }
}
