//! pageprep
//!
//! Prepares a server-rendered HTML page for headless screenshot capture: it
//! resolves resources referenced by marker attributes into locally
//! addressable handles, runs arbitrary pre-capture plugins, and flags the
//! page body once everything has settled so an external screenshot tool can
//! wait for a single DOM marker (`body.done`) instead of polling network
//! state.
//!
//! # Page contract
//!
//! - `data-background-image="<url>"`: fetched and applied as the element's
//!   `background-image`, then removed.
//! - `data-src="<url>"`: fetched and applied as the `src` of an `<img>`,
//!   then removed.
//! - Plugins registered on the session run after page parse, strictly in
//!   registration order; the `done` class lands on `<body>` once all of
//!   them have settled, no matter how many failed.
//!
//! # Example
//!
//! ```no_run
//! use pageprep::{PrepConfig, PrepSession};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let html = r#"<html><body><img data-src="https://example.com/a.png"></body></html>"#;
//!
//! let mut session = PrepSession::new(html, PrepConfig::default())?;
//! session.register(|| async {
//!     // page-author extension point: font loading, layout stabilization, ...
//!     Ok(())
//! });
//!
//! let prepared = session.run().await;
//! assert!(prepared.is_done());
//! println!("{}", prepared.html());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

pub mod dom;
pub mod error;
pub mod loader;
pub mod plugins;
pub mod resources;

pub use dom::{Document, ElementId, SharedDocument};
pub use error::{Error, Result};
pub use loader::{prop_setters, LazyLoader, PropSetter};
pub use plugins::{run_to_completion, PluginOutcome, PluginRegistry, Settled, DONE_CLASS};
pub use resources::{inline_handles, Resource, ResourceStore, HANDLE_PREFIX};

/// Configuration for a preparation session
///
/// The defaults are chosen to match the behavior the capture tool expects:
/// no fetch timeout (the tool owns the outer deadline) and a browser-like
/// user agent that identifies pageprep.
///
/// # Examples
///
/// ```
/// let cfg = pageprep::PrepConfig::default();
/// assert!(cfg.user_agent.contains("pageprep"));
/// assert!(cfg.timeout_ms.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct PrepConfig {
    /// User agent string to send with resource requests
    pub user_agent: String,
    /// Per-request timeout in milliseconds. `None` means no timeout: a hung
    /// fetch delays the completion flag until the capture tool's own
    /// deadline fires.
    pub timeout_ms: Option<u64>,
    /// Extra headers sent with every resource request
    pub headers: HashMap<String, String>,
    /// Base URL for resolving relative marker-attribute references
    pub base_url: Option<String>,
}

impl Default for PrepConfig {
    fn default() -> Self {
        Self {
            user_agent:
                "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/115.0 pageprep/0.1"
                    .to_string(),
            timeout_ms: None,
            headers: HashMap::new(),
            base_url: None,
        }
    }
}

/// One page-preparation run: parsed document, resource store, and the
/// plugin registry to drain.
///
/// The session registers the lazy resource loader as its first plugin;
/// page authors append theirs with [`PrepSession::register`] before calling
/// [`PrepSession::run`]. `run` consumes the session, so late registration
/// after the drain has begun does not compile.
pub struct PrepSession {
    doc: SharedDocument,
    store: Arc<ResourceStore>,
    registry: PluginRegistry,
}

impl std::fmt::Debug for PrepSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepSession")
            .field("doc", &self.doc)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PrepSession {
    /// Parse the page and set up the HTTP client, resource store, and
    /// registry (with the lazy loader already registered).
    pub fn new(html: &str, config: PrepConfig) -> Result<Self> {
        let base_url = match &config.base_url {
            Some(raw) => Some(
                Url::parse(raw)
                    .map_err(|e| Error::ConfigError(format!("invalid base URL `{raw}`: {e}")))?,
            ),
            None => None,
        };

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name: reqwest::header::HeaderName = name
                .parse()
                .map_err(|e| Error::ConfigError(format!("invalid header name `{name}`: {e}")))?;
            let header_value: reqwest::header::HeaderValue = value
                .parse()
                .map_err(|e| Error::ConfigError(format!("invalid value for header `{name}`: {e}")))?;
            headers.insert(header_name, header_value);
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers);
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let client = builder
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build HTTP client: {e}")))?;

        let doc = Document::parse(html).into_shared();
        let store = Arc::new(ResourceStore::new());

        let mut registry = PluginRegistry::new();
        let loader = LazyLoader::new(client, store.clone(), doc.clone(), base_url);
        registry.register(move || async move {
            loader.load_all().await;
            Ok(())
        });

        Ok(Self {
            doc,
            store,
            registry,
        })
    }

    /// Append a pre-capture plugin. Plugins run after the lazy loader, in
    /// registration order.
    pub fn register<F, Fut>(&mut self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register(task);
    }

    /// Shared handle to the document, for plugins that mutate the page.
    pub fn document(&self) -> SharedDocument {
        self.doc.clone()
    }

    /// The session's resource store.
    pub fn store(&self) -> Arc<ResourceStore> {
        self.store.clone()
    }

    /// Number of registered plugins, the lazy loader included.
    pub fn plugin_count(&self) -> usize {
        self.registry.len()
    }

    /// Drain all plugins and flag the page. Never fails: per-plugin
    /// failures are settled into the returned page's outcome list and the
    /// completion flag is set regardless.
    pub async fn run(self) -> PreparedPage {
        let outcomes = run_to_completion(self.registry, &self.doc).await;
        PreparedPage {
            document: self.doc,
            store: self.store,
            outcomes,
        }
    }
}

/// A page whose plugins have all settled.
pub struct PreparedPage {
    document: SharedDocument,
    store: Arc<ResourceStore>,
    outcomes: Vec<PluginOutcome>,
}

impl PreparedPage {
    /// Serialized HTML of the prepared page. Resource references point into
    /// the session's store via `blob:pageprep/...` handles.
    pub fn html(&self) -> String {
        dom::lock(&self.document).to_html()
    }

    /// Self-contained variant with every store handle replaced by its
    /// `data:` URL; renderable with no store and no network.
    pub fn inlined_html(&self) -> String {
        let mut doc = dom::lock(&self.document).clone();
        inline_handles(&mut doc, &self.store);
        doc.to_html()
    }

    /// Whether `<body>` carries the completion class.
    pub fn is_done(&self) -> bool {
        dom::lock(&self.document).body_has_class(DONE_CLASS)
    }

    /// Per-plugin outcomes in registration order.
    pub fn outcomes(&self) -> &[PluginOutcome] {
        &self.outcomes
    }

    pub fn document(&self) -> SharedDocument {
        self.document.clone()
    }

    pub fn store(&self) -> Arc<ResourceStore> {
        self.store.clone()
    }
}

/// Convenience wrapper for the no-extra-plugins path.
pub async fn prepare(html: &str, config: PrepConfig) -> Result<PreparedPage> {
    Ok(PrepSession::new(html, config)?.run().await)
}
