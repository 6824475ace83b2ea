//! Plugin registry and completion runner.
//!
//! Anything that must finish before the page is captured registers itself as
//! a plugin. The runner drains the registry strictly in registration order,
//! settles each plugin (a failure is logged and recorded, never propagated),
//! and finally flags `<body>` with the completion class the external capture
//! tool waits for. The flag is set unconditionally: even a page whose every
//! plugin failed must not leave the capture tool waiting forever.

use std::future::Future;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::dom::{self, SharedDocument};
use crate::Result;

/// Class added to `<body>` once every registered plugin has settled.
pub const DONE_CLASS: &str = "done";

/// A registered pre-capture task. Invoked exactly once by the runner.
pub type Plugin = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Append-only collector of pre-capture tasks.
///
/// The registry is an explicit object owned by the session and handed to the
/// runner by value, so registering after the drain has begun does not
/// compile. Plugin identity is registration order.
#[derive(Default)]
pub struct PluginRegistry {
    tasks: Vec<Plugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a zero-argument asynchronous task.
    pub fn register<F, Fut>(&mut self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(Box::new(move || {
            let fut: BoxFuture<'static, Result<()>> = Box::pin(task());
            fut
        }));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Terminal state of one settled unit of work.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum Settled {
    Ok,
    Failed(String),
}

impl Settled {
    pub fn is_ok(&self) -> bool {
        matches!(self, Settled::Ok)
    }
}

/// Await a fallible unit of work and capture its outcome without letting a
/// failure escape.
pub async fn settle<F>(fut: F) -> Settled
where
    F: Future<Output = Result<()>>,
{
    match fut.await {
        Ok(()) => Settled::Ok,
        Err(e) => Settled::Failed(e.to_string()),
    }
}

/// The recorded fate of one plugin. `index` is the registration order.
#[derive(Debug, Clone, Serialize)]
pub struct PluginOutcome {
    pub index: usize,
    pub settled: Settled,
}

/// Drain the registry sequentially, then flag the page as ready for capture.
///
/// Plugins run one at a time in registration order; a plugin does not start
/// until its predecessor has settled. Sequencing bounds resource contention
/// and keeps failure attribution in the log unambiguous. After the last
/// plugin settles the completion class goes onto `<body>` regardless of how
/// many plugins failed.
pub async fn run_to_completion(
    registry: PluginRegistry,
    doc: &SharedDocument,
) -> Vec<PluginOutcome> {
    let mut outcomes = Vec::with_capacity(registry.tasks.len());
    for (index, task) in registry.tasks.into_iter().enumerate() {
        let settled = settle(task()).await;
        match &settled {
            Settled::Ok => log::debug!("plugin #{index} settled"),
            Settled::Failed(msg) => log::error!("plugin #{index} failed: {msg}"),
        }
        outcomes.push(PluginOutcome { index, settled });
    }

    dom::lock(doc).add_body_class(DONE_CLASS);
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;
    use crate::Error;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn empty_page() -> SharedDocument {
        Document::parse("<html><body></body></html>").into_shared()
    }

    #[tokio::test]
    async fn test_plugins_run_sequentially_in_registration_order() {
        let doc = empty_page();
        let events: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();

        // If the runner overlapped plugins, the sleeping first plugin would
        // record its event after the second one.
        let ev = events.clone();
        registry.register(move || async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            ev.lock().unwrap().push(1);
            Ok(())
        });
        let ev = events.clone();
        registry.register(move || async move {
            ev.lock().unwrap().push(2);
            Ok(())
        });
        let ev = events.clone();
        registry.register(move || async move {
            ev.lock().unwrap().push(3);
            Ok(())
        });

        let outcomes = run_to_completion(registry, &doc).await;
        assert_eq!(*events.lock().unwrap(), vec![1, 2, 3]);
        assert!(outcomes.iter().all(|o| o.settled.is_ok()));
    }

    #[tokio::test]
    async fn test_failed_plugin_does_not_block_later_plugins() {
        let doc = empty_page();
        let events: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();

        let ev = events.clone();
        registry.register(move || async move {
            ev.lock().unwrap().push(1);
            Ok(())
        });
        registry.register(|| async { Err(Error::PluginError("boom".into())) });
        let ev = events.clone();
        registry.register(move || async move {
            ev.lock().unwrap().push(3);
            Ok(())
        });

        let outcomes = run_to_completion(registry, &doc).await;
        assert_eq!(*events.lock().unwrap(), vec![1, 3]);
        assert!(outcomes[0].settled.is_ok());
        assert!(matches!(outcomes[1].settled, Settled::Failed(_)));
        assert!(outcomes[2].settled.is_ok());
        assert!(doc.lock().unwrap().body_has_class(DONE_CLASS));
    }

    #[tokio::test]
    async fn test_done_flag_set_once_even_when_every_plugin_fails() {
        let doc = empty_page();
        let mut registry = PluginRegistry::new();
        registry.register(|| async { Err(Error::PluginError("a".into())) });
        registry.register(|| async { Err(Error::PluginError("b".into())) });

        let outcomes = run_to_completion(registry, &doc).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.settled.is_ok()));

        let doc = doc.lock().unwrap();
        assert!(doc.body_has_class(DONE_CLASS));
        // exactly once: the class attribute holds a single `done`
        let body = doc.body().unwrap();
        assert_eq!(doc.attribute(body, "class"), Some(DONE_CLASS));
    }

    #[tokio::test]
    async fn test_empty_registry_still_flags_completion() {
        let doc = empty_page();
        let outcomes = run_to_completion(PluginRegistry::new(), &doc).await;
        assert!(outcomes.is_empty());
        assert!(doc.lock().unwrap().body_has_class(DONE_CLASS));
    }

    #[tokio::test]
    async fn test_settle_captures_failure_without_propagating() {
        assert_eq!(settle(async { Ok(()) }).await, Settled::Ok);
        let failed = settle(async { Err(Error::Other("nope".into())) }).await;
        assert_eq!(failed, Settled::Failed("nope".to_string()));
    }
}
