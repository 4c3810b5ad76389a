//! Handler and event routing.
//!
//! Plugins register tool handlers and event handlers here. Tool handlers are
//! invoked by pipeline stage 6 with the request context and a per-plugin
//! services view; event handlers fan out on topic prefixes.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::protocol::{Envelope, HandlerError};
use crate::services::CoreServices;
use crate::types::{Error, Result};

use super::context::RequestContext;

/// A tool implementation living in the host trust domain.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: RequestContext,
        arguments: Map<String, Value>,
        services: CoreServices,
    ) -> std::result::Result<Value, HandlerError>;
}

/// A registered handler and the plugin that owns it.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub plugin: String,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

/// Tool name → handler registry.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerRegistration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a tool. One handler per tool.
    pub fn register(
        &self,
        plugin: impl Into<String>,
        tool: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        let tool = tool.into();
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        if handlers.contains_key(&tool) {
            return Err(Error::validation(format!(
                "tool {} already has a handler",
                tool
            )));
        }
        handlers.insert(
            tool,
            HandlerRegistration {
                plugin: plugin.into(),
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, tool: &str) -> Option<HandlerRegistration> {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .get(tool)
            .cloned()
    }

    /// Remove one tool's handler.
    pub fn unregister_tool(&self, tool: &str) -> bool {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .remove(tool)
            .is_some()
    }

    /// Remove every handler a plugin registered (plugin unload). Returns the
    /// number removed.
    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        let before = handlers.len();
        handlers.retain(|_, reg| reg.plugin != plugin);
        before - handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().expect("handler registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A subscriber for inbound events routed by topic prefix.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, envelope: Envelope);
}

/// Topic-prefix → event handler fan-out.
#[derive(Default)]
pub struct EventDispatcher {
    routes: RwLock<Vec<(String, Arc<dyn EventHandler>)>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.routes.read().expect("event routes poisoned");
        f.debug_struct("EventDispatcher")
            .field("routes", &routes.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, prefix: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.routes
            .write()
            .expect("event routes poisoned")
            .push((prefix.into(), handler));
    }

    /// Deliver an event to every handler whose prefix matches. Each handler
    /// runs as its own task so one slow handler cannot stall the rest.
    pub fn dispatch(&self, envelope: &Envelope) {
        let routes = self.routes.read().expect("event routes poisoned");
        for (prefix, handler) in routes.iter() {
            if !envelope.topic.starts_with(prefix.as_str()) {
                continue;
            }
            let handler = handler.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                handler.on_event(envelope).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerId, GroupId};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn handle(
            &self,
            _ctx: RequestContext,
            _arguments: Map<String, Value>,
            _services: CoreServices,
        ) -> std::result::Result<Value, HandlerError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry
            .register("mailer", "send_email", Arc::new(NoopHandler))
            .unwrap();

        let reg = registry.get("send_email").unwrap();
        assert_eq!(reg.plugin, "mailer");
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn duplicate_tool_registration_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .register("mailer", "send_email", Arc::new(NoopHandler))
            .unwrap();
        assert!(registry
            .register("other", "send_email", Arc::new(NoopHandler))
            .is_err());
    }

    #[test]
    fn unregister_plugin_removes_all_its_tools() {
        let registry = HandlerRegistry::new();
        registry
            .register("mailer", "send_email", Arc::new(NoopHandler))
            .unwrap();
        registry
            .register("mailer", "list_inbox", Arc::new(NoopHandler))
            .unwrap();
        registry
            .register("files", "read_file", Arc::new(NoopHandler))
            .unwrap();

        assert_eq!(registry.unregister_plugin("mailer"), 2);
        assert!(registry.get("send_email").is_none());
        assert!(registry.get("read_file").is_some());
    }

    struct CountingEventHandler {
        seen: Arc<AtomicUsize>,
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl EventHandler for CountingEventHandler {
        async fn on_event(&self, envelope: Envelope) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(envelope.topic);
        }
    }

    #[tokio::test]
    async fn events_route_by_prefix() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(
            "session.",
            Arc::new(CountingEventHandler {
                seen: seen.clone(),
                tx,
            }),
        );

        let envelope = Envelope::event(
            "session.started",
            ContainerId::from_string("host".into()).unwrap(),
            GroupId::from_string("sys".into()).unwrap(),
            json!({}),
        );
        dispatcher.dispatch(&envelope);

        assert_eq!(rx.recv().await.unwrap(), "session.started");
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let other = Envelope::event(
            "tool.result",
            ContainerId::from_string("host".into()).unwrap(),
            GroupId::from_string("sys".into()).unwrap(),
            json!({}),
        );
        dispatcher.dispatch(&other);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
