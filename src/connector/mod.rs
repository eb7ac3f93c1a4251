//! The connector boundary: the interface the mutation ledger
//! calls through to actually perform (and later reconcile) an external
//! side effect.
//!
//! This crate supplies the registry and the interception point that
//! guarantees a mutation row exists before any connector ever observes a
//! call; it does not ship concrete connector implementations (Gmail,
//! Slack, ...) — those are out of scope.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error returned by a connector call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorError {
    pub message: String,
    pub error_type: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl ConnectorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConnectorError {}

/// Outcome of a `reconcile` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReconcileOutcome {
    Applied { result: serde_json::Value },
    Failed { error: String },
    Retry,
}

/// A tool namespace's external-effect surface.
///
/// `call` performs the effect synchronously from the mutation ledger's
/// point of view: by the time it returns, the mutation row already exists
/// in `in_flight` status, so a crash mid-call is always recoverable.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The tool namespace this connector answers for, e.g. `"gmail"`.
    fn namespace(&self) -> &str;

    async fn call(
        &self,
        method: &str,
        params: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<serde_json::Value, ConnectorError>;

    /// Inquires whether an uncertain mutation actually took effect.
    /// Connectors that cannot reconcile simply never get asked — the
    /// mutation ledger falls back to `indeterminate` for those tools.
    async fn reconcile(
        &self,
        method: &str,
        params: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<ReconcileOutcome, ConnectorError> {
        let _ = (method, params, idempotency_key);
        Ok(ReconcileOutcome::Retry)
    }

    /// Whether `reconcile` is meaningfully implemented for this connector.
    /// The mutation ledger uses this to decide between `needs_reconcile`
    /// and `indeterminate` on an in-flight-at-crash mutation.
    fn supports_reconciliation(&self) -> bool {
        false
    }
}

/// Process-wide map from tool namespace to connector, built once from
/// configuration at startup.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.namespace().to_string(), connector);
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(namespace).cloned()
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("namespaces", &self.connectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoConnector;

    #[async_trait]
    impl Connector for EchoConnector {
        fn namespace(&self) -> &str {
            "echo"
        }

        async fn call(
            &self,
            _method: &str,
            params: &serde_json::Value,
            _idempotency_key: &str,
        ) -> Result<serde_json::Value, ConnectorError> {
            Ok(params.clone())
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_namespace() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(EchoConnector));

        let connector = registry.get("echo").expect("registered connector");
        let result = connector
            .call("send", &serde_json::json!({"x": 1}), "idem-1")
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));

        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn default_reconcile_is_retry_and_unsupported() {
        let connector = EchoConnector;
        assert!(!connector.supports_reconciliation());
        let outcome = connector
            .reconcile("send", &serde_json::json!({}), "idem-1")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Retry);
    }
}
