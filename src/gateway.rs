//! Gateway builder and server lifecycle.
//!
//! The lifecycle runs `Created → Starting → Running → (Reloading → Running)*
//! → Stopping → Stopped`. `start` builds the first snapshot and binds the
//! listener; on any failure the gateway returns to `Created` with the
//! listener released. `reload` publishes a fresh snapshot only on success —
//! the active one stays in place otherwise. `stop` refuses new requests and
//! drains in-flight handlers up to a grace deadline.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::graphql_client::GraphqlClient;
use crate::middleware::{Middleware, SharedMiddleware};
use crate::router;
use crate::snapshot::Snapshot;
use arc_swap::ArcSwap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared state behind the router: configuration, the active snapshot
/// pointer, the process-wide GraphQL client and the in-flight counter.
pub(crate) struct GatewayInner {
    pub(crate) config: GatewayConfig,
    pub(crate) snapshot: ArcSwap<Snapshot>,
    pub(crate) client: GraphqlClient,
    pub(crate) middlewares: Vec<SharedMiddleware>,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) accepting: AtomicBool,
}

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Reloading,
    Stopping,
    Stopped,
}

struct ServeHandle {
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Main Gateway struct - entry point for the library
pub struct Gateway {
    inner: Arc<GatewayInner>,
    state: Mutex<LifecycleState>,
    serve: Mutex<Option<ServeHandle>>,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    /// Address the listener is bound to, once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.serve.lock().unwrap().as_ref().map(|s| s.local_addr)
    }

    /// Number of services in the active snapshot
    pub fn service_count(&self) -> usize {
        self.inner.snapshot.load().service_count()
    }

    /// Full names of the services in the active snapshot, sorted
    pub fn service_names(&self) -> Vec<String> {
        self.inner.snapshot.load().service_names()
    }

    /// Number of operations the active snapshot can serve
    pub fn operation_count(&self) -> usize {
        self.inner.snapshot.load().operation_count()
    }

    /// Build the initial snapshot, bind the listener and start serving.
    pub async fn start(&self) -> Result<()> {
        self.transition(LifecycleState::Created, LifecycleState::Starting)?;
        match self.start_inner().await {
            Ok(()) => {
                self.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(err) => {
                self.set_state(LifecycleState::Created);
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let snapshot = Snapshot::build(&self.inner.config)?;
        self.inner.snapshot.store(Arc::new(snapshot));

        let listener =
            tokio::net::TcpListener::bind(self.inner.config.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;

        let app = router::build_router(self.inner.clone());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        self.inner.accepting.store(true, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(error = %err, "server terminated with error");
            }
        });

        *self.serve.lock().unwrap() = Some(ServeHandle {
            shutdown: Some(shutdown_tx),
            task,
            local_addr,
        });

        tracing::info!(
            addr = %local_addr,
            services = self.service_count(),
            operations = self.operation_count(),
            "bridge listening"
        );
        Ok(())
    }

    /// Rebuild the snapshot from disk and swap it in atomically.
    ///
    /// In-flight requests keep the snapshot they started with; the old one is
    /// dropped when its last reference goes away. On failure the active
    /// snapshot stays untouched and the error is returned.
    pub async fn reload(&self) -> Result<()> {
        self.transition(LifecycleState::Running, LifecycleState::Reloading)?;
        let result = Snapshot::build(&self.inner.config);
        self.set_state(LifecycleState::Running);

        let snapshot = result?;
        self.inner.snapshot.store(Arc::new(snapshot));
        tracing::info!(
            services = self.service_count(),
            operations = self.operation_count(),
            "snapshot reloaded"
        );
        Ok(())
    }

    /// Refuse new requests and drain in-flight handlers, aborting the server
    /// task if the grace deadline passes first.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        self.transition(LifecycleState::Running, LifecycleState::Stopping)?;
        self.inner.accepting.store(false, Ordering::SeqCst);

        let handle = self.serve.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if let Some(shutdown) = handle.shutdown.take() {
                let _ = shutdown.send(());
            }
            if tokio::time::timeout(grace, &mut handle.task).await.is_err() {
                tracing::warn!("grace deadline passed, aborting server task");
                handle.task.abort();
            }
        }

        self.set_state(LifecycleState::Stopped);
        Ok(())
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return Err(Error::Lifecycle(format!(
                "expected {from:?} state, found {:?}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: LifecycleState) {
        *self.state.lock().unwrap() = to;
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("services", &self.service_count())
            .finish()
    }
}

/// Builder for creating a Gateway
pub struct GatewayBuilder {
    config: GatewayConfig,
    middlewares: Vec<SharedMiddleware>,
}

impl GatewayBuilder {
    /// Create a new gateway builder
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            middlewares: Vec::new(),
        }
    }

    /// Replace the whole configuration in one shot.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Directory of service definitions, one subdirectory per service.
    pub fn services_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.services_dir = dir.into();
        self
    }

    /// Upstream GraphQL endpoint URL.
    pub fn graphql_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.graphql_endpoint = endpoint.into();
        self
    }

    /// Listen address for the inbound RPC listener.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Per-request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Maximum inbound body size in bytes.
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.max_body_bytes = bytes;
        self
    }

    /// Maximum concurrently handled requests.
    pub fn max_in_flight(mut self, requests: usize) -> Self {
        self.config.max_in_flight = requests;
        self
    }

    /// Switch to predefined mode, loading operations from `dir`.
    pub fn predefined_operations(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.mode = crate::config::Mode::Predefined;
        self.config.operations_dir = Some(dir.into());
        self
    }

    /// Accept unknown JSON fields instead of rejecting them.
    pub fn permissive_fields(mut self, permissive: bool) -> Self {
        self.config.permissive_fields = permissive;
        self
    }

    /// Add middleware; middlewares run in the order they are added.
    pub fn add_middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;
        let client = GraphqlClient::new(
            &self.config.graphql_endpoint,
            self.config.upstream_pool_size,
        )?;

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                config: self.config,
                snapshot: ArcSwap::from_pointee(Snapshot::empty()),
                client,
                middlewares: self.middlewares,
                in_flight: AtomicUsize::new(0),
                accepting: AtomicBool::new(false),
            }),
            state: Mutex::new(LifecycleState::Created),
            serve: Mutex::new(None),
        })
    }

    /// Build the gateway and start serving.
    pub async fn start(self) -> Result<Gateway> {
        let gateway = self.build()?;
        gateway.start().await?;
        Ok(gateway)
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_employee_service;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn builder_for(tmp: &std::path::Path) -> GatewayBuilder {
        Gateway::builder()
            .services_dir(tmp)
            .graphql_endpoint("http://127.0.0.1:1/graphql")
            .listen_addr("127.0.0.1:0")
    }

    #[test]
    fn build_requires_configuration() {
        assert!(GatewayBuilder::new().build().is_err());
    }

    #[tokio::test]
    async fn start_discovers_services() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());

        let gateway = builder_for(tmp.path()).build().unwrap();
        assert_eq!(gateway.state(), LifecycleState::Created);
        assert_eq!(gateway.service_count(), 0);

        gateway.start().await.unwrap();
        assert_eq!(gateway.state(), LifecycleState::Running);
        assert!(gateway.local_addr().is_some());
        assert_eq!(gateway.service_count(), 1);
        assert_eq!(
            gateway.service_names(),
            vec!["employee.v1.EmployeeService".to_string()]
        );
        assert_eq!(gateway.operation_count(), 3);

        gateway.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(gateway.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn failed_start_returns_to_created() {
        let tmp = tempfile::tempdir().unwrap();
        // No service.proto anywhere: the load fails.
        let gateway = builder_for(tmp.path()).build().unwrap();
        assert!(gateway.start().await.is_err());
        assert_eq!(gateway.state(), LifecycleState::Created);
        assert!(gateway.local_addr().is_none());
    }

    #[tokio::test]
    async fn lifecycle_refuses_bad_transitions() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let gateway = builder_for(tmp.path()).build().unwrap();

        assert!(gateway.reload().await.is_err());
        assert!(gateway.stop(Duration::from_secs(1)).await.is_err());

        gateway.start().await.unwrap();
        assert!(gateway.start().await.is_err());

        gateway.stop(Duration::from_secs(1)).await.unwrap();
        assert!(gateway.reload().await.is_err());
    }

    #[tokio::test]
    async fn reload_swaps_and_releases_the_old_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let gateway = builder_for(tmp.path()).build().unwrap();
        gateway.start().await.unwrap();

        let old = gateway.inner.snapshot.load_full();
        let weak = Arc::downgrade(&old);
        drop(old);

        std::fs::create_dir_all(tmp.path().join("org")).unwrap();
        std::fs::write(
            tmp.path().join("org").join("service.proto"),
            r#"
syntax = "proto3";
package org.v1;
message Team { string name = 1; }
service OrgService {
  rpc QueryTeams(Team) returns (Team);
}
"#,
        )
        .unwrap();

        gateway.reload().await.unwrap();
        assert_eq!(gateway.service_count(), 2);

        // The superseded snapshot is gone once nothing references it.
        assert!(weak.upgrade().is_none());

        gateway.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn router_translates_errors_without_a_live_upstream() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let gateway = builder_for(tmp.path()).build().unwrap();
        gateway.start().await.unwrap();

        let app = crate::router::build_router(gateway.inner.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/employee.v1.EmployeeService/Nope")
                    .header("content-type", "application/json")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("receive response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("read body");
        let body: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(body["code"], "not_found");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/employee.v1.EmployeeService/QueryEmployees")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("receive response");
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        gateway.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_reload_keeps_the_active_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let gateway = builder_for(tmp.path()).build().unwrap();
        gateway.start().await.unwrap();

        let broken = tmp.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("service.proto"), "message {").unwrap();

        assert!(gateway.reload().await.is_err());
        assert_eq!(gateway.state(), LifecycleState::Running);
        assert_eq!(gateway.service_count(), 1);

        gateway.stop(Duration::from_secs(1)).await.unwrap();
    }
}
