//! Middleware support for the bridge

use crate::error::Result;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Context passed to middleware, built once per request before dispatch.
#[derive(Debug)]
pub struct RequestContext {
    /// Inbound request headers
    pub headers: HeaderMap,

    /// Full name of the addressed service
    pub service: String,

    /// Name of the addressed method
    pub method: String,

    /// Correlation id: inbound `X-Request-Id` or generated
    pub request_id: String,

    /// Additional context data
    pub extensions: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Insert extension data
    pub fn insert(&mut self, key: String, value: serde_json::Value) {
        self.extensions.insert(key, value);
    }

    /// Get extension data
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(key)
    }
}

/// Middleware trait for inspecting requests ahead of dispatch
///
/// Middlewares run in registration order, after routing and before the
/// payload is decoded. Returning an error aborts the request; the error is
/// translated into the caller's wire protocol like any other failure, so an
/// authentication layer can simply return `ErrorKind::Unauthenticated`.
///
/// # Example
///
/// ```rust
/// use graphql_rpc_bridge::middleware::{Middleware, RequestContext};
/// use graphql_rpc_bridge::Result;
///
/// struct TenantMiddleware;
///
/// #[async_trait::async_trait]
/// impl Middleware for TenantMiddleware {
///     async fn call(&self, ctx: &mut RequestContext) -> Result<()> {
///         if let Some(tenant) = ctx.headers.get("x-tenant-id") {
///             ctx.insert("tenant".into(), tenant.to_str().unwrap_or("").into());
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request context
    async fn call(&self, ctx: &mut RequestContext) -> Result<()>;
}

/// Type alias for shared middleware
pub type SharedMiddleware = Arc<dyn Middleware>;

/// Logging middleware
///
/// Emits one `tracing` entry per routed request.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(&self, ctx: &mut RequestContext) -> Result<()> {
        tracing::debug!(
            service = %ctx.service,
            method = %ctx.method,
            request_id = %ctx.request_id,
            "dispatching rpc"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    struct RejectAll;

    #[async_trait::async_trait]
    impl Middleware for RejectAll {
        async fn call(&self, _ctx: &mut RequestContext) -> Result<()> {
            Err(Error::status(ErrorKind::Unauthenticated, "no token"))
        }
    }

    fn context() -> RequestContext {
        RequestContext {
            headers: HeaderMap::new(),
            service: "employee.v1.EmployeeService".into(),
            method: "QueryEmployees".into(),
            request_id: "test".into(),
            extensions: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn middleware_errors_carry_their_kind() {
        let mut ctx = context();
        let err = RejectAll.call(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn logging_middleware_passes_through() {
        let mut ctx = context();
        assert!(LoggingMiddleware.call(&mut ctx).await.is_ok());
    }
}
