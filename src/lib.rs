//! # graphql-rpc-bridge
//!
//! A protocol-transcoding gateway: clients speak gRPC, gRPC-Web or Connect
//! RPC against Protocol Buffer service definitions, and every call is served
//! by an upstream GraphQL endpoint.
//!
//! ## Features
//!
//! - Runtime loading of `.proto` service definitions, no codegen step
//! - Operations synthesized from RPC method names, or predefined from a
//!   collection directory
//! - JSON, binary proto and gRPC/gRPC-Web framings on one listener
//! - Hot reload with atomically swapped registry snapshots
//! - Middleware support for authentication and custom logic
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphql_rpc_bridge::Gateway;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::builder()
//!         .services_dir("./services")
//!         .graphql_endpoint("http://localhost:4000/graphql")
//!         .listen_addr("0.0.0.0:4011")
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.stop(Duration::from_secs(10)).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod graphql_client;
pub mod loader;
pub mod middleware;
pub mod operations;
mod router;
pub mod snapshot;
pub mod transcode;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{GatewayConfig, Mode};
pub use error::{Error, ErrorKind, LoaderError, Result, StoreError, TransportError};
pub use gateway::{Gateway, GatewayBuilder, LifecycleState};
pub use graphql_client::GraphqlClient;
pub use middleware::{LoggingMiddleware, Middleware, RequestContext};
pub use operations::{OperationKind, OperationRecord, OperationStore};
pub use snapshot::Snapshot;
