//! Error types for the RPC-GraphQL bridge

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Request-level error taxonomy.
///
/// Every failure that reaches a client is classified as one of these kinds and
/// translated once, at the router boundary, into the code space of the
/// protocol the request arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unauthenticated,
    PermissionDenied,
    ResourceExhausted,
    DeadlineExceeded,
    Unavailable,
    Internal,
    Unimplemented,
}

impl ErrorKind {
    /// The canonical gRPC status code for this kind.
    pub fn grpc_code(self) -> tonic::Code {
        match self {
            ErrorKind::InvalidArgument => tonic::Code::InvalidArgument,
            ErrorKind::NotFound => tonic::Code::NotFound,
            ErrorKind::Unauthenticated => tonic::Code::Unauthenticated,
            ErrorKind::PermissionDenied => tonic::Code::PermissionDenied,
            ErrorKind::ResourceExhausted => tonic::Code::ResourceExhausted,
            ErrorKind::DeadlineExceeded => tonic::Code::DeadlineExceeded,
            ErrorKind::Unavailable => tonic::Code::Unavailable,
            ErrorKind::Internal => tonic::Code::Internal,
            ErrorKind::Unimplemented => tonic::Code::Unimplemented,
        }
    }

    /// The Connect protocol error code string for this kind.
    pub fn connect_code(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
            ErrorKind::Unimplemented => "unimplemented",
        }
    }

    /// The HTTP status used when the framing carries status over HTTP.
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Map a GraphQL `extensions.code` value onto the taxonomy, when it fits.
    pub fn from_graphql_code(code: &str) -> Option<Self> {
        let kind = match code.to_ascii_uppercase().as_str() {
            "INVALID_ARGUMENT" | "BAD_REQUEST" | "BAD_USER_INPUT" => ErrorKind::InvalidArgument,
            "NOT_FOUND" => ErrorKind::NotFound,
            "UNAUTHENTICATED" | "UNAUTHORIZED" => ErrorKind::Unauthenticated,
            "PERMISSION_DENIED" | "FORBIDDEN" => ErrorKind::PermissionDenied,
            "RESOURCE_EXHAUSTED" => ErrorKind::ResourceExhausted,
            "DEADLINE_EXCEEDED" => ErrorKind::DeadlineExceeded,
            "UNAVAILABLE" => ErrorKind::Unavailable,
            "UNIMPLEMENTED" => ErrorKind::Unimplemented,
            "INTERNAL" | "INTERNAL_SERVER_ERROR" => ErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.connect_code())
    }
}

/// Errors raised while loading `.proto` service definitions.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Services directory or a proto file inside it does not exist
    #[error("file not found: {0}")]
    FileNotFound(std::path::PathBuf),

    /// The proto compiler rejected a file; the message carries line/column
    #[error("failed to parse {file}: {message}")]
    ParseFailure { file: String, message: String },

    /// Two files declare a service with the same full name
    #[error("duplicate service: {0}")]
    DuplicateService(String),

    /// A referenced message or enum type is missing from the registry
    #[error("unresolved type: {0}")]
    UnresolvedType(String),

    /// Streaming RPCs are not supported by the bridge
    #[error("streaming rpc {service}/{method} is not supported")]
    UnsupportedStreaming { service: String, method: String },

    /// IO errors while walking the services directory
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building or querying the operation store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The operations directory contains no GraphQL documents
    #[error("operations directory {0} contains no operations")]
    Empty(std::path::PathBuf),

    /// A GraphQL document could not be parsed
    #[error("failed to parse {file}: {message}")]
    ParseFailure { file: String, message: String },

    /// Each collection file must hold exactly one executable operation
    #[error("{0} contains more than one operation")]
    MultipleOperationsInFile(String),

    /// Two operations share a name after prefix-stripping
    #[error("method {0} binds to more than one operation")]
    AmbiguousBinding(String),

    /// Two collection files declare the same operation name
    #[error("duplicate operation: {0}")]
    DuplicateOperation(String),

    /// Predefined mode only: a registered method has no operation
    #[error("no operation bound for {service}/{method}")]
    UnboundMethod { service: String, method: String },

    /// IO errors while reading the operations directory
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the upstream GraphQL transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The upstream endpoint could not be reached
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The upstream answered with a 5xx status
    #[error("upstream returned status {0}")]
    Upstream(u16),

    /// The upstream body was not valid GraphQL-over-JSON
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// The upstream call outlived the request deadline
    #[error("upstream call timed out")]
    Timeout,
}

/// Main error type for the bridge
///
/// This enum covers all possible errors that can occur within the gateway,
/// from startup (loader/store) through per-request handling.
#[derive(Error, Debug)]
pub enum Error {
    /// Proto loader errors, fatal at start/reload
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),

    /// Operation store errors, fatal at start/reload
    #[error("operation store error: {0}")]
    Store(#[from] StoreError),

    /// Upstream transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A classified per-request failure
    #[error("{1}")]
    Status(ErrorKind, String),

    /// The inbound body exceeded the configured limit
    #[error("payload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// The inbound Content-Type is not one the bridge speaks
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Invalid gateway configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Start/Reload/Stop called in the wrong state
    #[error("invalid lifecycle transition: {0}")]
    Lifecycle(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for a classified request error.
    pub fn status(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Status(kind, message.into())
    }

    /// Classify this error into the request taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Status(kind, _) => *kind,
            Error::PayloadTooLarge(_) => ErrorKind::ResourceExhausted,
            Error::UnsupportedMediaType(_) => ErrorKind::Unimplemented,
            Error::Transport(TransportError::Unavailable(_)) => ErrorKind::Unavailable,
            Error::Transport(TransportError::Upstream(_)) => ErrorKind::Unavailable,
            Error::Transport(TransportError::Decode(_)) => ErrorKind::Internal,
            Error::Transport(TransportError::Timeout) => ErrorKind::DeadlineExceeded,
            Error::Loader(_) | Error::Store(_) | Error::Config(_) => ErrorKind::Internal,
            Error::Lifecycle(_) => ErrorKind::Internal,
            Error::Io(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status for framings that carry status over HTTP.
    ///
    /// Two router-level failures deviate from the kind's default mapping:
    /// oversized bodies answer 413 and unknown media types answer 415.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            _ => self.kind().http_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_project_to_all_three_code_spaces() {
        assert_eq!(ErrorKind::NotFound.grpc_code(), tonic::Code::NotFound);
        assert_eq!(ErrorKind::NotFound.connect_code(), "not_found");
        assert_eq!(ErrorKind::NotFound.http_status(), StatusCode::NOT_FOUND);

        assert_eq!(ErrorKind::Unavailable.grpc_code() as i32, 14);
        assert_eq!(
            ErrorKind::DeadlineExceeded.http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn graphql_codes_map_onto_taxonomy() {
        assert_eq!(
            ErrorKind::from_graphql_code("NOT_FOUND"),
            Some(ErrorKind::NotFound)
        );
        assert_eq!(
            ErrorKind::from_graphql_code("forbidden"),
            Some(ErrorKind::PermissionDenied)
        );
        assert_eq!(ErrorKind::from_graphql_code("SOMETHING_ELSE"), None);
    }

    #[test]
    fn router_overrides_pick_the_right_status() {
        assert_eq!(
            Error::PayloadTooLarge(42).http_status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            Error::UnsupportedMediaType("text/plain".into()).http_status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            Error::status(ErrorKind::Unauthenticated, "no token").http_status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
