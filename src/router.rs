//! Request router: matches `/pkg.Service/Method` paths, negotiates the wire
//! protocol and drives the per-request pipeline.
//!
//! Every error is translated exactly once, here, into the code space of the
//! protocol the request arrived in; one log entry is emitted per failing
//! request with service, method, kind and correlation id.

use crate::error::{Error, ErrorKind, Result};
use crate::gateway::GatewayInner;
use crate::loader::{IdempotencyLevel, MethodEntry};
use crate::middleware::RequestContext;
use crate::snapshot::Snapshot;
use crate::transcode;
use crate::types::{ConnectError, GraphQLRequest};
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use bytes::Bytes;
use futures::stream;
use http_body::Frame;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use prost_reflect::DynamicMessage;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");
const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// The wire protocol a request arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireProtocol {
    Grpc,
    GrpcWeb { text: bool },
    Connect { binary: bool },
}

impl WireProtocol {
    fn response_content_type(self) -> &'static str {
        match self {
            WireProtocol::Grpc => "application/grpc",
            WireProtocol::GrpcWeb { text: false } => "application/grpc-web+proto",
            WireProtocol::GrpcWeb { text: true } => "application/grpc-web-text+proto",
            WireProtocol::Connect { binary: true } => "application/proto",
            WireProtocol::Connect { binary: false } => "application/json",
        }
    }
}

/// Content-Type (and, for Connect, the optional protocol-version header)
/// decide the framing. `application/grpc-web*` wins over `application/grpc`
/// by prefix length; bare JSON and proto are Connect unary.
pub(crate) fn detect_protocol(method: &Method, headers: &HeaderMap) -> Result<WireProtocol> {
    if method == Method::GET {
        return Ok(WireProtocol::Connect { binary: false });
    }

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if let Some(rest) = content_type.strip_prefix("application/grpc-web-text") {
        if matches!(rest, "" | "+proto") {
            return Ok(WireProtocol::GrpcWeb { text: true });
        }
    } else if let Some(rest) = content_type.strip_prefix("application/grpc-web") {
        if matches!(rest, "" | "+proto") {
            return Ok(WireProtocol::GrpcWeb { text: false });
        }
    } else if let Some(rest) = content_type.strip_prefix("application/grpc") {
        if matches!(rest, "" | "+proto") {
            return Ok(WireProtocol::Grpc);
        }
    } else {
        match content_type.as_str() {
            "application/connect+json" | "application/json" => {
                return Ok(WireProtocol::Connect { binary: false })
            }
            "application/connect+proto" | "application/proto" => {
                return Ok(WireProtocol::Connect { binary: true })
            }
            _ => {}
        }
    }

    let shown = if content_type.is_empty() {
        "<none>".to_string()
    } else {
        content_type
    };
    Err(Error::UnsupportedMediaType(shown))
}

/// Inbound deadline: `grpc-timeout` or `Connect-Timeout-Ms`, capped by the
/// configured request timeout.
pub(crate) fn request_deadline(configured: Duration, headers: &HeaderMap) -> Duration {
    let inbound = headers
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
        .or_else(|| {
            headers
                .get("connect-timeout-ms")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        });

    match inbound {
        Some(deadline) => deadline.min(configured),
        None => configured,
    }
}

/// gRPC timeout encoding: an integer and a single unit suffix.
pub(crate) fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

fn generate_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:016x}", nanos ^ n.rotate_left(17))
}

/// Build the axum router serving the RPC surface.
pub(crate) fn build_router(inner: Arc<GatewayInner>) -> Router {
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .expose_headers([GRPC_STATUS, GRPC_MESSAGE, REQUEST_ID]);

    Router::new()
        .route("/{service}/{method}", any(handle_rpc))
        .fallback(handle_unmatched)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(inner)
}

async fn handle_unmatched(request: Request) -> Response {
    let id = request_id(request.headers());
    let error = Error::status(
        ErrorKind::NotFound,
        format!("method not found: {}", request.uri().path()),
    );
    error_response(
        WireProtocol::Connect { binary: false },
        &error,
        "",
        "",
        &id,
    )
}

async fn handle_rpc(
    State(inner): State<Arc<GatewayInner>>,
    Path((service, method)): Path<(String, String)>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let http_method = request.method().clone();
    let id = request_id(&headers);

    let protocol = match detect_protocol(&http_method, &headers) {
        Ok(protocol) => protocol,
        Err(err) => {
            // Framing is unknown, answer in Connect JSON.
            let fallback = WireProtocol::Connect { binary: false };
            return error_response(fallback, &err, &service, &method, &id);
        }
    };

    if !inner.accepting.load(Ordering::SeqCst) {
        let err = Error::status(ErrorKind::Unavailable, "server is shutting down");
        return error_response(protocol, &err, &service, &method, &id);
    }

    let Some(_guard) = InFlightGuard::acquire(&inner) else {
        let err = Error::status(ErrorKind::ResourceExhausted, "too many in-flight requests");
        return error_response(protocol, &err, &service, &method, &id);
    };

    // One atomic load; the request keeps this snapshot for its lifetime.
    let snapshot = inner.snapshot.load_full();
    let deadline = request_deadline(inner.config.request_timeout, &headers);

    let outcome = match tokio::time::timeout(
        deadline,
        dispatch(
            &inner, &snapshot, protocol, &service, &method, &http_method, &headers, &id, deadline,
            request,
        ),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::status(
            ErrorKind::DeadlineExceeded,
            format!("request exceeded its deadline of {deadline:?}"),
        )),
    };

    match outcome {
        Ok(response) => with_request_id(response, &id),
        Err(err) => error_response(protocol, &err, &service, &method, &id),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    inner: &GatewayInner,
    snapshot: &Snapshot,
    protocol: WireProtocol,
    service: &str,
    method_name: &str,
    http_method: &Method,
    headers: &HeaderMap,
    id: &str,
    deadline: Duration,
    request: Request,
) -> Result<Response> {
    let Some((_, method)) = snapshot.method(service, method_name) else {
        return Err(Error::status(
            ErrorKind::NotFound,
            format!("method not found: /{service}/{method_name}"),
        ));
    };
    let method = method.clone();

    let mut ctx = RequestContext {
        headers: headers.clone(),
        service: service.to_string(),
        method: method_name.to_string(),
        request_id: id.to_string(),
        extensions: HashMap::new(),
    };
    for middleware in &inner.middlewares {
        middleware.call(&mut ctx).await?;
    }

    let decoded = decode_payload(
        inner,
        protocol,
        &method,
        http_method,
        request,
    )
    .await?;

    let record = snapshot.resolve_operation(service, &method)?;
    let mut mapping = method.variable_mapping.clone();
    mapping.extend(record.variable_mapping.clone());
    let variables = transcode::variables_from(decoded, &mapping);

    let gql_request = GraphQLRequest {
        query: record.document.clone(),
        operation_name: Some(record.name.clone()),
        variables,
    };
    let response = inner.client.execute(&gql_request, headers, deadline).await?;

    if !response.errors.is_empty() {
        let first = &response.errors[0];
        let kind = first
            .code()
            .and_then(ErrorKind::from_graphql_code)
            .unwrap_or(ErrorKind::Internal);
        return Err(Error::status(kind, first.message.clone()));
    }

    let message = transcode::build_output_message(
        response.data.as_ref(),
        &method.output(),
        record.root_field.as_deref(),
    )?;

    success_response(protocol, &message)
}

async fn decode_payload(
    inner: &GatewayInner,
    protocol: WireProtocol,
    method: &MethodEntry,
    http_method: &Method,
    request: Request,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let input = method.input();
    let permissive = inner.config.permissive_fields;

    if http_method == Method::GET {
        if method.idempotency != IdempotencyLevel::NoSideEffects {
            return Err(Error::status(
                ErrorKind::InvalidArgument,
                format!("method {} does not permit GET", method.name()),
            ));
        }
        let payload = get_message_payload(request.uri().query().unwrap_or(""))?;
        return transcode::decode_json(&payload, &input, permissive);
    }

    let body = read_body(request, inner.config.max_body_bytes).await?;
    match protocol {
        WireProtocol::Connect { binary: false } => {
            transcode::decode_json(&body, &input, permissive)
        }
        WireProtocol::Connect { binary: true } => transcode::decode_binary(&body, &input),
        WireProtocol::Grpc => {
            let message = transcode::split_grpc_frame(&body)?;
            transcode::decode_binary(message, &input)
        }
        WireProtocol::GrpcWeb { text } => {
            let body = if text {
                Bytes::from(BASE64.decode(body.as_ref()).map_err(|e| {
                    Error::status(
                        ErrorKind::InvalidArgument,
                        format!("invalid base64 body: {e}"),
                    )
                })?)
            } else {
                body
            };
            let message = transcode::split_grpc_frame(&body)?;
            transcode::decode_binary(message, &input)
        }
    }
}

/// Connect GET payload: the `message` query parameter, URL-decoded JSON
/// (or base64 when `base64=1`). Absent message means an empty payload.
fn get_message_payload(query: &str) -> Result<Vec<u8>> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).map_err(|e| {
        Error::status(
            ErrorKind::InvalidArgument,
            format!("invalid query string: {e}"),
        )
    })?;

    let mut message: Option<String> = None;
    let mut base64 = false;
    for (key, value) in pairs {
        match key.as_str() {
            "message" => message = Some(value),
            "base64" => base64 = value == "1",
            _ => {}
        }
    }

    let Some(message) = message else {
        return Ok(b"{}".to_vec());
    };
    if base64 {
        BASE64_URL.decode(message.as_bytes()).map_err(|e| {
            Error::status(
                ErrorKind::InvalidArgument,
                format!("invalid base64 message: {e}"),
            )
        })
    } else {
        Ok(message.into_bytes())
    }
}

async fn read_body(request: Request, limit: usize) -> Result<Bytes> {
    let limited = Limited::new(request.into_body(), limit);
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(Error::PayloadTooLarge(limit))
        }
        Err(err) => Err(Error::status(
            ErrorKind::Internal,
            format!("failed to read request body: {err}"),
        )),
    }
}

fn success_response(protocol: WireProtocol, message: &DynamicMessage) -> Result<Response> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, protocol.response_content_type());

    let response = match protocol {
        WireProtocol::Connect { binary: false } => {
            builder.body(Body::from(transcode::encode_json(message)?))
        }
        WireProtocol::Connect { binary: true } => {
            builder.body(Body::from(transcode::encode_binary(message)))
        }
        WireProtocol::Grpc => {
            let frame = transcode::encode_grpc_frame(&transcode::encode_binary(message));
            let mut trailers = HeaderMap::new();
            trailers.insert(GRPC_STATUS, HeaderValue::from_static("0"));
            builder.body(grpc_body(frame, trailers))
        }
        WireProtocol::GrpcWeb { text } => {
            let mut bytes = transcode::encode_grpc_frame(&transcode::encode_binary(message));
            bytes.extend_from_slice(&transcode::encode_grpc_web_trailers(0, ""));
            let bytes = if text {
                BASE64.encode(&bytes).into_bytes()
            } else {
                bytes
            };
            builder.body(Body::from(bytes))
        }
    };

    response.map_err(|e| Error::status(ErrorKind::Internal, format!("response build: {e}")))
}

/// A data frame followed by HTTP trailers carrying the gRPC status.
fn grpc_body(frame: Vec<u8>, trailers: HeaderMap) -> Body {
    let frames: Vec<std::result::Result<Frame<Bytes>, Infallible>> = vec![
        Ok(Frame::data(Bytes::from(frame))),
        Ok(Frame::trailers(trailers)),
    ];
    Body::new(http_body_util::StreamBody::new(stream::iter(frames)))
}

fn error_response(
    protocol: WireProtocol,
    error: &Error,
    service: &str,
    method: &str,
    id: &str,
) -> Response {
    tracing::warn!(
        service = %service,
        method = %method,
        kind = %error.kind(),
        request_id = %id,
        error = %error,
        "request failed"
    );

    let kind = error.kind();
    let response = match protocol {
        WireProtocol::Connect { .. } => {
            let body = ConnectError::new(kind.connect_code(), error.to_string());
            Response::builder()
                .status(error.http_status())
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec()),
                ))
        }
        WireProtocol::Grpc | WireProtocol::GrpcWeb { .. } => {
            let content_type = protocol.response_content_type();
            Response::builder()
                .status(error.http_status())
                .header(http::header::CONTENT_TYPE, content_type)
                .header(GRPC_STATUS, kind.grpc_code() as i32)
                .header(GRPC_MESSAGE, sanitize_grpc_message(&error.to_string()))
                .body(Body::empty())
        }
    };

    let response = response.unwrap_or_else(|_| {
        let mut fallback = Response::new(Body::empty());
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    });
    with_request_id(response, id)
}

fn with_request_id(mut response: Response, id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

/// `grpc-message` must stay a valid header value.
fn sanitize_grpc_message(message: &str) -> String {
    message
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { ' ' })
        .collect()
}

struct InFlightGuard {
    inner: Arc<GatewayInner>,
}

impl InFlightGuard {
    fn acquire(inner: &Arc<GatewayInner>) -> Option<Self> {
        let previous = inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if previous >= inner.config.max_in_flight {
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self {
            inner: inner.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
