use std::collections::HashSet;
use std::time::Instant;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use futures_util::StreamExt;
use sqlx::SqlitePool;
use url::Url;

use common::config::ProxyEntry;
use common::models::{Event, PublishFn, SessionRow};

pub mod headers;
pub mod lifecycle;
pub mod reaper;
pub mod registry;

/// Hard cap on buffered request bodies.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Cap on body previews written to the log when truncation is enabled.
const MAX_BODY_LOG_BYTES: usize = 10 * 1024;

/// Runtime handle wiring a config row to a live listener: everything one
/// request needs to be forwarded, captured and announced.
pub struct ProxyContext {
    pub config_id: String,
    pub listen_addr: String,
    pub target: Url,
    pub truncate_log_body: bool,
    /// The entry this context was started from, kept verbatim so a restart
    /// registers the identical fingerprint.
    pub entry: ProxyEntry,
    pub pool: SqlitePool,
    pub headers_to_omit: HashSet<String>,
    pub publish: PublishFn,
    pub client: reqwest::Client,
}

impl ProxyContext {
    pub fn new(
        config_id: String,
        entry: &ProxyEntry,
        target: Url,
        pool: SqlitePool,
        publish: PublishFn,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            config_id,
            listen_addr: entry.listen.clone(),
            target,
            truncate_log_body: entry.truncate_log_body,
            entry: entry.clone(),
            pool,
            headers_to_omit: headers::HEADERS_TO_OMIT
                .iter()
                .map(|h| h.to_string())
                .collect(),
            publish,
            client: build_upstream_client()?,
        })
    }
}

/// Upstream client: redirects are passed through to the caller, and no
/// compression features are enabled so the captured body is the exact wire
/// body.
pub fn build_upstream_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

/// Response capture carried from the forward step into finalization.
struct CapturedResponse {
    status_code: i64,
    status_text: String,
    headers_json: String,
    body: web::Bytes,
    content_type: String,
    content_encoding: String,
}

/// The proxy request pipeline. Buffers the request, opens a pending session,
/// forwards to the target, buffers and relays the response, then finalizes
/// the session on a detached task.
pub async fn forward(
    req: HttpRequest,
    mut payload: web::Payload,
    ctx: web::Data<ProxyContext>,
) -> HttpResponse {
    let started = Instant::now();
    let timestamp = Utc::now();

    // --- Read request body (10 MiB cap) ---
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(chunk) => {
                if body.len() + chunk.len() > MAX_BODY_BYTES {
                    log::error!(
                        "request body exceeds {} byte limit on {}",
                        MAX_BODY_BYTES,
                        ctx.listen_addr
                    );
                    return HttpResponse::PayloadTooLarge().body("Request Entity Too Large");
                }
                body.extend_from_slice(&chunk);
            }
            Err(e) => {
                log::error!("failed reading request body: {}", e);
                return HttpResponse::InternalServerError().body("Internal Server Error");
            }
        }
    }
    let body = body.freeze();

    let peer_addr = req
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let raw_query = req.query_string().to_string();
    let url_full = if raw_query.is_empty() {
        req.path().to_string()
    } else {
        format!("{}?{}", req.path(), raw_query)
    };

    log_incoming(&ctx, &req, &body);

    // --- Persist pending session and notify ---
    let request_headers_json = headers::headers_to_json(header_pairs(&req))
        .unwrap_or_else(|e| {
            log::warn!("failed to serialize request headers: {}", e);
            "{}".to_string()
        });
    let query_params_json = headers::query_params_json(&raw_query).unwrap_or_else(|e| {
        log::warn!("failed to serialize query parameters: {}", e);
        "{}".to_string()
    });

    let client_ip = headers::host_of_addr(&peer_addr);
    let proto = format!("{:?}", req.version());
    let host = req.connection_info().host().to_string();

    let params = db::StartSessionParams {
        config_id: &ctx.config_id,
        timestamp,
        client_addr: &peer_addr,
        client_ip: &client_ip,
        method: req.method().as_str(),
        path: req.path(),
        query: &raw_query,
        proto: &proto,
        host: &host,
        url_full: &url_full,
        headers_json: &request_headers_json,
        query_params_json: &query_params_json,
        body: &body,
        content_type: header_value(&req, "content-type"),
        content_encoding: header_value(&req, "content-encoding"),
    };

    let session = match db::start_session(&ctx.pool, &params).await {
        Ok(session) => {
            log::debug!(
                "started session {} for config {}",
                session.id,
                session.config_id
            );
            (ctx.publish)("sessions", Event::NewSession {
                session: session.stub(),
            });
            Some(session)
        }
        Err(e) => {
            log::warn!("failed to start session: {}", e);
            None
        }
    };

    // --- Build the upstream request ---
    let upstream_url = build_upstream_url(&ctx.target, req.path(), &raw_query);

    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            log::error!("invalid request method: {}", e);
            return HttpResponse::InternalServerError().body("Internal Server Error");
        }
    };

    let connection_value = req
        .headers()
        .get("connection")
        .and_then(|v| v.to_str().ok());
    let skip = headers::hop_by_hop_names(connection_value);

    let mut upstream_headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        let lname = name.as_str();
        if lname == "host" || skip.contains(lname) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(lname.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            upstream_headers.append(n, v);
        }
    }
    set_header(&mut upstream_headers, "x-forwarded-host", &host);
    set_header(
        &mut upstream_headers,
        "x-forwarded-for",
        &headers::forwarded_client_ip(req.headers(), &peer_addr),
    );
    set_header(
        &mut upstream_headers,
        "x-forwarded-proto",
        if req.app_config().secure() {
            "https"
        } else {
            "http"
        },
    );

    // --- Forward ---
    let sent = ctx
        .client
        .request(method, &upstream_url)
        .headers(upstream_headers)
        .body(body.clone())
        .send()
        .await;

    let mut upstream = match sent {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("failed to reach target {}: {}", ctx.target, e);
            let (status, text) = if e.is_connect() || e.is_timeout() {
                (StatusCode::BAD_GATEWAY, "Bad Gateway")
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            };
            if let Some(session) = session {
                spawn_finalize(
                    ctx.clone(),
                    session,
                    started,
                    CapturedResponse {
                        status_code: status.as_u16() as i64,
                        status_text: status.canonical_reason().unwrap_or("").to_string(),
                        headers_json: "{}".to_string(),
                        body: web::Bytes::from_static(text.as_bytes()),
                        content_type: String::new(),
                        content_encoding: String::new(),
                    },
                );
            }
            return HttpResponse::build(status).body(text);
        }
    };

    // --- Capture response ---
    let status = upstream.status();
    let response_headers = upstream.headers().clone();

    let mut response_body = web::BytesMut::new();
    loop {
        match upstream.chunk().await {
            Ok(Some(chunk)) => response_body.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                // Keep whatever was read; the partial capture is still useful.
                log::warn!("error reading full response body: {}", e);
                break;
            }
        }
    }
    let response_body = response_body.freeze();

    log_outgoing(&ctx, status.as_u16(), started, &response_body);

    // --- Relay to the client ---
    let client_status = match StatusCode::from_u16(status.as_u16()) {
        Ok(s) => s,
        Err(_) => {
            return HttpResponse::BadGateway()
                .body(format!("Invalid status code from upstream: {}", status));
        }
    };
    let mut builder = HttpResponse::build(client_status);
    let response_connection = response_headers
        .get("connection")
        .and_then(|v| v.to_str().ok());
    let response_skip = headers::hop_by_hop_names(response_connection);
    for (name, value) in response_headers.iter() {
        if response_skip.contains(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            actix_web::http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            actix_web::http::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder.append_header((n, v));
        }
    }

    // --- Finalize asynchronously ---
    if let Some(session) = session {
        let response_headers_json =
            headers::headers_to_json(response_headers.iter().filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|s| (k.as_str().to_string(), s.to_string()))
            }))
            .unwrap_or_else(|e| {
                log::warn!("failed to serialize response headers: {}", e);
                "{}".to_string()
            });
        let capture = CapturedResponse {
            status_code: status.as_u16() as i64,
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers_json: response_headers_json,
            body: response_body.clone(),
            content_type: response_headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            content_encoding: response_headers
                .get("content-encoding")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
        };
        spawn_finalize(ctx.clone(), session, started, capture);
    }

    builder.body(response_body)
}

/// Persist the response capture on a detached task and republish the stub,
/// now carrying a terminal status. The client response is already on the
/// wire; failures here are log-only.
fn spawn_finalize(
    ctx: web::Data<ProxyContext>,
    session: SessionRow,
    started: Instant,
    capture: CapturedResponse,
) {
    actix_web::rt::spawn(async move {
        let duration_ms = started.elapsed().as_millis() as i64;
        let result = db::finish_session(
            &ctx.pool,
            &session.id,
            &db::FinishSessionParams {
                duration_ms,
                status_code: capture.status_code,
                status_text: &capture.status_text,
                headers_json: &capture.headers_json,
                body: &capture.body,
                content_type: &capture.content_type,
                content_encoding: &capture.content_encoding,
            },
        )
        .await;

        match result {
            Ok(()) => {
                let mut stub = session.stub();
                stub.status_code = capture.status_code;
                stub.duration_ms = duration_ms;
                (ctx.publish)("sessions", Event::NewSession { session: stub });
            }
            Err(e) => log::warn!("failed to finish session {}: {}", session.id, e),
        }
    });
}

/// Target scheme/host/port + joined path + the original raw query.
fn build_upstream_url(target: &Url, request_path: &str, raw_query: &str) -> String {
    let mut authority = target.host_str().unwrap_or("").to_string();
    if let Some(port) = target.port() {
        authority.push(':');
        authority.push_str(&port.to_string());
    }
    let mut url = format!(
        "{}://{}{}",
        target.scheme(),
        authority,
        headers::single_joining_slash(target.path(), request_path)
    );
    if !raw_query.is_empty() {
        url.push('?');
        url.push_str(raw_query);
    }
    url
}

fn header_pairs(req: &HttpRequest) -> impl Iterator<Item = (String, String)> + '_ {
    req.headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
}

fn header_value<'a>(req: &'a HttpRequest, name: &str) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn set_header(map: &mut reqwest::header::HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = reqwest::header::HeaderValue::from_str(value) {
        map.insert(name, v);
    }
}

fn log_incoming(ctx: &ProxyContext, req: &HttpRequest, body: &[u8]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let headers: Vec<String> = req
        .headers()
        .iter()
        .filter(|(name, _)| !ctx.headers_to_omit.contains(name.as_str()))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| format!("{}: {}", name, v)))
        .collect();
    log::debug!(
        "[{}] {} {} ({} bytes) headers: {}",
        ctx.config_id,
        req.method(),
        req.path(),
        body.len(),
        headers.join(", ")
    );
    if !body.is_empty() {
        log::debug!("[{}] request body: {}", ctx.config_id, body_preview(ctx, body));
    }
}

fn log_outgoing(ctx: &ProxyContext, status: u16, started: Instant, body: &[u8]) {
    log::debug!(
        "[{}] -> {} in {}ms ({} bytes)",
        ctx.config_id,
        status,
        started.elapsed().as_millis(),
        body.len()
    );
    if log::log_enabled!(log::Level::Debug) && !body.is_empty() {
        log::debug!("[{}] response body: {}", ctx.config_id, body_preview(ctx, body));
    }
}

fn body_preview<'a>(ctx: &ProxyContext, body: &'a [u8]) -> std::borrow::Cow<'a, str> {
    let cut = if ctx.truncate_log_body {
        body.len().min(MAX_BODY_LOG_BYTES)
    } else {
        body.len()
    };
    String::from_utf8_lossy(&body[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_url_joins_paths_and_keeps_query() {
        let target = Url::parse("http://localhost:8000").unwrap();
        assert_eq!(
            build_upstream_url(&target, "/foo", "x=1"),
            "http://localhost:8000/foo?x=1"
        );
        assert_eq!(
            build_upstream_url(&target, "/foo", ""),
            "http://localhost:8000/foo"
        );

        let target = Url::parse("http://localhost:8000/base/").unwrap();
        assert_eq!(
            build_upstream_url(&target, "/foo", ""),
            "http://localhost:8000/base/foo"
        );

        let target = Url::parse("https://api.example.com/v1").unwrap();
        assert_eq!(
            build_upstream_url(&target, "/items", "page=2"),
            "https://api.example.com/v1/items?page=2"
        );
    }
}
