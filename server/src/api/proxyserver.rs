use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde_json::json;
use sqlx::SqlitePool;

use common::config::ProxyEntry;
use proxy::{lifecycle, registry};

use super::error_response;
use crate::{export, ws};

/// POST /api/proxyserver/create — register and start a new listener from an
/// entry supplied in the request body.
pub async fn create(
    pool: web::Data<SqlitePool>,
    hub: web::Data<ws::Hub>,
    entry: web::Json<ProxyEntry>,
) -> HttpResponse {
    let entry = entry.into_inner();
    if entry.listen.is_empty() || entry.target.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing listen or target", None);
    }

    match lifecycle::start_proxy_server(-1, &entry, pool.get_ref(), ws::publish_fn(&hub)).await {
        Ok(config_id) => HttpResponse::Ok().json(json!({
            "status": "success",
            "config_id": config_id,
        })),
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            "Failed to start proxy server",
            Some(&e),
        ),
    }
}

/// POST /api/proxyserver/{id}/start — restart a known but stopped listener.
pub async fn start(
    pool: web::Data<SqlitePool>,
    hub: web::Data<ws::Hub>,
    path: web::Path<String>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let registry = registry::global();

    if registry.has_server(&config_id) {
        return error_response(StatusCode::CONFLICT, "Proxy server already running", None);
    }
    let Some(ctx) = registry.context(&config_id) else {
        return error_response(StatusCode::NOT_FOUND, "Config not found", None);
    };

    log::info!(
        "starting proxy server {} ({} -> {}) via api",
        config_id,
        ctx.entry.listen,
        ctx.entry.target
    );

    match lifecycle::start_proxy_server(-1, &ctx.entry, pool.get_ref(), ws::publish_fn(&hub)).await
    {
        Ok(started_id) => HttpResponse::Ok().json(json!({"config_id": started_id})),
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            "Failed to start proxy server",
            Some(&e),
        ),
    }
}

/// POST /api/proxyserver/{id}/stop — graceful stop with a bounded budget.
pub async fn stop(path: web::Path<String>) -> HttpResponse {
    let config_id = path.into_inner();

    if !registry::global().has_server(&config_id) {
        return error_response(StatusCode::NOT_FOUND, "Proxy server not running", None);
    }

    log::info!("stopping proxy server {} via api", config_id);
    lifecycle::stop_proxy_server(&config_id).await;

    HttpResponse::Ok().json(json!({"config_id": config_id}))
}

/// POST /api/proxyserver/export — rewrite the config file from the running
/// set.
pub async fn export() -> HttpResponse {
    match export::export_current_proxies() {
        Ok(()) => HttpResponse::Ok().json(json!({
            "status": "success",
            "message": "Configuration exported successfully",
        })),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to export config",
            Some(&e),
        ),
    }
}
