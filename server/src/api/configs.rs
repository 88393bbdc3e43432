use std::collections::HashMap;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde_json::json;
use sqlx::SqlitePool;

use proxy::registry;

use super::{error_response, int_param};

/// The currently active configurations: persisted row joined with the
/// runtime state held in the registry.
pub async fn current(pool: web::Data<SqlitePool>) -> HttpResponse {
    let registry = registry::global();
    let mut configs: Vec<serde_json::Value> = Vec::new();

    for id in registry.config_ids() {
        let row = match db::get_config(pool.get_ref(), &id).await {
            Ok(Some(row)) => row,
            // Skip stale ids so one bad entry cannot break the listing.
            Ok(None) => continue,
            Err(e) => {
                log::warn!("failed to load config {}: {}", id, e);
                continue;
            }
        };

        let parsed_config: serde_json::Value =
            serde_json::from_str(&row.config_json).unwrap_or(serde_json::Value::Null);
        let mut entry = json!({
            "id": row.id.clone(),
            "created_at": row.created_at,
            "config_row": row,
            "parsed_config": parsed_config,
            "is_proxyserver_active": registry.has_server(&id),
        });
        if let Some(ctx) = registry.context(&id) {
            entry["target_url"] = json!(ctx.target.to_string());
            entry["listen_addr"] = json!(ctx.listen_addr);
        }
        configs.push(entry);
    }

    HttpResponse::Ok().json(configs)
}

/// Unique past configurations, newest first.
pub async fn history(
    pool: web::Data<SqlitePool>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let q = query.get("q").map(String::as_str);
    let limit = int_param(&query, "limit", 10);

    match db::config_history(pool.get_ref(), q, limit).await {
        Ok(rows) => {
            let history: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    let parsed: serde_json::Value =
                        serde_json::from_str(&row.config_json).unwrap_or(serde_json::Value::Null);
                    json!({
                        "id": row.id,
                        "created_at": row.created_at,
                        "parsed_config": parsed,
                        "source_path": row.source_path,
                        "cwd": row.cwd,
                    })
                })
                .collect();
            HttpResponse::Ok().json(history)
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch config history",
            Some(&e),
        ),
    }
}

pub async fn detail(pool: web::Data<SqlitePool>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let row = match db::get_config(pool.get_ref(), &id).await {
        Ok(Some(row)) => row,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Config not found", None),
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error", Some(&e))
        }
    };

    let registry = registry::global();
    let parsed_config: serde_json::Value =
        serde_json::from_str(&row.config_json).unwrap_or(serde_json::Value::Null);
    let mut response = json!({
        "id": row.id.clone(),
        "created_at": row.created_at,
        "config_row": row,
        "parsed_config": parsed_config,
        "is_proxyserver_active": registry.has_server(&id),
    });
    if let Some(ctx) = registry.context(&id) {
        response["runtime_config"] = json!({
            "listen_addr": ctx.listen_addr,
            "target_url": ctx.target.to_string(),
            "truncate_log_body": ctx.truncate_log_body,
        });
    }

    HttpResponse::Ok().json(response)
}

pub async fn sessions_for_config(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let limit = int_param(&query, "limit", 50);

    match db::recent_sessions(pool.get_ref(), &config_id, limit, 0, None).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "count": sessions.len(),
            "sessions": sessions,
        })),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch sessions for config",
            Some(&e),
        ),
    }
}
