use std::collections::HashMap;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde_json::json;
use sqlx::SqlitePool;

use super::{error_response, int_param, parse_since};

pub async fn recent(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let mut limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);
    let since = query.get("since").and_then(|s| parse_since(s));

    // A `since` poll without an explicit limit wants everything new.
    if since.is_some() && !query.contains_key("limit") {
        limit = 0;
    }

    match db::recent_sessions(pool.get_ref(), &config_id, limit, offset, since).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch sessions",
            Some(&e),
        ),
    }
}

pub async fn errors(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    match db::error_sessions(pool.get_ref(), &config_id, limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch error sessions",
            Some(&e),
        ),
    }
}

pub async fn slow(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let min_duration = int_param(&query, "min_duration", 1000);
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    match db::slow_sessions(pool.get_ref(), &config_id, min_duration, limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "min_duration": min_duration,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch slow sessions",
            Some(&e),
        ),
    }
}

pub async fn by_path(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let request_path = query.get("path").cloned().unwrap_or_default();
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    match db::sessions_by_path(pool.get_ref(), &config_id, &request_path, limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "path": request_path,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Query failed", Some(&e)),
    }
}

pub async fn by_method(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let method = query.get("method").cloned().unwrap_or_default();
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    match db::sessions_by_method(pool.get_ref(), &config_id, &method, limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "method": method,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Query failed", Some(&e)),
    }
}

pub async fn with_header(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let name = query.get("name").cloned().unwrap_or_default();
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    match db::sessions_with_header(pool.get_ref(), &config_id, &name, limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "header_name": name,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Query failed", Some(&e)),
    }
}

pub async fn by_header_value(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let name = query.get("name").cloned().unwrap_or_default();
    let value = query.get("value").cloned().unwrap_or_default();
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    match db::sessions_by_header_value(pool.get_ref(), &config_id, &name, &value, limit, offset)
        .await
    {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "header_name": name,
            "header_value": value,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Query failed", Some(&e)),
    }
}

pub async fn with_query_param(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let name = query.get("name").cloned().unwrap_or_default();
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    match db::sessions_with_query_param(pool.get_ref(), &config_id, &name, limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "param_name": name,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Query failed", Some(&e)),
    }
}

pub async fn search(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = path.into_inner();
    let q = query.get("q").cloned().unwrap_or_default();
    let limit = int_param(&query, "limit", 20);
    let offset = int_param(&query, "offset", 0);

    // An empty query degrades to the recent listing.
    if q.is_empty() {
        return match db::recent_sessions(pool.get_ref(), &config_id, limit, offset, None).await {
            Ok(sessions) => HttpResponse::Ok().json(json!({
                "config_id": config_id,
                "count": sessions.len(),
                "limit": limit,
                "offset": offset,
                "sessions": sessions,
            })),
            Err(e) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch sessions",
                Some(&e),
            ),
        };
    }

    match db::search_sessions(pool.get_ref(), &config_id, &q, limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "config_id": config_id,
            "query": q,
            "count": sessions.len(),
            "limit": limit,
            "offset": offset,
            "sessions": sessions,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Search failed", Some(&e)),
    }
}

pub async fn detail(pool: web::Data<SqlitePool>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match db::get_session(pool.get_ref(), &id).await {
        Ok(Some(session)) => {
            let request_headers = parse_json_column(&session.request_headers);
            let response_headers = parse_json_column(&session.response_headers);
            let query_parameters = parse_json_column(&session.query_parameters);
            HttpResponse::Ok().json(json!({
                "session": session,
                "request_headers": request_headers,
                "response_headers": response_headers,
                "query_parameters": query_parameters,
            }))
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Session not found", None),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error", Some(&e)),
    }
}

fn parse_json_column(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
}
