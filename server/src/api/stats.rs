use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde_json::json;
use sqlx::SqlitePool;

use super::error_response;

pub async fn methods(pool: web::Data<SqlitePool>) -> HttpResponse {
    match db::count_sessions_by_method(pool.get_ref()).await {
        Ok(stats) => HttpResponse::Ok().json(json!({"stats": stats})),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch method statistics",
            Some(&e),
        ),
    }
}

pub async fn duration_by_path(pool: web::Data<SqlitePool>) -> HttpResponse {
    match db::average_duration_by_path(pool.get_ref()).await {
        Ok(stats) => HttpResponse::Ok().json(json!({"stats": stats})),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch duration statistics",
            Some(&e),
        ),
    }
}
