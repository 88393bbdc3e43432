use std::collections::HashMap;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use common::models::Event;

use super::{error_response, int_param};
use crate::ws;

/// POST /api/bookmarks/{session_id} — idempotent: an already-bookmarked
/// session returns its existing bookmark.
pub async fn create(pool: web::Data<SqlitePool>, path: web::Path<String>) -> HttpResponse {
    let session_id = path.into_inner();
    log::info!("creating bookmark for session {}", session_id);

    match db::is_session_bookmarked(pool.get_ref(), &session_id).await {
        Ok(Some(bookmark_id)) => {
            return match db::get_bookmark(pool.get_ref(), &bookmark_id).await {
                Ok(Some(bookmark)) => HttpResponse::Ok().json(bookmark),
                Ok(None) => error_response(StatusCode::NOT_FOUND, "Bookmark not found", None),
                Err(e) => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error",
                    Some(&e),
                ),
            };
        }
        Ok(None) => {}
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error", Some(&e))
        }
    }

    match db::create_bookmark(pool.get_ref(), &session_id).await {
        Ok(Some(bookmark)) => HttpResponse::Ok().json(bookmark),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Session not found", None),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create bookmark",
            Some(&e),
        ),
    }
}

/// GET /api/bookmarks?config_id=&q=&limit=&offset=
pub async fn list(
    pool: web::Data<SqlitePool>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let config_id = query.get("config_id").map(String::as_str);
    let q = query.get("q").map(String::as_str);
    let limit = int_param(&query, "limit", 50);
    let offset = int_param(&query, "offset", 0);

    match db::list_bookmarks(pool.get_ref(), config_id, q, limit, offset).await {
        Ok((bookmarks, total)) => HttpResponse::Ok().json(json!({
            "bookmarks": bookmarks,
            "total": total,
            "limit": limit,
            "offset": offset,
        })),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch bookmarks",
            Some(&e),
        ),
    }
}

pub async fn show(pool: web::Data<SqlitePool>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match db::get_bookmark(pool.get_ref(), &id).await {
        Ok(Some(bookmark)) => HttpResponse::Ok().json(bookmark),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Bookmark not found", None),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error", Some(&e)),
    }
}

#[derive(Deserialize)]
pub struct UpdateBookmarkPayload {
    #[serde(default)]
    note: String,
    #[serde(default)]
    tags: String,
}

/// PATCH /api/bookmarks/{id} — update note/tags and notify observers.
pub async fn update(
    pool: web::Data<SqlitePool>,
    hub: web::Data<ws::Hub>,
    path: web::Path<String>,
    payload: web::Json<UpdateBookmarkPayload>,
) -> HttpResponse {
    let id = path.into_inner();

    match db::update_bookmark(pool.get_ref(), &id, &payload.note, &payload.tags).await {
        Ok(Some(bookmark)) => {
            hub.publish_event(
                "saved_sessions",
                &Event::UpdateSession {
                    bookmark: Box::new(bookmark.clone()),
                },
            );
            HttpResponse::Ok().json(bookmark)
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Bookmark not found", None),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to update bookmark",
            Some(&e),
        ),
    }
}

pub async fn remove(pool: web::Data<SqlitePool>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match db::delete_bookmark(pool.get_ref(), &id).await {
        Ok(true) => HttpResponse::Ok().finish(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Bookmark not found", None),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to delete bookmark",
            Some(&e),
        ),
    }
}
