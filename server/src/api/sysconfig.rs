use std::collections::HashMap;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde_json::json;
use sqlx::SqlitePool;

use proxy::registry;

use super::error_response;

/// Settings the POST endpoint accepts; they land in `system_settings` and
/// take effect after restart.
const PERSISTABLE_KEYS: [&str; 4] = ["log_level", "log_dest", "api_addr", "max_sessions_retain"];

pub async fn show() -> HttpResponse {
    let Some(sys) = registry::global().sys_config() else {
        return error_response(
            StatusCode::NOT_FOUND,
            "System configuration not available",
            None,
        );
    };

    HttpResponse::Ok().json(json!({
        "log_level": sys.log_level,
        "log_dest": sys.log_dest,
        "db_path": sys.db_path,
        "api_addr": sys.api_addr,
        "max_sessions_retain": sys.max_sessions_retain,
        "db_size": db::db_file_size(&sys.db_path),
        "config_file": sys.config_file.as_ref().map(|p| p.display().to_string()),
        "proxies": sys.proxies,
    }))
}

pub async fn update(
    pool: web::Data<SqlitePool>,
    updates: web::Json<HashMap<String, String>>,
) -> HttpResponse {
    for (key, value) in updates.iter() {
        if !PERSISTABLE_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Err(e) = db::set_setting(pool.get_ref(), key, value).await {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to save setting: {}", key),
                Some(&e),
            );
        }
    }

    HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Settings saved. Changes will take effect after restart.",
    }))
}
