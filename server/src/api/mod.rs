use std::collections::HashMap;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, TimeZone, Utc};

mod bookmarks;
mod configs;
mod proxyserver;
mod sessions;
mod stats;
mod sysconfig;

use crate::ws;

/// Wire every control API route. Paths are registered as resources so an
/// existing path hit with the wrong method answers 405.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/api/version").route(web::get().to(version)))
        .service(web::resource("/api/ws").route(web::get().to(ws::ws_entry)))
        .service(
            web::resource("/api/sysconfig")
                .route(web::get().to(sysconfig::show))
                .route(web::post().to(sysconfig::update)),
        )
        .service(web::resource("/api/configs").route(web::get().to(configs::current)))
        .service(web::resource("/api/configs/history").route(web::get().to(configs::history)))
        .service(web::resource("/api/configs/{id}").route(web::get().to(configs::detail)))
        .service(
            web::resource("/api/configs/{id}/sessions")
                .route(web::get().to(configs::sessions_for_config)),
        )
        .service(web::resource("/api/proxyserver/create").route(web::post().to(proxyserver::create)))
        .service(web::resource("/api/proxyserver/export").route(web::post().to(proxyserver::export)))
        .service(
            web::resource("/api/proxyserver/{id}/start").route(web::post().to(proxyserver::start)),
        )
        .service(
            web::resource("/api/proxyserver/{id}/stop").route(web::post().to(proxyserver::stop)),
        )
        .service(
            web::resource("/api/sessions/recent/{config_id}").route(web::get().to(sessions::recent)),
        )
        .service(
            web::resource("/api/sessions/errors/{config_id}").route(web::get().to(sessions::errors)),
        )
        .service(web::resource("/api/sessions/slow/{config_id}").route(web::get().to(sessions::slow)))
        .service(
            web::resource("/api/sessions/by-path/{config_id}").route(web::get().to(sessions::by_path)),
        )
        .service(
            web::resource("/api/sessions/by-method/{config_id}")
                .route(web::get().to(sessions::by_method)),
        )
        .service(
            web::resource("/api/sessions/by-header/{config_id}")
                .route(web::get().to(sessions::with_header)),
        )
        .service(
            web::resource("/api/sessions/by-header-value/{config_id}")
                .route(web::get().to(sessions::by_header_value)),
        )
        .service(
            web::resource("/api/sessions/by-query-param/{config_id}")
                .route(web::get().to(sessions::with_query_param)),
        )
        .service(
            web::resource("/api/sessions/search/{config_id}").route(web::get().to(sessions::search)),
        )
        .service(web::resource("/api/sessions/{id}").route(web::get().to(sessions::detail)))
        .service(web::resource("/api/stats/methods").route(web::get().to(stats::methods)))
        .service(
            web::resource("/api/stats/duration-by-path")
                .route(web::get().to(stats::duration_by_path)),
        )
        .service(
            web::resource("/api/bookmarks")
                .route(web::get().to(bookmarks::list)),
        )
        .service(
            web::resource("/api/bookmarks/{id}")
                .route(web::post().to(bookmarks::create))
                .route(web::get().to(bookmarks::show))
                .route(web::patch().to(bookmarks::update))
                .route(web::delete().to(bookmarks::remove)),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "healthy"}))
}

async fn version() -> HttpResponse {
    let (latest_version, latest_version_tag) = proxy::registry::global().latest_version();
    HttpResponse::Ok().json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "latest_version": latest_version,
        "latest_version_tag": latest_version_tag,
    }))
}

/// JSON error body with a short message plus machine-readable details.
pub(crate) fn error_response(
    status: StatusCode,
    message: &str,
    err: Option<&anyhow::Error>,
) -> HttpResponse {
    let details = err.map(|e| e.to_string()).unwrap_or_default();
    HttpResponse::build(status)
        .json(serde_json::json!({"error": message, "details": details}))
}

pub(crate) fn int_param(query: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    query
        .get(key)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

/// Parse a `since` value: RFC3339 first, unix milliseconds as fallback.
pub(crate) fn parse_since(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_accepts_rfc3339_and_unix_millis() {
        let t = parse_since("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(t.timestamp(), 1714564800);

        let t = parse_since("1714564800000").unwrap();
        assert_eq!(t.timestamp(), 1714564800);

        assert!(parse_since("yesterday").is_none());
    }

    #[test]
    fn int_param_falls_back_to_default() {
        let mut query = HashMap::new();
        query.insert("limit".to_string(), "5".to_string());
        query.insert("bad".to_string(), "x".to_string());
        assert_eq!(int_param(&query, "limit", 20), 5);
        assert_eq!(int_param(&query, "bad", 20), 20);
        assert_eq!(int_param(&query, "missing", 20), 20);
    }
}
