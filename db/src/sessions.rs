use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use common::models::SessionRow;
use common::new_id;

const SESSION_COLUMNS: &str = "id, config_id, created_at, timestamp, duration_ms, \
     client_addr, client_ip, \
     request_method, request_path, request_query, request_proto, request_host, \
     request_url_full, request_headers, query_parameters, request_body, \
     request_body_size, request_content_type, request_content_encoding, \
     response_status_code, response_status_text, response_headers, response_body, \
     response_body_size, response_content_type, response_content_encoding";

/// Request-side capture handed to [`start_session`].
pub struct StartSessionParams<'a> {
    pub config_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub client_addr: &'a str,
    pub client_ip: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub proto: &'a str,
    pub host: &'a str,
    pub url_full: &'a str,
    pub headers_json: &'a str,
    pub query_params_json: &'a str,
    pub body: &'a [u8],
    pub content_type: &'a str,
    pub content_encoding: &'a str,
}

/// Response-side capture handed to [`finish_session`].
pub struct FinishSessionParams<'a> {
    pub duration_ms: i64,
    pub status_code: i64,
    pub status_text: &'a str,
    pub headers_json: &'a str,
    pub body: &'a [u8],
    pub content_type: &'a str,
    pub content_encoding: &'a str,
}

/// Insert a new pending session (`response_status_code = 0`) and seed its
/// full-text index row with the request body text.
pub async fn start_session(
    pool: &SqlitePool,
    params: &StartSessionParams<'_>,
) -> anyhow::Result<SessionRow> {
    let row = SessionRow {
        id: new_id(),
        config_id: params.config_id.to_string(),
        created_at: Utc::now(),
        timestamp: params.timestamp,
        duration_ms: 0,
        client_addr: params.client_addr.to_string(),
        client_ip: params.client_ip.to_string(),
        request_method: params.method.to_string(),
        request_path: params.path.to_string(),
        request_query: params.query.to_string(),
        request_proto: params.proto.to_string(),
        request_host: params.host.to_string(),
        request_url_full: params.url_full.to_string(),
        request_headers: params.headers_json.to_string(),
        query_parameters: params.query_params_json.to_string(),
        request_body: params.body.to_vec(),
        request_body_size: params.body.len() as i64,
        request_content_type: params.content_type.to_string(),
        request_content_encoding: params.content_encoding.to_string(),
        response_status_code: 0,
        response_status_text: String::new(),
        response_headers: "{}".to_string(),
        response_body: Vec::new(),
        response_body_size: 0,
        response_content_type: String::new(),
        response_content_encoding: String::new(),
    };

    sqlx::query(
        "INSERT INTO proxy_sessions (id, config_id, created_at, timestamp, duration_ms, \
         client_addr, client_ip, request_method, request_path, request_query, \
         request_proto, request_host, request_url_full, request_headers, \
         query_parameters, request_body, request_body_size, request_content_type, \
         request_content_encoding, response_status_code) \
         VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(&row.id)
    .bind(&row.config_id)
    .bind(row.created_at)
    .bind(row.timestamp)
    .bind(&row.client_addr)
    .bind(&row.client_ip)
    .bind(&row.request_method)
    .bind(&row.request_path)
    .bind(&row.request_query)
    .bind(&row.request_proto)
    .bind(&row.request_host)
    .bind(&row.request_url_full)
    .bind(&row.request_headers)
    .bind(&row.query_parameters)
    .bind(&row.request_body)
    .bind(row.request_body_size)
    .bind(&row.request_content_type)
    .bind(&row.request_content_encoding)
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO proxy_sessions_fts (session_id, config_id, request_body, response_body) \
         VALUES (?, ?, ?, '')",
    )
    .bind(&row.id)
    .bind(&row.config_id)
    .bind(String::from_utf8_lossy(&row.request_body).into_owned())
    .execute(pool)
    .await?;

    Ok(row)
}

/// Transition a pending session to its terminal state.
pub async fn finish_session(
    pool: &SqlitePool,
    session_id: &str,
    params: &FinishSessionParams<'_>,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE proxy_sessions SET duration_ms = ?, response_status_code = ?, \
         response_status_text = ?, response_headers = ?, response_body = ?, \
         response_body_size = ?, response_content_type = ?, response_content_encoding = ? \
         WHERE id = ?",
    )
    .bind(params.duration_ms)
    .bind(params.status_code)
    .bind(params.status_text)
    .bind(params.headers_json)
    .bind(params.body)
    .bind(params.body.len() as i64)
    .bind(params.content_type)
    .bind(params.content_encoding)
    .bind(session_id)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE proxy_sessions_fts SET response_body = ? WHERE session_id = ?")
        .bind(String::from_utf8_lossy(params.body).into_owned())
        .bind(session_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn get_session(pool: &SqlitePool, id: &str) -> anyhow::Result<Option<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE id = ?",
        SESSION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

/// Most recent sessions for a config. `since` filters `timestamp > since`;
/// a non-positive limit fetches everything (SQLite treats LIMIT -1 as
/// unlimited).
pub async fn recent_sessions(
    pool: &SqlitePool,
    config_id: &str,
    limit: i64,
    offset: i64,
    since: Option<DateTime<Utc>>,
) -> anyhow::Result<Vec<SessionRow>> {
    let limit = if limit > 0 { limit } else { -1 };
    let rows = match since {
        Some(since) => {
            sqlx::query_as::<_, SessionRow>(&format!(
                "SELECT {} FROM proxy_sessions WHERE config_id = ? AND timestamp > ? \
                 ORDER BY timestamp DESC LIMIT ? OFFSET ?",
                SESSION_COLUMNS
            ))
            .bind(config_id)
            .bind(since)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, SessionRow>(&format!(
                "SELECT {} FROM proxy_sessions WHERE config_id = ? \
                 ORDER BY timestamp DESC LIMIT ? OFFSET ?",
                SESSION_COLUMNS
            ))
            .bind(config_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

pub async fn error_sessions(
    pool: &SqlitePool,
    config_id: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE config_id = ? AND response_status_code >= 400 \
         ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        SESSION_COLUMNS
    ))
    .bind(config_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

pub async fn slow_sessions(
    pool: &SqlitePool,
    config_id: &str,
    min_duration_ms: i64,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE config_id = ? AND duration_ms > ? \
         ORDER BY duration_ms DESC LIMIT ? OFFSET ?",
        SESSION_COLUMNS
    ))
    .bind(config_id)
    .bind(min_duration_ms)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

pub async fn sessions_by_path(
    pool: &SqlitePool,
    config_id: &str,
    path: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE config_id = ? AND request_path = ? \
         ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        SESSION_COLUMNS
    ))
    .bind(config_id)
    .bind(path)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

pub async fn sessions_by_method(
    pool: &SqlitePool,
    config_id: &str,
    method: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE config_id = ? AND request_method = ? \
         ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        SESSION_COLUMNS
    ))
    .bind(config_id)
    .bind(method)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

/// Sessions whose captured request carries the given header. Header names are
/// stored lowercased, so the lookup name is lowercased too.
pub async fn sessions_with_header(
    pool: &SqlitePool,
    config_id: &str,
    header_name: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE config_id = ? \
         AND json_extract(request_headers, '$.\"' || ? || '\"') IS NOT NULL \
         ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        SESSION_COLUMNS
    ))
    .bind(config_id)
    .bind(header_name.to_ascii_lowercase())
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

/// Sessions whose first value of the given header contains `value`.
pub async fn sessions_by_header_value(
    pool: &SqlitePool,
    config_id: &str,
    header_name: &str,
    value: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE config_id = ? \
         AND json_extract(request_headers, '$.\"' || ? || '\"[0]') LIKE ? \
         ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        SESSION_COLUMNS
    ))
    .bind(config_id)
    .bind(header_name.to_ascii_lowercase())
    .bind(format!("%{}%", value))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

pub async fn sessions_with_query_param(
    pool: &SqlitePool,
    config_id: &str,
    param_name: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions WHERE config_id = ? \
         AND json_extract(query_parameters, '$.\"' || ? || '\"') IS NOT NULL \
         ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        SESSION_COLUMNS
    ))
    .bind(config_id)
    .bind(param_name)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

/// Full-text search over captured bodies via the FTS5 shadow table.
pub async fn search_sessions(
    pool: &SqlitePool,
    config_id: &str,
    query: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<SessionRow>> {
    let columns: String = SESSION_COLUMNS
        .split(',')
        .map(|c| format!("s.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM proxy_sessions s \
         JOIN proxy_sessions_fts f ON s.id = f.session_id \
         WHERE f.config_id = ? AND f MATCH ? \
         ORDER BY s.timestamp DESC LIMIT ? OFFSET ?",
        columns
    ))
    .bind(config_id)
    .bind(query)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

pub async fn count_sessions(pool: &SqlitePool) -> anyhow::Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM proxy_sessions")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Ids of the `n` oldest sessions, oldest first; insertion order breaks
/// timestamp ties.
pub async fn oldest_session_ids(pool: &SqlitePool, n: i64) -> anyhow::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM proxy_sessions ORDER BY timestamp ASC, rowid ASC LIMIT ?",
    )
    .bind(n)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete the given sessions (and their FTS rows) in one transaction.
/// Bookmarks are untouched; they are independent snapshots.
pub async fn delete_sessions(pool: &SqlitePool, ids: &[String]) -> anyhow::Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let delete_sql = format!("DELETE FROM proxy_sessions WHERE id IN ({})", placeholders);
    let delete_fts_sql = format!(
        "DELETE FROM proxy_sessions_fts WHERE session_id IN ({})",
        placeholders
    );

    let mut tx = pool.begin().await?;

    let mut delete = sqlx::query(&delete_sql);
    for id in ids {
        delete = delete.bind(id);
    }
    let deleted = delete.execute(&mut *tx).await?.rows_affected();

    let mut delete_fts = sqlx::query(&delete_fts_sql);
    for id in ids {
        delete_fts = delete_fts.bind(id);
    }
    delete_fts.execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(deleted)
}

/// Retention by age: drop every session older than `cutoff`.
pub async fn delete_sessions_older_than(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM proxy_sessions WHERE timestamp < ?")
            .bind(cutoff)
            .fetch_all(pool)
            .await?;
    let ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
    delete_sessions(pool, &ids).await
}

pub async fn count_sessions_by_method(
    pool: &SqlitePool,
) -> anyhow::Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT request_method, COUNT(*) FROM proxy_sessions GROUP BY request_method",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

pub async fn average_duration_by_path(
    pool: &SqlitePool,
) -> anyhow::Result<HashMap<String, f64>> {
    let rows: Vec<(String, f64)> = sqlx::query_as(
        "SELECT request_path, AVG(duration_ms) FROM proxy_sessions GROUP BY request_path",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

#[cfg(test)]
pub(crate) fn test_start_params(config_id: &'static str) -> StartSessionParams<'static> {
    StartSessionParams {
        config_id,
        timestamp: Utc::now(),
        client_addr: "127.0.0.1:55001",
        client_ip: "127.0.0.1",
        method: "GET",
        path: "/foo",
        query: "x=1",
        proto: "HTTP/1.1",
        host: "localhost:3000",
        url_full: "/foo?x=1",
        headers_json: "{\"accept\":[\"*/*\"]}",
        query_params_json: "{\"x\":[\"1\"]}",
        body: b"",
        content_type: "",
        content_encoding: "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn session_lifecycle_pending_to_terminal() {
        let pool = memory_pool().await;
        let session = start_session(&pool, &test_start_params("cfg1"))
            .await
            .unwrap();
        assert!(session.is_pending());
        assert_eq!(session.duration_ms, 0);

        let stored = get_session(&pool, &session.id).await.unwrap().unwrap();
        assert_eq!(stored.response_status_code, 0);
        assert_eq!(stored.request_path, "/foo");
        assert_eq!(stored.request_query, "x=1");

        finish_session(
            &pool,
            &session.id,
            &FinishSessionParams {
                duration_ms: 42,
                status_code: 200,
                status_text: "OK",
                headers_json: "{\"x-upstream\":[\"1\"]}",
                body: b"ok",
                content_type: "text/plain",
                content_encoding: "",
            },
        )
        .await
        .unwrap();

        let stored = get_session(&pool, &session.id).await.unwrap().unwrap();
        assert!(!stored.is_pending());
        assert_eq!(stored.response_status_code, 200);
        assert_eq!(stored.response_status_text, "OK");
        assert_eq!(stored.response_body, b"ok");
        assert_eq!(stored.response_body_size, 2);
        assert_eq!(stored.duration_ms, 42);
    }

    #[tokio::test]
    async fn recent_respects_since_and_limit() {
        let pool = memory_pool().await;
        let base = Utc::now();

        for i in 0..4 {
            let mut params = test_start_params("cfg1");
            params.timestamp = base + Duration::seconds(i);
            start_session(&pool, &params).await.unwrap();
        }

        let all = recent_sessions(&pool, "cfg1", 0, 0, None).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all[0].timestamp > all[3].timestamp);

        let page = recent_sessions(&pool, "cfg1", 2, 0, None).await.unwrap();
        assert_eq!(page.len(), 2);

        let newer = recent_sessions(&pool, "cfg1", 0, 0, Some(base + Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(newer.len(), 2);

        let other = recent_sessions(&pool, "cfg2", 0, 0, None).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn errors_and_slow_filters() {
        let pool = memory_pool().await;

        let ok = start_session(&pool, &test_start_params("cfg1"))
            .await
            .unwrap();
        finish_session(
            &pool,
            &ok.id,
            &FinishSessionParams {
                duration_ms: 10,
                status_code: 200,
                status_text: "OK",
                headers_json: "{}",
                body: b"",
                content_type: "",
                content_encoding: "",
            },
        )
        .await
        .unwrap();

        let failed = start_session(&pool, &test_start_params("cfg1"))
            .await
            .unwrap();
        finish_session(
            &pool,
            &failed.id,
            &FinishSessionParams {
                duration_ms: 2500,
                status_code: 502,
                status_text: "Bad Gateway",
                headers_json: "{}",
                body: b"Bad Gateway",
                content_type: "",
                content_encoding: "",
            },
        )
        .await
        .unwrap();

        let errors = error_sessions(&pool, "cfg1", 20, 0).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id, failed.id);

        let slow = slow_sessions(&pool, "cfg1", 1000, 20, 0).await.unwrap();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].id, failed.id);

        let none_slow = slow_sessions(&pool, "cfg1", 5000, 20, 0).await.unwrap();
        assert!(none_slow.is_empty());
    }

    #[tokio::test]
    async fn header_and_query_param_lookups() {
        let pool = memory_pool().await;

        let mut params = test_start_params("cfg1");
        params.headers_json = "{\"x-trace-id\":[\"abc\"],\"accept\":[\"*/*\"]}";
        start_session(&pool, &params).await.unwrap();

        let mut other = test_start_params("cfg1");
        other.headers_json = "{\"accept\":[\"*/*\"]}";
        other.query_params_json = "{}";
        start_session(&pool, &other).await.unwrap();

        let hits = sessions_with_header(&pool, "cfg1", "X-Trace-Id", 20, 0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = sessions_by_header_value(&pool, "cfg1", "x-trace-id", "ab", 20, 0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = sessions_by_header_value(&pool, "cfg1", "x-trace-id", "zzz", 20, 0)
            .await
            .unwrap();
        assert!(misses.is_empty());

        let hits = sessions_with_query_param(&pool, "cfg1", "x", 20, 0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn full_text_search_matches_bodies() {
        let pool = memory_pool().await;

        let mut params = test_start_params("cfg1");
        params.body = b"the quick brown fox";
        let session = start_session(&pool, &params).await.unwrap();

        let hits = search_sessions(&pool, "cfg1", "quick", 20, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, session.id);

        finish_session(
            &pool,
            &session.id,
            &FinishSessionParams {
                duration_ms: 5,
                status_code: 200,
                status_text: "OK",
                headers_json: "{}",
                body: b"jumped over the lazy dog",
                content_type: "text/plain",
                content_encoding: "",
            },
        )
        .await
        .unwrap();

        let hits = search_sessions(&pool, "cfg1", "lazy", 20, 0).await.unwrap();
        assert_eq!(hits.len(), 1);

        let misses = search_sessions(&pool, "cfg2", "quick", 20, 0).await.unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn delete_oldest_trims_fts_too() {
        let pool = memory_pool().await;
        let base = Utc::now();

        let mut ids = Vec::new();
        for i in 0..4 {
            let mut params = test_start_params("cfg1");
            params.timestamp = base + Duration::seconds(i);
            params.body = b"needle in the body";
            ids.push(start_session(&pool, &params).await.unwrap().id);
        }

        let oldest = oldest_session_ids(&pool, 2).await.unwrap();
        assert_eq!(oldest, vec![ids[0].clone(), ids[1].clone()]);

        let deleted = delete_sessions(&pool, &oldest).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(count_sessions(&pool).await.unwrap(), 2);
        assert!(get_session(&pool, &ids[0]).await.unwrap().is_none());

        let hits = search_sessions(&pool, "cfg1", "needle", 20, 0).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_age() {
        let pool = memory_pool().await;
        let base = Utc::now();

        let mut params = test_start_params("cfg1");
        params.timestamp = base - Duration::hours(2);
        start_session(&pool, &params).await.unwrap();

        let mut params = test_start_params("cfg1");
        params.timestamp = base;
        start_session(&pool, &params).await.unwrap();

        let deleted = delete_sessions_older_than(&pool, base - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(count_sessions(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_group_by() {
        let pool = memory_pool().await;

        for method in ["GET", "GET", "POST"] {
            let mut params = test_start_params("cfg1");
            params.method = method;
            start_session(&pool, &params).await.unwrap();
        }

        let by_method = count_sessions_by_method(&pool).await.unwrap();
        assert_eq!(by_method.get("GET"), Some(&2));
        assert_eq!(by_method.get("POST"), Some(&1));

        let by_path = average_duration_by_path(&pool).await.unwrap();
        assert!(by_path.contains_key("/foo"));
    }
}
