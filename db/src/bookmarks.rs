use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use common::models::BookmarkRow;
use common::new_id;

use crate::{configs, sessions};

const BOOKMARK_COLUMNS: &str = "id, session_id, created_at, note, tags, config_id, \
     timestamp, duration_ms, client_addr, client_ip, \
     request_method, request_path, request_query, request_proto, request_host, \
     request_url_full, request_headers, query_parameters, request_body, \
     request_body_size, request_content_type, request_content_encoding, \
     response_status_code, response_status_text, response_headers, response_body, \
     response_body_size, response_content_type, response_content_encoding, \
     config_source_path, config_json";

/// Create a bookmark by copying every field of the session (and its config
/// snapshot) by value, so the bookmark outlives reaper deletion of the
/// source. Returns `None` when the session does not exist.
pub async fn create_bookmark(
    pool: &SqlitePool,
    session_id: &str,
) -> anyhow::Result<Option<BookmarkRow>> {
    let Some(session) = sessions::get_session(pool, session_id).await? else {
        return Ok(None);
    };

    let config = if session.config_id.is_empty() {
        None
    } else {
        configs::get_config(pool, &session.config_id).await?
    };

    let bookmark = BookmarkRow {
        id: new_id(),
        session_id: session.id.clone(),
        created_at: Utc::now(),
        note: String::new(),
        tags: String::new(),
        config_id: session.config_id,
        timestamp: session.timestamp,
        duration_ms: session.duration_ms,
        client_addr: session.client_addr,
        client_ip: session.client_ip,
        request_method: session.request_method,
        request_path: session.request_path,
        request_query: session.request_query,
        request_proto: session.request_proto,
        request_host: session.request_host,
        request_url_full: session.request_url_full,
        request_headers: session.request_headers,
        query_parameters: session.query_parameters,
        request_body: session.request_body,
        request_body_size: session.request_body_size,
        request_content_type: session.request_content_type,
        request_content_encoding: session.request_content_encoding,
        response_status_code: session.response_status_code,
        response_status_text: session.response_status_text,
        response_headers: session.response_headers,
        response_body: session.response_body,
        response_body_size: session.response_body_size,
        response_content_type: session.response_content_type,
        response_content_encoding: session.response_content_encoding,
        config_source_path: config
            .as_ref()
            .map(|c| c.source_path.clone())
            .unwrap_or_default(),
        config_json: config.map(|c| c.config_json).unwrap_or_default(),
    };

    sqlx::query(&format!(
        "INSERT INTO proxy_bookmarks ({}) VALUES \
         (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        BOOKMARK_COLUMNS
    ))
    .bind(&bookmark.id)
    .bind(&bookmark.session_id)
    .bind(bookmark.created_at)
    .bind(&bookmark.note)
    .bind(&bookmark.tags)
    .bind(&bookmark.config_id)
    .bind(bookmark.timestamp)
    .bind(bookmark.duration_ms)
    .bind(&bookmark.client_addr)
    .bind(&bookmark.client_ip)
    .bind(&bookmark.request_method)
    .bind(&bookmark.request_path)
    .bind(&bookmark.request_query)
    .bind(&bookmark.request_proto)
    .bind(&bookmark.request_host)
    .bind(&bookmark.request_url_full)
    .bind(&bookmark.request_headers)
    .bind(&bookmark.query_parameters)
    .bind(&bookmark.request_body)
    .bind(bookmark.request_body_size)
    .bind(&bookmark.request_content_type)
    .bind(&bookmark.request_content_encoding)
    .bind(bookmark.response_status_code)
    .bind(&bookmark.response_status_text)
    .bind(&bookmark.response_headers)
    .bind(&bookmark.response_body)
    .bind(bookmark.response_body_size)
    .bind(&bookmark.response_content_type)
    .bind(&bookmark.response_content_encoding)
    .bind(&bookmark.config_source_path)
    .bind(&bookmark.config_json)
    .execute(pool)
    .await?;

    let body_text = format!(
        "{} {}",
        String::from_utf8_lossy(&bookmark.request_body),
        String::from_utf8_lossy(&bookmark.response_body)
    );
    sqlx::query(
        "INSERT INTO proxy_bookmarks_fts (bookmark_id, config_id, body, note, tags) \
         VALUES (?, ?, ?, '', '')",
    )
    .bind(&bookmark.id)
    .bind(&bookmark.config_id)
    .bind(body_text)
    .execute(pool)
    .await?;

    Ok(Some(bookmark))
}

pub async fn get_bookmark(pool: &SqlitePool, id: &str) -> anyhow::Result<Option<BookmarkRow>> {
    Ok(sqlx::query_as::<_, BookmarkRow>(&format!(
        "SELECT {} FROM proxy_bookmarks WHERE id = ?",
        BOOKMARK_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

/// The canonical "is this session bookmarked" test; returns the bookmark id.
pub async fn is_session_bookmarked(
    pool: &SqlitePool,
    session_id: &str,
) -> anyhow::Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT id FROM proxy_bookmarks WHERE session_id = ? LIMIT 1")
            .bind(session_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(id,)| id))
}

/// Update the user metadata. Every captured field stays frozen.
pub async fn update_bookmark(
    pool: &SqlitePool,
    id: &str,
    note: &str,
    tags: &str,
) -> anyhow::Result<Option<BookmarkRow>> {
    let updated = sqlx::query("UPDATE proxy_bookmarks SET note = ?, tags = ? WHERE id = ?")
        .bind(note)
        .bind(tags)
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Ok(None);
    }

    sqlx::query("UPDATE proxy_bookmarks_fts SET note = ?, tags = ? WHERE bookmark_id = ?")
        .bind(note)
        .bind(tags)
        .bind(id)
        .execute(pool)
        .await?;

    get_bookmark(pool, id).await
}

pub async fn delete_bookmark(pool: &SqlitePool, id: &str) -> anyhow::Result<bool> {
    let deleted = sqlx::query("DELETE FROM proxy_bookmarks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM proxy_bookmarks_fts WHERE bookmark_id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(deleted > 0)
}

/// Paginated bookmark listing, newest first, with the unpaginated total.
/// `config_id` scopes to one config; `query` goes through the FTS index.
pub async fn list_bookmarks(
    pool: &SqlitePool,
    config_id: Option<&str>,
    query: Option<&str>,
    limit: i64,
    offset: i64,
) -> anyhow::Result<(Vec<BookmarkRow>, i64)> {
    let mut clauses: Vec<&str> = Vec::new();
    let config_id = config_id.filter(|c| !c.is_empty());
    let query = query.filter(|q| !q.is_empty());

    if config_id.is_some() {
        clauses.push("config_id = ?");
    }
    if query.is_some() {
        clauses.push(
            "id IN (SELECT bookmark_id FROM proxy_bookmarks_fts \
             WHERE proxy_bookmarks_fts MATCH ?)",
        );
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM proxy_bookmarks{}", where_sql);
    let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
    if let Some(c) = config_id {
        count_query = count_query.bind(c);
    }
    if let Some(q) = query {
        count_query = count_query.bind(q);
    }
    let (total,) = count_query.fetch_one(pool).await?;

    let page_sql = format!(
        "SELECT {} FROM proxy_bookmarks{} ORDER BY created_at DESC LIMIT ? OFFSET ?",
        BOOKMARK_COLUMNS, where_sql
    );
    let mut page_query = sqlx::query_as::<_, BookmarkRow>(&page_sql);
    if let Some(c) = config_id {
        page_query = page_query.bind(c);
    }
    if let Some(q) = query {
        page_query = page_query.bind(q);
    }
    page_query = page_query.bind(limit).bind(offset);
    let bookmarks = page_query.fetch_all(pool).await?;

    Ok((bookmarks, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool;
    use crate::sessions::{
        delete_sessions, finish_session, start_session, test_start_params, FinishSessionParams,
    };

    async fn captured_session(pool: &SqlitePool) -> String {
        let mut params = test_start_params("cfg1");
        params.body = b"request payload";
        let session = start_session(pool, &params).await.unwrap();
        finish_session(
            pool,
            &session.id,
            &FinishSessionParams {
                duration_ms: 12,
                status_code: 200,
                status_text: "OK",
                headers_json: "{}",
                body: b"response payload",
                content_type: "text/plain",
                content_encoding: "",
            },
        )
        .await
        .unwrap();
        session.id
    }

    #[tokio::test]
    async fn bookmark_is_a_value_copy() {
        let pool = memory_pool().await;
        let session_id = captured_session(&pool).await;

        let bookmark = create_bookmark(&pool, &session_id).await.unwrap().unwrap();
        assert_eq!(bookmark.session_id, session_id);
        assert_eq!(bookmark.request_body, b"request payload");
        assert_eq!(bookmark.response_body, b"response payload");
        assert_eq!(bookmark.response_status_code, 200);
    }

    #[tokio::test]
    async fn bookmark_survives_session_deletion() {
        let pool = memory_pool().await;
        let session_id = captured_session(&pool).await;

        let bookmark = create_bookmark(&pool, &session_id).await.unwrap().unwrap();
        delete_sessions(&pool, &[session_id.clone()]).await.unwrap();

        let kept = get_bookmark(&pool, &bookmark.id).await.unwrap().unwrap();
        assert_eq!(kept.session_id, session_id);
        assert_eq!(kept.request_body, b"request payload");
        assert_eq!(kept.response_body, b"response payload");
        assert_eq!(kept.response_status_text, "OK");
    }

    #[tokio::test]
    async fn bookmarking_unknown_session_is_none() {
        let pool = memory_pool().await;
        assert!(create_bookmark(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn is_session_bookmarked_roundtrip() {
        let pool = memory_pool().await;
        let session_id = captured_session(&pool).await;

        assert!(is_session_bookmarked(&pool, &session_id)
            .await
            .unwrap()
            .is_none());

        let bookmark = create_bookmark(&pool, &session_id).await.unwrap().unwrap();
        assert_eq!(
            is_session_bookmarked(&pool, &session_id).await.unwrap(),
            Some(bookmark.id)
        );
    }

    #[tokio::test]
    async fn update_touches_only_metadata() {
        let pool = memory_pool().await;
        let session_id = captured_session(&pool).await;
        let bookmark = create_bookmark(&pool, &session_id).await.unwrap().unwrap();

        let updated = update_bookmark(&pool, &bookmark.id, "note", "a,b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.note, "note");
        assert_eq!(updated.tags, "a,b");
        assert_eq!(updated.request_body, bookmark.request_body);

        assert!(update_bookmark(&pool, "missing", "n", "t")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn listing_filters_and_counts() {
        let pool = memory_pool().await;

        for _ in 0..3 {
            let session_id = captured_session(&pool).await;
            create_bookmark(&pool, &session_id).await.unwrap();
        }

        let (page, total) = list_bookmarks(&pool, None, None, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 3);

        let (page, total) = list_bookmarks(&pool, Some("cfg1"), None, 50, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(total, 3);

        let (page, total) = list_bookmarks(&pool, Some("other"), None, 50, 0)
            .await
            .unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 0);

        let (page, total) = list_bookmarks(&pool, None, Some("payload"), 50, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(total, 3);

        let (page, _) = list_bookmarks(&pool, None, Some("absent"), 50, 0)
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn fts_sees_note_updates() {
        let pool = memory_pool().await;
        let session_id = captured_session(&pool).await;
        let bookmark = create_bookmark(&pool, &session_id).await.unwrap().unwrap();

        update_bookmark(&pool, &bookmark.id, "remember this regression", "")
            .await
            .unwrap();

        let (hits, _) = list_bookmarks(&pool, None, Some("regression"), 50, 0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, bookmark.id);

        assert!(delete_bookmark(&pool, &bookmark.id).await.unwrap());
        let (hits, _) = list_bookmarks(&pool, None, Some("regression"), 50, 0)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
