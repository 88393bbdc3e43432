use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;

use common::models::ProxyConfigRow;
use common::new_id;

/// Deterministic hex SHA-256 over the config identity triple.
pub fn config_fingerprint(source_path: &str, cwd: &str, config_json: &str) -> String {
    let data = format!("src:{}|cwd:{}|cfg:{}", source_path, cwd, config_json);
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Ensure the current environment is registered. Returns the existing row for
/// a known fingerprint; otherwise inserts a fresh one. If a concurrent writer
/// wins the insert, the winner's row is re-read and returned.
pub async fn get_or_create_config(
    pool: &SqlitePool,
    source_path: &str,
    cwd: &str,
    config_json: &str,
) -> anyhow::Result<ProxyConfigRow> {
    let fingerprint = config_fingerprint(source_path, cwd, config_json);

    if let Some(row) = get_config_by_fingerprint(pool, &fingerprint).await? {
        return Ok(row);
    }

    let row = ProxyConfigRow {
        id: new_id(),
        created_at: Utc::now(),
        source_path: source_path.to_string(),
        cwd: cwd.to_string(),
        config_json: config_json.to_string(),
        fingerprint: fingerprint.clone(),
    };

    let inserted = sqlx::query(
        "INSERT INTO proxy_configs (id, created_at, source_path, cwd, config_json, fingerprint) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(row.created_at)
    .bind(&row.source_path)
    .bind(&row.cwd)
    .bind(&row.config_json)
    .bind(&row.fingerprint)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => Ok(row),
        Err(e) => {
            // Another writer slipped in between the lookup and the insert;
            // the unique fingerprint means its row is ours too.
            if let Some(existing) = get_config_by_fingerprint(pool, &fingerprint).await? {
                return Ok(existing);
            }
            Err(e.into())
        }
    }
}

pub async fn get_config(pool: &SqlitePool, id: &str) -> anyhow::Result<Option<ProxyConfigRow>> {
    Ok(sqlx::query_as::<_, ProxyConfigRow>(
        "SELECT id, created_at, source_path, cwd, config_json, fingerprint \
         FROM proxy_configs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

async fn get_config_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &str,
) -> anyhow::Result<Option<ProxyConfigRow>> {
    Ok(sqlx::query_as::<_, ProxyConfigRow>(
        "SELECT id, created_at, source_path, cwd, config_json, fingerprint \
         FROM proxy_configs WHERE fingerprint = ?",
    )
    .bind(fingerprint)
    .fetch_optional(pool)
    .await?)
}

/// Past configurations, newest first, optionally filtered by a substring of
/// the stored config JSON.
pub async fn config_history(
    pool: &SqlitePool,
    query: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<ProxyConfigRow>> {
    let rows = match query {
        Some(q) if !q.is_empty() => {
            sqlx::query_as::<_, ProxyConfigRow>(
                "SELECT id, created_at, source_path, cwd, config_json, fingerprint \
                 FROM proxy_configs WHERE config_json LIKE ? \
                 ORDER BY created_at DESC LIMIT ?",
            )
            .bind(format!("%{}%", q))
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        _ => {
            sqlx::query_as::<_, ProxyConfigRow>(
                "SELECT id, created_at, source_path, cwd, config_json, fingerprint \
                 FROM proxy_configs ORDER BY created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}
