use std::time::Duration;

use sqlx::SqlitePool;

use common::models::{Event, PublishFn};

use crate::registry;

/// Default cadence of the retention sweep.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Launch the retention reaper: one sweep immediately, then one per
/// interval. The retention cap is re-read from the registry on every tick so
/// persisted setting changes take effect without restarting the task.
pub fn start(pool: SqlitePool, publish: PublishFn, interval: Duration) {
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let max_retain = registry::global()
                .sys_config()
                .map(|cfg| cfg.max_sessions_retain)
                .unwrap_or(0);
            if max_retain <= 0 {
                continue;
            }

            match reap_once(&pool, max_retain, &publish).await {
                Ok(0) => {}
                Ok(deleted) => log::info!("session reaper deleted {} old sessions", deleted),
                Err(e) => log::error!("session reaper pass failed: {}", e),
            }
        }
    });
}

/// One retention pass: trim the session population down to `max_retain` by
/// deleting the oldest rows in a single transaction, then announce the
/// deleted ids. Bookmarks are independent snapshots and are never touched.
pub async fn reap_once(
    pool: &SqlitePool,
    max_retain: i64,
    publish: &PublishFn,
) -> anyhow::Result<usize> {
    let count = db::count_sessions(pool).await?;
    if count <= max_retain {
        return Ok(0);
    }

    let over = count - max_retain;
    log::info!(
        "session count {} over retention limit {}, trimming {}",
        count,
        max_retain,
        over
    );

    let ids = db::oldest_session_ids(pool, over).await?;
    if ids.is_empty() {
        return Ok(0);
    }

    db::delete_sessions(pool, &ids).await?;

    publish("sessions", Event::DeleteSession { ids: ids.clone() });
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::{Duration as ChronoDuration, Utc};

    fn collector() -> (PublishFn, Arc<Mutex<Vec<(String, Event)>>>) {
        let events: Arc<Mutex<Vec<(String, Event)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let publish: PublishFn = Arc::new(move |topic, event| {
            sink.lock().unwrap().push((topic.to_string(), event));
        });
        (publish, events)
    }

    async fn seed_sessions(pool: &SqlitePool, n: i64) -> Vec<String> {
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..n {
            let session = db::start_session(
                pool,
                &db::StartSessionParams {
                    config_id: "cfg1",
                    timestamp: base + ChronoDuration::seconds(i),
                    client_addr: "127.0.0.1:55001",
                    client_ip: "127.0.0.1",
                    method: "GET",
                    path: "/",
                    query: "",
                    proto: "HTTP/1.1",
                    host: "localhost",
                    url_full: "/",
                    headers_json: "{}",
                    query_params_json: "{}",
                    body: b"",
                    content_type: "",
                    content_encoding: "",
                },
            )
            .await
            .unwrap();
            ids.push(session.id);
        }
        ids
    }

    #[tokio::test]
    async fn trims_to_the_cap_and_announces_ids() {
        let pool = db::init_pool(":memory:").await.unwrap();
        let ids = seed_sessions(&pool, 4).await;
        let (publish, events) = collector();

        let deleted = reap_once(&pool, 2, &publish).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db::count_sessions(&pool).await.unwrap(), 2);

        // The two oldest are gone, the two newest remain.
        assert!(db::get_session(&pool, &ids[0]).await.unwrap().is_none());
        assert!(db::get_session(&pool, &ids[1]).await.unwrap().is_none());
        assert!(db::get_session(&pool, &ids[2]).await.unwrap().is_some());
        assert!(db::get_session(&pool, &ids[3]).await.unwrap().is_some());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "sessions");
        match &events[0].1 {
            Event::DeleteSession { ids: deleted_ids } => {
                assert_eq!(deleted_ids, &vec![ids[0].clone(), ids[1].clone()]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn under_cap_is_a_no_op() {
        let pool = db::init_pool(":memory:").await.unwrap();
        seed_sessions(&pool, 2).await;
        let (publish, events) = collector();

        let deleted = reap_once(&pool, 5, &publish).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(db::count_sessions(&pool).await.unwrap(), 2);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_passes_hold_the_invariant() {
        let pool = db::init_pool(":memory:").await.unwrap();
        seed_sessions(&pool, 6).await;
        let (publish, _) = collector();

        reap_once(&pool, 3, &publish).await.unwrap();
        assert_eq!(db::count_sessions(&pool).await.unwrap(), 3);

        let deleted = reap_once(&pool, 3, &publish).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(db::count_sessions(&pool).await.unwrap(), 3);
    }
}
