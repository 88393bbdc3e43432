use std::sync::Arc;

use common::config::ProxyEntry;
use common::models::PublishFn;
use proxy::{lifecycle, registry};

fn noop_publish() -> PublishFn {
    Arc::new(|_, _| {})
}

#[actix_web::test]
async fn start_registers_and_stop_removes_the_listener() {
    let pool = db::init_pool(":memory:").await.unwrap();
    let entry = ProxyEntry {
        listen: "127.0.0.1:0".to_string(),
        target: "http://127.0.0.1:9/".to_string(),
        truncate_log_body: true,
    };

    let id = lifecycle::start_proxy_server(0, &entry, &pool, noop_publish())
        .await
        .unwrap();

    assert!(registry::global().has_server(&id));
    assert!(registry::global().has_context(&id));
    assert!(registry::global().config_ids().contains(&id));

    let row = db::get_config(&pool, &id).await.unwrap().unwrap();
    assert!(row.config_json.contains("http://127.0.0.1:9/"));

    lifecycle::stop_proxy_server(&id).await;
    assert!(!registry::global().has_server(&id));
    // The runtime context and the config row stay behind for restart.
    assert!(registry::global().has_context(&id));

    // Stopping an unknown id is a warning no-op.
    lifecycle::stop_proxy_server("missing-id").await;
}

#[actix_web::test]
async fn start_rejects_invalid_entries() {
    let pool = db::init_pool(":memory:").await.unwrap();

    let bad_target = ProxyEntry {
        listen: ":0".to_string(),
        target: "not a url".to_string(),
        truncate_log_body: false,
    };
    assert!(
        lifecycle::start_proxy_server(0, &bad_target, &pool, noop_publish())
            .await
            .is_err()
    );

    let no_listen = ProxyEntry {
        listen: String::new(),
        target: "http://localhost:8000".to_string(),
        truncate_log_body: false,
    };
    assert!(
        lifecycle::start_proxy_server(0, &no_listen, &pool, noop_publish())
            .await
            .is_err()
    );

    // Validation failures never reach the store.
    let history = db::config_history(&pool, None, 10).await.unwrap();
    assert!(history.is_empty());
}
