use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use sqlx::SqlitePool;
use url::Url;

use common::config::{ProxyEntry, CLI_SOURCE};
use common::models::PublishFn;

use crate::{forward, registry, ProxyContext};

/// Per-connection budget for receiving the request head.
const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful shutdown budget, after which the listener is force-closed.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Register a proxy entry and start its listener.
///
/// The config row is created (or re-read) first, so a later bind failure
/// leaves only a harmless orphan row that the same entry maps back onto.
/// Returns the config id the new sessions will carry.
pub async fn start_proxy_server(
    index: i64,
    entry: &ProxyEntry,
    pool: &SqlitePool,
    publish: PublishFn,
) -> anyhow::Result<String> {
    let target = Url::parse(&entry.target)
        .map_err(|_| anyhow::anyhow!("invalid target URL: {}", entry.target))?;
    if target.host_str().is_none() {
        anyhow::bail!("invalid target URL: {}", entry.target);
    }
    if entry.listen.is_empty() {
        anyhow::bail!("missing 'listen' address");
    }

    let (source_path, cwd) = registration_identity();
    let config_json = serde_json::to_string(entry)?;
    let row = db::get_or_create_config(pool, &source_path, &cwd, &config_json).await?;
    let config_id = row.id;

    registry::global().config_add(&config_id);

    let ctx = Arc::new(ProxyContext::new(
        config_id.clone(),
        entry,
        target,
        pool.clone(),
        publish,
    )?);
    registry::global().add_context(&config_id, ctx.clone());

    let addr = normalize_addr(&entry.listen);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(ctx.clone()))
            .default_service(web::to(forward))
    })
    .client_request_timeout(CLIENT_REQUEST_TIMEOUT)
    .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
    .disable_signals()
    .workers(2)
    .bind(&addr)?
    .run();

    registry::global().add_server(&config_id, server.handle());

    log::info!(
        "proxy server {} active: {} -> {} (config {})",
        index,
        entry.listen,
        entry.target,
        config_id
    );

    actix_web::rt::spawn(async move {
        if let Err(e) = server.await {
            log::error!("proxy server failed: {}", e);
        }
    });

    Ok(config_id)
}

/// Stop a running listener. Unknown ids are a no-op; a graceful stop gets a
/// 5 second budget before the listener is closed outright.
pub async fn stop_proxy_server(config_id: &str) {
    let Some(handle) = registry::global().server(config_id) else {
        log::warn!("proxy server {} not found, nothing to stop", config_id);
        return;
    };

    log::info!("stopping proxy server {}", config_id);

    if tokio::time::timeout(
        Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
        handle.stop(true),
    )
    .await
    .is_err()
    {
        log::warn!(
            "graceful shutdown of {} timed out, forcing close",
            config_id
        );
        handle.stop(false).await;
    }

    registry::global().remove_server(config_id);
    log::info!("proxy server {} stopped", config_id);
}

/// The identity a config row is registered under: the loaded config file (or
/// the CLI marker) and the working directory.
fn registration_identity() -> (String, String) {
    let source_path = registry::global()
        .sys_config()
        .map(|cfg| cfg.source_path())
        .unwrap_or_else(|| CLI_SOURCE.to_string());
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string());
    (source_path, cwd)
}

/// Listener addresses may be given as `:port`; bind those on all interfaces.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_addr_expands_bare_ports() {
        assert_eq!(normalize_addr(":3000"), "0.0.0.0:3000");
        assert_eq!(normalize_addr("127.0.0.1:3000"), "127.0.0.1:3000");
    }
}
