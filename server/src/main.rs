mod api;
mod export;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use log::LevelFilter;
use sqlx::SqlitePool;

use common::config::{parse_proxy_arg, SysConfig};
use proxy::lifecycle::normalize_addr;
use proxy::{lifecycle, reaper, registry};

const DEFAULT_API_ADDR: &str = ":20000";
const DEFAULT_MAX_SESSIONS_RETAIN: i64 = 10_000;
const IN_MEMORY_MAX_SESSIONS_RETAIN: i64 = 100;

#[derive(Parser, Clone)]
#[command(
    name = "proxyscope",
    version,
    about = "An inspecting reverse proxy that captures HTTP traffic to a local database"
)]
struct Args {
    /// Path to the config file (default: ./.proxy.config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the capture database file
    #[arg(long)]
    db_path: Option<String>,

    /// Use an in-memory database (no persistence)
    #[arg(long)]
    in_memory: bool,

    /// Log level: debug, info, warn, error, or disabled
    #[arg(long)]
    log_level: Option<String>,

    /// Log destination: 'console', 'null', or a file path
    #[arg(long)]
    log_dest: Option<String>,

    /// Address of the control API, e.g. ":20000"
    #[arg(long)]
    api_addr: Option<String>,

    /// Proxy entries: `listen,target[,truncate]` or a bare target URL.
    /// When given, these replace the config file's [[proxies]].
    proxies: Vec<String>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1. Bootstrap configuration: file first, flags on top.
    let mut sys = SysConfig::load(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        sys.db_path = db_path;
    }
    if args.in_memory {
        sys.in_memory = true;
    }
    if let Some(level) = args.log_level {
        sys.log_level = level;
    }
    if let Some(dest) = args.log_dest {
        sys.log_dest = dest;
    }
    if let Some(api_addr) = args.api_addr {
        sys.api_addr = api_addr;
    }

    if sys.in_memory {
        sys.db_path = db::MEMORY_DB_PATH.to_string();
    }
    if sys.db_path.is_empty() {
        sys.db_path = db::default_db_path().display().to_string();
    }

    // 2. Open the database; persisted settings are resolved from it.
    let pool = db::init_pool(&sys.db_path).await?;

    if !sys.in_memory {
        if let Some(level) = db::get_setting(&pool, "log_level").await? {
            sys.log_level = level;
        }
        if let Some(dest) = db::get_setting(&pool, "log_dest").await? {
            sys.log_dest = dest;
        }
        if let Some(api_addr) = db::get_setting(&pool, "api_addr").await? {
            sys.api_addr = api_addr;
        }
    }
    if sys.log_level.is_empty() {
        sys.log_level = "info".to_string();
    }
    if sys.log_dest.is_empty() {
        sys.log_dest = "console".to_string();
    }
    if sys.api_addr.is_empty() {
        sys.api_addr = DEFAULT_API_ADDR.to_string();
    }

    if sys.in_memory {
        sys.max_sessions_retain = IN_MEMORY_MAX_SESSIONS_RETAIN;
    } else if let Some(retain) = db::get_setting(&pool, "max_sessions_retain").await? {
        if let Ok(value) = retain.parse::<i64>() {
            sys.max_sessions_retain = value;
        }
    }
    if sys.max_sessions_retain <= 0 {
        sys.max_sessions_retain = DEFAULT_MAX_SESSIONS_RETAIN;
    }

    setup_logger(&sys.log_level, &sys.log_dest);

    // Seed the store so the resolved values survive the next restart.
    if !sys.in_memory {
        seed_settings(&pool, &sys).await;
    }

    // 3. Command-line proxies replace the configured list.
    if !args.proxies.is_empty() {
        log::info!(
            "overriding proxy configuration with {} command-line entries",
            args.proxies.len()
        );
        let mut entries = Vec::with_capacity(args.proxies.len());
        for (i, raw) in args.proxies.iter().enumerate() {
            entries.push(parse_proxy_arg(raw, i)?);
        }
        sys.proxies = entries;
    }
    if sys.proxies.is_empty() {
        log::warn!("no [[proxies]] entries configured; only the api server will be active");
    }

    registry::global().set_sys_config(Arc::new(sys.clone()));

    // 4. Hub, reaper, proxy listeners, api server.
    let hub = ws::Hub::start();
    let publish = ws::publish_fn(&hub);

    reaper::start(pool.clone(), publish.clone(), reaper::DEFAULT_INTERVAL);

    for (i, entry) in sys.proxies.iter().enumerate() {
        lifecycle::start_proxy_server(i as i64, entry, &pool, publish.clone()).await?;
    }

    run_api_server(&sys.api_addr, pool, hub).await?;
    Ok(())
}

async fn run_api_server(api_addr: &str, pool: SqlitePool, hub: ws::Hub) -> anyhow::Result<()> {
    let addr = normalize_addr(api_addr);
    log::info!("api server listening on http://{}", addr);

    let pool_data = web::Data::new(pool);
    let hub_data = web::Data::new(hub);

    HttpServer::new(move || {
        App::new()
            .app_data(pool_data.clone())
            .app_data(hub_data.clone())
            .configure(api::configure)
    })
    .bind(&addr)?
    .run()
    .await?;
    Ok(())
}

async fn seed_settings(pool: &SqlitePool, sys: &SysConfig) {
    let seeds = [
        ("log_level", sys.log_level.clone()),
        ("log_dest", sys.log_dest.clone()),
        ("api_addr", sys.api_addr.clone()),
        (
            "max_sessions_retain",
            sys.max_sessions_retain.to_string(),
        ),
    ];
    for (key, value) in seeds {
        if let Err(e) = db::set_setting(pool, key, &value).await {
            log::warn!("failed to seed setting {}: {}", key, e);
        }
    }
}

fn setup_logger(log_level: &str, log_dest: &str) {
    let mut builder = env_logger::Builder::new();

    let filter = if log_level == "disabled" {
        LevelFilter::Off
    } else {
        log_level.parse().unwrap_or(LevelFilter::Info)
    };
    builder.filter_level(filter);

    match log_dest {
        "console" => {
            builder.target(env_logger::Target::Stderr);
        }
        "null" => {
            builder.filter_level(LevelFilter::Off);
        }
        path => match std::fs::OpenOptions::new().append(true).create(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("cannot open log file {}: {}; falling back to console", path, e);
                builder.target(env_logger::Target::Stderr);
            }
        },
    }

    let _ = builder.try_init();
}
