use common::config::SysConfig;
use proxy::registry;

/// Rewrite the loaded config file so its `[[proxies]]` section reflects the
/// currently running listeners, in activation order. System-wide settings are
/// carried over from the resolved configuration.
pub fn export_current_proxies() -> anyhow::Result<()> {
    let registry = registry::global();
    let Some(sys) = registry.sys_config() else {
        anyhow::bail!("system configuration not available");
    };
    let Some(path) = sys.config_file.clone() else {
        anyhow::bail!("no config file loaded; nothing to export to");
    };

    let mut exported: SysConfig = (*sys).clone();
    exported.proxies = registry
        .config_ids()
        .into_iter()
        .filter(|id| registry.has_server(id))
        .filter_map(|id| registry.context(&id))
        .map(|ctx| ctx.entry.clone())
        .collect();

    let contents = toml::to_string_pretty(&exported)?;
    std::fs::write(&path, contents)?;

    log::info!(
        "exported {} running proxies to {}",
        exported.proxies.len(),
        path.display()
    );
    Ok(())
}
