use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use actix_web::dev::ServerHandle;

use common::config::SysConfig;

use crate::ProxyContext;

/// Process-wide, thread-safe store of the system configuration, the ordered
/// active config-id list, and the runtime context/listener maps. Every getter
/// returns copies so nothing escapes the lock.
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    sys_config: Option<Arc<SysConfig>>,
    config_ids: Vec<String>,
    contexts: HashMap<String, Arc<ProxyContext>>,
    servers: HashMap<String, ServerHandle>,
    latest_version: String,
    latest_version_tag: String,
}

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::new);

/// The shared per-process instance.
pub fn global() -> &'static Registry {
    &GLOBAL
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn set_sys_config(&self, cfg: Arc<SysConfig>) {
        self.inner.write().unwrap().sys_config = Some(cfg);
    }

    pub fn sys_config(&self) -> Option<Arc<SysConfig>> {
        self.inner.read().unwrap().sys_config.clone()
    }

    /// Append an id to the active list unless it is already present;
    /// insertion order is preserved.
    pub fn config_add(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        if !inner.config_ids.iter().any(|existing| existing == id) {
            inner.config_ids.push(id.to_string());
        }
    }

    pub fn config_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().config_ids.clone()
    }

    pub fn config_clear(&self) {
        self.inner.write().unwrap().config_ids.clear();
    }

    pub fn add_context(&self, id: &str, ctx: Arc<ProxyContext>) {
        self.inner.write().unwrap().contexts.insert(id.to_string(), ctx);
    }

    pub fn context(&self, id: &str) -> Option<Arc<ProxyContext>> {
        self.inner.read().unwrap().contexts.get(id).cloned()
    }

    pub fn has_context(&self, id: &str) -> bool {
        self.inner.read().unwrap().contexts.contains_key(id)
    }

    pub fn remove_context(&self, id: &str) -> bool {
        self.inner.write().unwrap().contexts.remove(id).is_some()
    }

    pub fn contexts(&self) -> HashMap<String, Arc<ProxyContext>> {
        self.inner.read().unwrap().contexts.clone()
    }

    pub fn add_server(&self, id: &str, handle: ServerHandle) {
        self.inner.write().unwrap().servers.insert(id.to_string(), handle);
    }

    pub fn server(&self, id: &str) -> Option<ServerHandle> {
        self.inner.read().unwrap().servers.get(id).cloned()
    }

    pub fn has_server(&self, id: &str) -> bool {
        self.inner.read().unwrap().servers.contains_key(id)
    }

    pub fn remove_server(&self, id: &str) -> bool {
        self.inner.write().unwrap().servers.remove(id).is_some()
    }

    pub fn set_latest_version(&self, version: &str, tag: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.latest_version = version.to_string();
        inner.latest_version_tag = tag.to_string();
    }

    pub fn latest_version(&self) -> (String, String) {
        let inner = self.inner.read().unwrap();
        (inner.latest_version.clone(), inner.latest_version_tag.clone())
    }
}
