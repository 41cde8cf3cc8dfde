//! Service registry and rule source.
//!
//! Both are push based: subscribers get the current state on subscription
//! and again after every change.

use crate::rule::{GatewayFile, LoadError, Rule, ServiceDefinition, ServiceInstance};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives the full instance set of one service.
pub type ServicesListener = Arc<dyn Fn(ServiceDefinition, Vec<ServiceInstance>) + Send + Sync>;

/// Receives the full rule list.
pub type RulesListener = Arc<dyn Fn(Vec<Rule>) + Send + Sync>;

/// Service membership.
pub trait RegisterCenter: Send + Sync {
    /// Adds or replaces an instance of a service.
    fn register(&self, definition: ServiceDefinition, instance: ServiceInstance);

    /// Removes an instance.
    fn deregister(&self, definition: &ServiceDefinition, instance: &ServiceInstance);

    /// Subscribes to membership changes of every service.
    fn subscribe_all_services(&self, listener: ServicesListener);
}

/// Source of routing rules.
pub trait ConfigCenter: Send + Sync {
    /// Subscribes to rule changes.
    fn subscribe_rules_change(&self, listener: RulesListener);
}

#[derive(Default)]
struct Membership {
    services: HashMap<String, (ServiceDefinition, Vec<ServiceInstance>)>,
    listeners: Vec<ServicesListener>,
}

/// Registry kept in process memory. Listeners are notified synchronously,
/// one change at a time and in the order the changes were applied. A
/// listener may read the center but must not change it.
#[derive(Default)]
pub struct InMemoryRegisterCenter {
    inner: RwLock<Membership>,
    notify: Mutex<()>,
}

impl InMemoryRegisterCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole instance set of a service.
    pub fn replace_service(&self, definition: ServiceDefinition, instances: Vec<ServiceInstance>) {
        let _ordered = self.notify.lock();
        let listeners = {
            let mut inner = self.inner.write();
            inner
                .services
                .insert(definition.unique_id.clone(), (definition.clone(), instances.clone()));
            inner.listeners.clone()
        };
        for listener in listeners {
            listener(definition.clone(), instances.clone());
        }
    }

    /// Instances currently registered for a service.
    pub fn instances(&self, unique_id: &str) -> Vec<ServiceInstance> {
        self.inner
            .read()
            .services
            .get(unique_id)
            .map(|(_, instances)| instances.clone())
            .unwrap_or_default()
    }

    fn update<F>(&self, definition: &ServiceDefinition, change: F)
    where
        F: FnOnce(&mut Vec<ServiceInstance>),
    {
        let _ordered = self.notify.lock();
        let (snapshot, listeners) = {
            let mut inner = self.inner.write();
            let entry = inner
                .services
                .entry(definition.unique_id.clone())
                .or_insert_with(|| (definition.clone(), Vec::new()));
            entry.0 = definition.clone();
            change(&mut entry.1);
            (entry.1.clone(), inner.listeners.clone())
        };
        for listener in listeners {
            listener(definition.clone(), snapshot.clone());
        }
    }
}

impl RegisterCenter for InMemoryRegisterCenter {
    fn register(&self, definition: ServiceDefinition, instance: ServiceInstance) {
        debug!(unique_id = %definition.unique_id, instance = %instance.service_instance_id, "registering instance");
        self.update(&definition, |instances| {
            instances.retain(|i| i.service_instance_id != instance.service_instance_id);
            instances.push(instance);
        });
    }

    fn deregister(&self, definition: &ServiceDefinition, instance: &ServiceInstance) {
        debug!(unique_id = %definition.unique_id, instance = %instance.service_instance_id, "deregistering instance");
        self.update(definition, |instances| {
            instances.retain(|i| i.service_instance_id != instance.service_instance_id);
        });
    }

    fn subscribe_all_services(&self, listener: ServicesListener) {
        let _ordered = self.notify.lock();
        let current: Vec<_> = {
            let mut inner = self.inner.write();
            inner.listeners.push(Arc::clone(&listener));
            inner.services.values().cloned().collect()
        };
        for (definition, instances) in current {
            listener(definition, instances);
        }
    }
}

/// Rules (and optionally services) read from a TOML or JSON file, reloaded
/// when the file's modification time changes.
pub struct FileConfigCenter {
    path: PathBuf,
    register: Option<Arc<InMemoryRegisterCenter>>,
    listeners: RwLock<Vec<RulesListener>>,
    current: RwLock<GatewayFile>,
    modified: RwLock<Option<SystemTime>>,
}

impl FileConfigCenter {
    /// Loads the file once. Fails if it cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        let file = GatewayFile::load(&path)?;
        info!(
            path = %path.display(),
            rules = file.rules.len(),
            services = file.services.len(),
            "rules file loaded"
        );
        Ok(Self {
            modified: RwLock::new(modified_at(&path)),
            path,
            register: None,
            listeners: RwLock::new(Vec::new()),
            current: RwLock::new(file),
        })
    }

    /// Also publishes the file's services into `register`, now and on every
    /// reload.
    pub fn with_register_center(mut self, register: Arc<InMemoryRegisterCenter>) -> Self {
        self.publish_services(&register, &self.current.read());
        self.register = Some(register);
        self
    }

    /// Path of the watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file if its modification time changed. Returns whether
    /// new content was pushed. A file that fails to parse keeps the previous
    /// content.
    pub fn reload_if_changed(&self) -> bool {
        let modified = modified_at(&self.path);
        if modified == *self.modified.read() {
            return false;
        }
        *self.modified.write() = modified;

        let file = match GatewayFile::load(&self.path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "keeping previous rules");
                return false;
            }
        };
        info!(path = %self.path.display(), rules = file.rules.len(), "rules file reloaded");

        if let Some(register) = &self.register {
            self.publish_services(register, &file);
        }
        let rules = file.rules.clone();
        *self.current.write() = file;
        for listener in self.listeners.read().iter() {
            listener(rules.clone());
        }
        true
    }

    /// Polls the file every `interval` until shutdown.
    pub fn watch(self: &Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let center = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        center.reload_if_changed();
                    }
                    _ = shutdown.recv() => {
                        debug!("rules watcher stopped");
                        break;
                    }
                }
            }
        })
    }

    fn publish_services(&self, register: &InMemoryRegisterCenter, file: &GatewayFile) {
        for entry in &file.services {
            register.replace_service(entry.definition.clone(), entry.instances.clone());
        }
    }
}

impl ConfigCenter for FileConfigCenter {
    fn subscribe_rules_change(&self, listener: RulesListener) {
        self.listeners.write().push(Arc::clone(&listener));
        let rules = self.current.read().rules.clone();
        listener(rules);
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
