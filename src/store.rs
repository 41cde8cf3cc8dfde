//! In-memory rule and instance store.
//!
//! Readers load an immutable snapshot and never block; updates from the
//! config center and the registry build a new snapshot and swap it in whole.

use crate::error::{GatewayError, Result};
use crate::rule::{Rule, ServiceDefinition, ServiceInstance};
use arc_swap::ArcSwap;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Full view of the rules at one point in time.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    rules: HashMap<String, Arc<Rule>>,
    by_path: HashMap<String, Arc<Rule>>,
    by_service: HashMap<String, Vec<Arc<Rule>>>,
}

impl RuleSnapshot {
    /// Indexes rules by id, by `serviceId.path` and by service id.
    pub fn build(rules: Vec<Rule>) -> Self {
        let mut snapshot = Self::default();
        for mut rule in rules {
            rule.dedup_filters();
            let rule = Arc::new(rule);
            for path in &rule.paths {
                snapshot
                    .by_path
                    .entry(path_key(&rule.service_id, path))
                    .and_modify(|existing| {
                        if rule.precedence(existing) == Ordering::Less {
                            *existing = Arc::clone(&rule);
                        }
                    })
                    .or_insert_with(|| Arc::clone(&rule));
            }
            snapshot
                .by_service
                .entry(rule.service_id.clone())
                .or_default()
                .push(Arc::clone(&rule));
            snapshot.rules.insert(rule.id.clone(), rule);
        }
        for rules in snapshot.by_service.values_mut() {
            rules.sort_by(|a, b| a.precedence(b));
        }
        snapshot
    }

    /// Resolves the single rule for a service and request path.
    ///
    /// An exact path wins. Otherwise the longest matching prefix wins, with
    /// rule order breaking ties.
    pub fn resolve(&self, service_id: &str, path: &str) -> Option<Arc<Rule>> {
        if let Some(rule) = self.by_path.get(&path_key(service_id, path)) {
            return Some(Arc::clone(rule));
        }

        let candidates = self.by_service.get(service_id)?;
        let mut best: Option<&Arc<Rule>> = None;
        for rule in candidates {
            if rule.prefix.is_empty() || !path.starts_with(rule.prefix.as_str()) {
                continue;
            }
            best = match best {
                Some(current) if current.prefix.len() >= rule.prefix.len() => Some(current),
                _ => Some(rule),
            };
        }
        best.map(Arc::clone)
    }

    /// Rule by id.
    pub fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.get(id).map(Arc::clone)
    }

    /// Rules of a service, sorted by order then id.
    pub fn rules_for_service(&self, service_id: &str) -> Vec<Arc<Rule>> {
        self.by_service.get(service_id).cloned().unwrap_or_default()
    }

    /// All rules sorted by order then id.
    pub fn all(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = self.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.precedence(b));
        rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the snapshot holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn path_key(service_id: &str, path: &str) -> String {
    format!("{}.{}", service_id, path)
}

/// Registered services and their instances.
#[derive(Debug, Default, Clone)]
struct ServiceTable {
    definitions: HashMap<String, ServiceDefinition>,
    instances: HashMap<String, Arc<Vec<ServiceInstance>>>,
}

/// Concurrently readable rule and instance store.
///
/// # Example
///
/// ```
/// use rust_apigateway::rule::{Rule, ServiceDefinition, ServiceInstance};
/// use rust_apigateway::store::DynamicConfigStore;
///
/// let store = DynamicConfigStore::new();
/// store.put_all_rules(vec![Rule::new("r1", "svc-a").with_path("/ping")]);
/// store.put_service_instances(
///     ServiceDefinition::new("svc-a"),
///     vec![ServiceInstance::new("svc-a", "127.0.0.1", 8080)],
/// );
///
/// assert!(store.resolve_rule("svc-a", "/ping").is_ok());
/// assert_eq!(store.service_instances("svc-a", false).len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct DynamicConfigStore {
    rules: ArcSwap<RuleSnapshot>,
    services: ArcSwap<ServiceTable>,
}

impl DynamicConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every rule with the given list.
    pub fn put_all_rules(&self, rules: Vec<Rule>) {
        let snapshot = RuleSnapshot::build(rules);
        debug!(rules = snapshot.len(), "rule snapshot replaced");
        self.rules.store(Arc::new(snapshot));
    }

    /// Current rule snapshot.
    pub fn rules(&self) -> Arc<RuleSnapshot> {
        self.rules.load_full()
    }

    /// Resolves the rule for a request, failing with `PathNoMatched`.
    pub fn resolve_rule(&self, service_id: &str, path: &str) -> Result<Arc<Rule>> {
        self.rules
            .load()
            .resolve(service_id, path)
            .ok_or_else(|| GatewayError::PathNoMatched {
                service_id: service_id.to_string(),
                path: path.to_string(),
            })
    }

    /// Replaces the instance set of one service.
    pub fn put_service_instances(&self, definition: ServiceDefinition, instances: Vec<ServiceInstance>) {
        let mut instances = instances;
        instances.sort_by(|a, b| a.service_instance_id.cmp(&b.service_instance_id));
        instances.dedup_by(|a, b| a.service_instance_id == b.service_instance_id);
        let instances = Arc::new(instances);

        self.services.rcu(|table| {
            let mut table = ServiceTable::clone(table);
            table
                .instances
                .insert(definition.unique_id.clone(), Arc::clone(&instances));
            table
                .definitions
                .insert(definition.unique_id.clone(), definition.clone());
            table
        });
        debug!(
            unique_id = %definition.unique_id,
            instances = instances.len(),
            "instance set replaced"
        );
    }

    /// Removes a service and all its instances.
    pub fn remove_service(&self, unique_id: &str) {
        self.services.rcu(|table| {
            let mut table = ServiceTable::clone(table);
            table.instances.remove(unique_id);
            table.definitions.remove(unique_id);
            table
        });
    }

    /// Service definition by unique id.
    pub fn service_definition(&self, unique_id: &str) -> Option<ServiceDefinition> {
        self.services.load().definitions.get(unique_id).cloned()
    }

    /// Enabled instances of a service, restricted to gray instances when
    /// `gray` is set. Ordered by instance id.
    pub fn service_instances(&self, unique_id: &str, gray: bool) -> Vec<ServiceInstance> {
        let table = self.services.load();
        let Some(instances) = table.instances.get(unique_id) else {
            return Vec::new();
        };
        instances
            .iter()
            .filter(|i| i.enable && (!gray || i.gray))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn rules() -> Vec<Rule> {
        vec![
            Rule::new("exact", "svc-a").with_path("/api/user/info"),
            Rule::new("short", "svc-a").with_prefix("/api"),
            Rule::new("long", "svc-a").with_prefix("/api/user").with_order(5),
            Rule::new("other", "svc-b").with_prefix("/api"),
        ]
    }

    #[test]
    fn test_exact_path_preferred_over_prefix() {
        let store = DynamicConfigStore::new();
        store.put_all_rules(rules());
        let rule = store.resolve_rule("svc-a", "/api/user/info").unwrap();
        assert_eq!(rule.id, "exact");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let store = DynamicConfigStore::new();
        store.put_all_rules(rules());
        assert_eq!(store.resolve_rule("svc-a", "/api/user/list").unwrap().id, "long");
        assert_eq!(store.resolve_rule("svc-a", "/api/order").unwrap().id, "short");
        assert_eq!(store.resolve_rule("svc-b", "/api/user/list").unwrap().id, "other");
    }

    #[test]
    fn test_overlapping_prefixes_resolve_to_one_rule() {
        let store = DynamicConfigStore::new();
        store.put_all_rules(vec![
            Rule::new("b", "svc").with_prefix("/x").with_order(2),
            Rule::new("a", "svc").with_prefix("/x").with_order(1),
        ]);
        for _ in 0..10 {
            assert_eq!(store.resolve_rule("svc", "/x/y").unwrap().id, "a");
        }
    }

    #[test]
    fn test_path_not_matched() {
        let store = DynamicConfigStore::new();
        store.put_all_rules(rules());
        let err = store.resolve_rule("svc-a", "/other").unwrap_err();
        assert!(matches!(err, GatewayError::PathNoMatched { .. }));
        assert!(store.resolve_rule("svc-z", "/api").is_err());
    }

    #[test]
    fn test_put_all_rules_replaces_snapshot() {
        let store = DynamicConfigStore::new();
        store.put_all_rules(rules());
        let before = store.rules();
        store.put_all_rules(vec![Rule::new("only", "svc-a").with_prefix("/")]);
        assert_eq!(before.len(), 4);
        assert_eq!(store.rules().len(), 1);
        assert_eq!(store.resolve_rule("svc-a", "/api/user/info").unwrap().id, "only");
    }

    #[test]
    fn test_gray_instances_filtered() {
        let store = DynamicConfigStore::new();
        store.put_service_instances(
            ServiceDefinition::new("svc-a"),
            vec![
                ServiceInstance::new("svc-a", "10.0.0.2", 80),
                ServiceInstance::new("svc-a", "10.0.0.1", 80).with_gray(true),
            ],
        );
        assert_eq!(store.service_instances("svc-a", false).len(), 2);
        let gray = store.service_instances("svc-a", true);
        assert_eq!(gray.len(), 1);
        assert_eq!(gray[0].ip, "10.0.0.1");
        assert!(store.service_instances("svc-b", false).is_empty());
    }

    #[test]
    fn test_remove_service() {
        let store = DynamicConfigStore::new();
        store.put_service_instances(
            ServiceDefinition::new("svc-a"),
            vec![ServiceInstance::new("svc-a", "10.0.0.1", 80)],
        );
        store.remove_service("svc-a");
        assert!(store.service_instances("svc-a", false).is_empty());
        assert!(store.service_definition("svc-a").is_none());
    }

    #[test]
    fn test_readers_see_whole_snapshots() {
        let store = Arc::new(DynamicConfigStore::new());
        store.put_all_rules(vec![
            Rule::new("a1", "svc").with_path("/a"),
            Rule::new("a2", "svc").with_path("/b"),
        ]);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..200 {
                    let tag = if i % 2 == 0 { "x" } else { "y" };
                    store.put_all_rules(vec![
                        Rule::new(format!("{}1", tag), "svc").with_path("/a"),
                        Rule::new(format!("{}2", tag), "svc").with_path("/b"),
                    ]);
                }
            })
        };

        for _ in 0..200 {
            let snapshot = store.rules();
            let a = snapshot.resolve("svc", "/a").unwrap();
            let b = snapshot.resolve("svc", "/b").unwrap();
            assert_eq!(a.id[..1], b.id[..1]);
        }
        writer.join().unwrap();
    }
}
