//! Instance selection strategies.

use crate::rule::ServiceInstance;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one instance out of a non-empty, stably ordered list.
pub trait LoadBalance: Send + Sync + fmt::Debug {
    /// Returns `None` only for an empty list.
    fn choose<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;
}

/// Uniformly random choice.
#[derive(Debug, Default)]
pub struct RandomLoadBalance;

impl LoadBalance for RandomLoadBalance {
    fn choose<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..instances.len());
        instances.get(idx)
    }
}

/// Cycles through instances in order.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalance {
    position: AtomicUsize,
}

impl RoundRobinLoadBalance {
    /// Starts at the first instance.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobinLoadBalance {
    fn choose<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let idx = self.position.fetch_add(1, Ordering::Relaxed) % instances.len();
        instances.get(idx)
    }
}

/// Strategy named by the `load_balance` setting of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalanceStrategy {
    #[default]
    Random,
    RoundRobin,
}

impl FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "random" => Ok(LoadBalanceStrategy::Random),
            "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
            _ => Err(format!("unknown load balance strategy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances() -> Vec<ServiceInstance> {
        vec![
            ServiceInstance::new("svc", "10.0.0.1", 80),
            ServiceInstance::new("svc", "10.0.0.2", 80),
            ServiceInstance::new("svc", "10.0.0.3", 80),
        ]
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = RoundRobinLoadBalance::new();
        let instances = instances();
        let picked: Vec<&str> = (0..6)
            .map(|_| lb.choose(&instances).unwrap().ip.as_str())
            .collect();
        assert_eq!(
            picked,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let lb = RandomLoadBalance;
        let instances = instances();
        for _ in 0..100 {
            assert!(lb.choose(&instances).is_some());
        }
    }

    #[test]
    fn test_empty_list() {
        assert!(RandomLoadBalance.choose(&[]).is_none());
        assert!(RoundRobinLoadBalance::new().choose(&[]).is_none());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("roundRobin".parse::<LoadBalanceStrategy>().unwrap(), LoadBalanceStrategy::RoundRobin);
        assert_eq!("random".parse::<LoadBalanceStrategy>().unwrap(), LoadBalanceStrategy::Random);
        assert!("weighted".parse::<LoadBalanceStrategy>().is_err());
    }
}
