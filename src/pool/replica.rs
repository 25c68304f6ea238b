//! Replica sets and their round-robin cursor.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// One address of a deployment, with its passive health state.
#[derive(Debug)]
pub struct Replica {
    address: String,
    epoch: Instant,
    // Millis since `epoch` (plus one) when marked unhealthy, 0 while healthy
    unhealthy_since: AtomicU64,
}

impl Replica {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            epoch: Instant::now(),
            unhealthy_since: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_healthy(&self) -> bool {
        self.unhealthy_since.load(Ordering::Acquire) == 0
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    pub fn mark_unhealthy(&self) {
        self.unhealthy_since.store(self.now_ms(), Ordering::Release);
    }

    /// Returns true when the replica was unhealthy before.
    pub fn mark_healthy(&self) -> bool {
        self.unhealthy_since.swap(0, Ordering::AcqRel) != 0
    }

    /// Healthy replicas, and unhealthy ones whose cooldown has passed, may be picked.
    fn is_selectable(&self, cooldown: Duration) -> bool {
        let since = self.unhealthy_since.load(Ordering::Acquire);
        since == 0 || self.now_ms().saturating_sub(since) >= cooldown.as_millis() as u64
    }
}

/// Immutable replica list of one deployment plus its rotation state.
///
/// Re-registration builds a new set; surviving replicas keep their health.
#[derive(Debug)]
pub struct ReplicaSet {
    replicas: Vec<Arc<Replica>>,
    active: usize,
    cursor: AtomicUsize,
}

impl ReplicaSet {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut replicas: Vec<Arc<Replica>> = Vec::new();
        for address in addresses {
            let address = address.into();
            if replicas.iter().all(|r| r.address() != address) {
                replicas.push(Arc::new(Replica::new(address)));
            }
        }
        let active = replicas.len();
        Self {
            replicas,
            active,
            cursor: AtomicUsize::new(0),
        }
    }

    /// New set over `addresses`, reusing replicas (and their health) that already exist.
    ///
    /// A scaled-down window stays scaled down, capped at the new list length.
    pub fn with_addresses(&self, addresses: &[String]) -> Self {
        let mut replicas: Vec<Arc<Replica>> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if replicas.iter().any(|r| r.address() == address) {
                continue;
            }
            let replica = self
                .replicas
                .iter()
                .find(|r| r.address() == address)
                .cloned()
                .unwrap_or_else(|| Arc::new(Replica::new(address.as_str())));
            replicas.push(replica);
        }
        let active = if self.active < self.replicas.len() {
            self.active.min(replicas.len())
        } else {
            replicas.len()
        };
        Self {
            replicas,
            active,
            cursor: AtomicUsize::new(self.cursor.load(Ordering::Relaxed)),
        }
    }

    /// New set whose first `active` replicas take traffic.
    pub fn with_active(&self, active: usize) -> Self {
        Self {
            replicas: self.replicas.clone(),
            active: active.min(self.replicas.len()),
            cursor: AtomicUsize::new(self.cursor.load(Ordering::Relaxed)),
        }
    }

    pub fn active(&self) -> &[Arc<Replica>] {
        &self.replicas[..self.active]
    }

    pub fn registered(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    /// Picks the next selectable replica in rotation.
    ///
    /// When no replica is selectable the rotation ignores health.
    pub fn select(&self, cooldown: Duration) -> Option<Arc<Replica>> {
        let replicas = self.active();
        if replicas.is_empty() {
            return None;
        }

        let count = self.cursor.fetch_add(1, Ordering::Relaxed);
        let selectable: Vec<usize> = replicas
            .iter()
            .enumerate()
            .filter(|(_, replica)| replica.is_selectable(cooldown))
            .map(|(idx, _)| idx)
            .collect();

        let idx = if selectable.is_empty() {
            count % replicas.len()
        } else {
            selectable[count % selectable.len()]
        };
        Some(replicas[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    fn addresses(set: &ReplicaSet, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| set.select(COOLDOWN).unwrap().address().to_string())
            .collect()
    }

    #[test]
    fn test_round_robin_uses_every_replica() {
        let set = ReplicaSet::new(["a:1", "b:1", "c:1"]);
        let picked = addresses(&set, 9);
        for window in picked.windows(3) {
            let unique: HashSet<&String> = window.iter().collect();
            assert_eq!(unique.len(), 3, "{window:?}");
        }
    }

    #[test]
    fn test_skips_unhealthy_replica() {
        let set = ReplicaSet::new(["a:1", "b:1", "c:1"]);
        set.registered()[1].mark_unhealthy();
        let picked = addresses(&set, 6);
        assert!(picked.iter().all(|a| a != "b:1"));
        assert!(picked.contains(&"a:1".to_string()));
        assert!(picked.contains(&"c:1".to_string()));
    }

    #[test]
    fn test_unhealthy_replica_share_is_spread_evenly() {
        let set = ReplicaSet::new(["a:1", "b:1", "c:1"]);
        set.registered()[1].mark_unhealthy();
        let picked = addresses(&set, 6);
        assert_eq!(picked.iter().filter(|a| *a == "a:1").count(), 3);
        assert_eq!(picked.iter().filter(|a| *a == "c:1").count(), 3);
        for pair in picked.windows(2) {
            assert_ne!(pair[0], pair[1], "{picked:?}");
        }
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_rotation() {
        let set = ReplicaSet::new(["a:1", "b:1"]);
        for replica in set.registered() {
            replica.mark_unhealthy();
        }
        let picked = addresses(&set, 2);
        assert_ne!(picked[0], picked[1]);
    }

    #[test]
    fn test_cooldown_makes_replica_selectable_again() {
        let set = ReplicaSet::new(["a:1"]);
        let replica = set.registered()[0].clone();
        replica.mark_unhealthy();
        assert!(!replica.is_selectable(COOLDOWN));
        assert!(replica.is_selectable(Duration::ZERO));
        assert!(replica.mark_healthy());
        assert!(!replica.mark_healthy());
    }

    #[test]
    fn test_reregistration_keeps_health_and_dedupes() {
        let set = ReplicaSet::new(["a:1", "b:1", "a:1"]);
        assert_eq!(set.registered().len(), 2);
        set.registered()[0].mark_unhealthy();

        let next = set.with_addresses(&["a:1".to_string(), "c:1".to_string()]);
        assert_eq!(next.registered().len(), 2);
        assert!(!next.registered()[0].is_healthy());
        assert!(next.registered()[1].is_healthy());
        assert_eq!(next.registered()[1].address(), "c:1");
    }

    #[test]
    fn test_reregistration_keeps_scaled_window() {
        let set = ReplicaSet::new(["a:1", "b:1", "c:1"]).with_active(1);
        let next = set.with_addresses(&["d:1".to_string(), "e:1".to_string()]);
        assert_eq!(next.active().len(), 1);
        assert_eq!(next.registered().len(), 2);

        let full = ReplicaSet::new(["a:1"]);
        let grown = full.with_addresses(&["a:1".to_string(), "b:1".to_string()]);
        assert_eq!(grown.active().len(), 2);
    }

    #[test]
    fn test_active_window() {
        let set = ReplicaSet::new(["a:1", "b:1", "c:1"]).with_active(1);
        assert_eq!(set.active().len(), 1);
        assert_eq!(addresses(&set, 3), ["a:1", "a:1", "a:1"]);

        let empty = ReplicaSet::new(Vec::<String>::new());
        assert!(empty.select(COOLDOWN).is_none());
    }
}
