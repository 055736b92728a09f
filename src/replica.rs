use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a request picks one of a service's replicas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    #[default]
    RoundRobin,
    Random,
}

/// The replicas (connections) serving one named service
#[derive(Debug)]
pub struct ReplicaSet<T> {
    policy: ReplicaPolicy,
    replicas: Vec<T>,
    cursor: AtomicUsize,
}

impl<T> ReplicaSet<T> {
    pub fn new(policy: ReplicaPolicy, replicas: Vec<T>) -> Self {
        ReplicaSet {
            policy,
            replicas,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn select(&self) -> Option<&T> {
        self.select_where(|_| true)
    }

    /// Pick per the policy, moving on to the next replica that satisfies
    /// `usable`. With none usable, the policy's own pick is returned.
    pub fn select_where(&self, usable: impl Fn(&T) -> bool) -> Option<&T> {
        let len = self.replicas.len();
        if len == 0 {
            return None;
        }
        let start = match self.policy {
            ReplicaPolicy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % len,
            ReplicaPolicy::Random => rand::rng().random_range(0..len),
        };
        (0..len)
            .map(|offset| &self.replicas[(start + offset) % len])
            .find(|replica| usable(*replica))
            .or_else(|| self.replicas.get(start))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.replicas.iter()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles_through_replicas() {
        let set = ReplicaSet::new(ReplicaPolicy::RoundRobin, vec!["a", "b", "c"]);
        let picks: Vec<&str> = (0..6).map(|_| *set.select().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let set = ReplicaSet::new(ReplicaPolicy::Random, vec![1, 2]);
        for _ in 0..100 {
            assert!(matches!(set.select(), Some(1) | Some(2)));
        }
    }

    #[test]
    fn test_select_where_skips_unusable_replicas() {
        let set = ReplicaSet::new(ReplicaPolicy::RoundRobin, vec!["a", "dead", "c"]);
        let picks: Vec<&str> = (0..6)
            .map(|_| *set.select_where(|r| *r != "dead").unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "c", "c", "a", "c", "c"]);

        let random = ReplicaSet::new(ReplicaPolicy::Random, vec![1, 2, 3]);
        for _ in 0..50 {
            assert_eq!(random.select_where(|r| *r == 2), Some(&2));
        }
    }

    #[test]
    fn test_select_where_falls_back_when_nothing_is_usable() {
        let set = ReplicaSet::new(ReplicaPolicy::RoundRobin, vec!["a", "b"]);
        assert_eq!(set.select_where(|_| false), Some(&"a"));
        assert_eq!(set.select_where(|_| false), Some(&"b"));
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        let set: ReplicaSet<u8> = ReplicaSet::new(ReplicaPolicy::RoundRobin, vec![]);
        assert!(set.select().is_none());
    }
}
