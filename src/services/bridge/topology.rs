//! Discovered error-queue topology.

use std::collections::BTreeSet;

/// The error queues found by the last applied discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Every queue the filter accepted.
    pub discovered: BTreeSet<String>,
    /// Discovered queues that did not exist when receivers were created.
    pub not_found: BTreeSet<String>,
}

impl TopologySnapshot {
    pub fn new(discovered: BTreeSet<String>, not_found: BTreeSet<String>) -> Self {
        Self {
            discovered,
            not_found,
        }
    }

    /// Queues with an open receiver.
    pub fn listening(&self) -> impl Iterator<Item = &String> {
        self.discovered.difference(&self.not_found)
    }

    /// Whether receivers must be recreated for a new discovery result.
    ///
    /// `recovered` holds previously missing queues that exist now.
    pub fn requires_restart(
        &self,
        discovered: &BTreeSet<String>,
        recovered: &BTreeSet<String>,
    ) -> bool {
        self.discovered != *discovered || !recovered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_same_set_needs_no_restart() {
        let snapshot = TopologySnapshot::new(set(&["a_error", "b_error"]), BTreeSet::new());
        assert!(!snapshot.requires_restart(&set(&["b_error", "a_error"]), &BTreeSet::new()));
    }

    #[test]
    fn test_changed_set_requires_restart() {
        let snapshot = TopologySnapshot::new(set(&["a_error", "b_error"]), BTreeSet::new());
        assert!(snapshot.requires_restart(&set(&["a_error", "c_error"]), &BTreeSet::new()));
        assert!(snapshot.requires_restart(&set(&["a_error"]), &BTreeSet::new()));
    }

    #[test]
    fn test_recovered_queue_requires_restart() {
        let snapshot = TopologySnapshot::new(set(&["a_error", "b_error"]), set(&["b_error"]));
        assert!(snapshot.requires_restart(&set(&["a_error", "b_error"]), &set(&["b_error"])));
    }

    #[test]
    fn test_listening_excludes_not_found() {
        let snapshot = TopologySnapshot::new(set(&["a_error", "b_error"]), set(&["b_error"]));
        let listening: Vec<&String> = snapshot.listening().collect();
        assert_eq!(listening, vec!["a_error"]);
    }
}
