//! Where each PE ran: host name and CPU snapshots, and the check that no two PEs on one host
//! shared a CPU.
//!
//! The CPU id is sampled once per PE, a PE migrating between the sample and the check can
//! produce a false positive. Violations are reported, never fatal.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use std::sync::OnceLock;

/// Host and CPU of one PE at the moment it was captured
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosticsRecord {
    pub pe: usize,
    pub hostname: Vec<u8>,
    /// `-1` when the platform cannot report one
    pub cpu: i32,
}

impl DiagnosticsRecord {
    pub fn new(pe: usize, hostname: impl Into<Vec<u8>>, cpu: i32) -> DiagnosticsRecord {
        DiagnosticsRecord {
            pe,
            hostname: hostname.into(),
            cpu,
        }
    }

    /// Sample the host name and current CPU of the calling thread
    pub fn capture(pe: usize) -> DiagnosticsRecord {
        DiagnosticsRecord::new(pe, current_hostname(), current_cpu())
    }

    pub fn host_len(&self) -> usize {
        self.hostname.len()
    }

    pub fn same_host(&self, other: &DiagnosticsRecord) -> bool {
        self.host_len() == other.host_len() && self.hostname == other.hostname
    }
}

#[cfg(target_os = "linux")]
pub fn current_cpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> i32 {
    -1
}

pub fn current_hostname() -> Vec<u8> {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned().into_bytes(),
        Err(e) => {
            tracing::warn!("unable to read the host name: {}", e);
            b"unknown".to_vec()
        }
    }
}

/// The cores this process may run on, sampled on first use before any thread is pinned
pub(crate) fn core_ids() -> &'static [core_affinity::CoreId] {
    static CORE_IDS: OnceLock<Vec<core_affinity::CoreId>> = OnceLock::new();
    CORE_IDS.get_or_init(|| match core_affinity::get_core_ids() {
        Some(core_ids) if !core_ids.is_empty() => core_ids,
        _ => vec![core_affinity::CoreId { id: 0 }],
    })
}

/// Pin the calling thread to core `index % cores`
pub fn bind_to_core(index: usize) {
    let core_ids = core_ids();
    let id = core_ids[index % core_ids.len()];
    core_affinity::set_for_current(id);
    tracing::debug!("thread {} bound to core {:?}", index, id);
}

/// Two PEs on the same host observed on the same CPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementViolation {
    pub hostname: Vec<u8>,
    pub first: usize,
    pub second: usize,
    pub cpu: i32,
}

impl std::fmt::Display for PlacementViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ERROR: {} sched_cpu_array[{}] = {}  ==  sched_cpu_array[{}] = {}",
            String::from_utf8_lossy(&self.hostname),
            self.first,
            self.cpu,
            self.second,
            self.cpu
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlacementOutcome {
    pub violations: Vec<PlacementViolation>,
}

impl PlacementOutcome {
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check every unordered pair of records, collecting all violations in pair order.
pub fn verify_placement(diagnostics: &[DiagnosticsRecord]) -> PlacementOutcome {
    let violations = diagnostics
        .iter()
        .enumerate()
        .tuple_combinations()
        .filter(|((_, a), (_, b))| a.same_host(b) && a.cpu == b.cpu)
        .map(|((i, a), (j, _))| PlacementViolation {
            hostname: a.hostname.clone(),
            first: i,
            second: j,
            cpu: a.cpu,
        })
        .collect();
    PlacementOutcome { violations }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_host_same_cpu_is_a_violation() {
        let records = vec![
            DiagnosticsRecord::new(0, "nodeA", 3),
            DiagnosticsRecord::new(1, "nodeA", 3),
        ];
        let outcome = verify_placement(&records);
        assert!(!outcome.ok());
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(
            outcome.violations[0].to_string(),
            "ERROR: nodeA sched_cpu_array[0] = 3  ==  sched_cpu_array[1] = 3"
        );
    }

    #[test]
    fn different_hosts_never_collide() {
        let records = vec![
            DiagnosticsRecord::new(0, "nodeA", 3),
            DiagnosticsRecord::new(1, "nodeB", 3),
        ];
        assert!(verify_placement(&records).ok());
    }

    #[test]
    fn host_names_of_different_length() {
        let records = vec![
            DiagnosticsRecord::new(0, "node", 1),
            DiagnosticsRecord::new(1, "node1", 1),
        ];
        assert!(verify_placement(&records).ok());
    }

    #[test]
    fn all_pairs_are_collected() {
        let records = vec![
            DiagnosticsRecord::new(0, "n", 0),
            DiagnosticsRecord::new(1, "n", 1),
            DiagnosticsRecord::new(2, "n", 0),
            DiagnosticsRecord::new(3, "n", 0),
            DiagnosticsRecord::new(4, "m", 0),
        ];
        let pairs = verify_placement(&records)
            .violations
            .iter()
            .map(|v| (v.first, v.second))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![(0, 2), (0, 3), (2, 3)]);
    }

    #[test]
    fn single_record_is_ok() {
        assert!(verify_placement(&[DiagnosticsRecord::capture(0)]).ok());
        assert!(verify_placement(&[]).ok());
    }
}
