//! Record-to-worker assignment
//!
//! Every policy here is a pure function of the record stream, so two runs
//! over the same trace with the same worker count put the same records on
//! the same workers in the same order.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::record::ReplayRecord;

/// How records are spread over workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    /// Record `n` goes to worker `n % workers`
    #[default]
    RoundRobin,
    /// Same target path, same worker. Keeps per-file ordering intact.
    TargetHash,
    /// Affinity field modulo workers; records without one fall back to the
    /// target hash
    Affinity,
}

impl AssignmentPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentPolicy::RoundRobin => "round_robin",
            AssignmentPolicy::TargetHash => "target_hash",
            AssignmentPolicy::Affinity => "affinity",
        }
    }
}

impl fmt::Display for AssignmentPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(AssignmentPolicy::RoundRobin),
            "target_hash" | "hash" => Ok(AssignmentPolicy::TargetHash),
            "affinity" => Ok(AssignmentPolicy::Affinity),
            other => Err(format!(
                "unknown assignment policy '{}' (expected round_robin, target_hash or affinity)",
                other
            )),
        }
    }
}

/// What the producer does when the chosen worker's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space (bounded by the enqueue timeout, if one is set)
    #[default]
    Block,
    /// Fail the task immediately with a resource error
    Reject,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::Reject => "reject",
        }
    }

    /// Human-readable description for the run banner
    pub fn describe(&self, timeout: Option<Duration>) -> String {
        match (self, timeout) {
            (OverflowPolicy::Block, None) => "block until space is available".to_string(),
            (OverflowPolicy::Block, Some(t)) => {
                format!("block up to {:?}, then fail the task", t)
            }
            (OverflowPolicy::Reject, _) => "reject immediately when full".to_string(),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(format!(
                "unknown overflow policy '{}' (expected block or reject)",
                other
            )),
        }
    }
}

/// Stateful assigner; owned by the single producer.
#[derive(Debug, Clone)]
pub struct Assigner {
    policy: AssignmentPolicy,
    workers: usize,
    next: usize,
}

impl Assigner {
    pub fn new(policy: AssignmentPolicy, workers: usize) -> Self {
        Self {
            policy,
            workers: workers.max(1),
            next: 0,
        }
    }

    /// Worker index for the next record
    pub fn assign(&mut self, record: &ReplayRecord) -> usize {
        match self.policy {
            AssignmentPolicy::RoundRobin => {
                let w = self.next;
                self.next = (self.next + 1) % self.workers;
                w
            }
            AssignmentPolicy::TargetHash => self.by_hash(&record.target),
            AssignmentPolicy::Affinity => match record.affinity {
                Some(key) => (key % self.workers as u64) as usize,
                None => self.by_hash(&record.target),
            },
        }
    }

    fn by_hash(&self, target: &str) -> usize {
        (fnv1a_64(target.as_bytes()) % self.workers as u64) as usize
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a, 64-bit. Stable across runs, builds and platforms, unlike
/// `std`'s randomly seeded hasher.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(FNV_PRIME)
    })
}
