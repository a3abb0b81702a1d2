//! Budget allocations and status tiers.
//!
//! One allocation exists per (run, agent) pair and one for the run as a
//! whole. The ledger mutates allocations; everything else sees read-only
//! snapshots through events and status queries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scope a token allocation is tracked against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// The run as a whole.
    Run,
    /// A single agent role within the run.
    Agent(String),
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Agent(name) => write!(f, "agent:{name}"),
        }
    }
}

/// Utilization tier derived from an allocation.
///
/// Tiers only move forward for a fixed allocation size, since `used` is
/// non-decreasing; the ordering here lets callers assert that.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    /// Under 80% utilization.
    Ok,
    /// 80% to under 95%.
    Warning,
    /// 95% up to the full allocation.
    Critical,
    /// Past the allocation; further requests are denied unconditionally.
    Exceeded,
}

/// Token accounting for one scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetAllocation {
    /// Configured allocation size.
    pub total: u64,
    /// Confirmed consumption.
    pub used: u64,
    /// In-flight estimates not yet confirmed by `consume`.
    pub reserved: u64,
}

impl BudgetAllocation {
    /// New allocation with nothing used or reserved.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            used: 0,
            reserved: 0,
        }
    }

    /// Tokens still available for reservation.
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used).saturating_sub(self.reserved)
    }

    /// Confirmed utilization as a fraction of the allocation.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            if self.used == 0 { 0.0 } else { f64::INFINITY }
        } else {
            self.used as f64 / self.total as f64
        }
    }

    /// Current status tier from confirmed utilization.
    pub fn tier(&self) -> BudgetTier {
        let utilization = self.utilization();
        if utilization > 1.0 {
            BudgetTier::Exceeded
        } else if utilization >= 0.95 {
            BudgetTier::Critical
        } else if utilization >= 0.80 {
            BudgetTier::Warning
        } else {
            BudgetTier::Ok
        }
    }
}
