//! Memory accounting for the RAM and video budgets
//!
//! A [`MemoryAccountant`] is pure bookkeeping: it records every charge and
//! release against a fixed budget and reports when a charge pushes usage past
//! that budget. It never refuses a charge and never evicts anything itself;
//! the owner decides how to react to an overflow.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;

/// Size units accepted when configuring a budget
///
/// Accountants always store raw bytes; units only scale the configured size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Units {
    /// Plain bytes
    Byte,
    /// Kibibytes (1024 bytes)
    Kb,
    /// Mebibytes
    #[default]
    Mb,
    /// Gibibytes
    Gb,
    /// Tebibytes
    Tb,
}

impl Units {
    /// Number of bytes in one unit
    pub const fn multiplier(self) -> u64 {
        match self {
            Units::Byte => 1,
            Units::Kb => 1 << 10,
            Units::Mb => 1 << 20,
            Units::Gb => 1 << 30,
            Units::Tb => 1 << 40,
        }
    }

    /// Convert a size expressed in this unit to raw bytes
    pub fn to_bytes(self, size: u64) -> u64 {
        size.saturating_mul(self.multiplier())
    }
}

impl FromStr for Units {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BYTE" | "BYTES" | "B" => Ok(Units::Byte),
            "KB" => Ok(Units::Kb),
            "MB" => Ok(Units::Mb),
            "GB" => Ok(Units::Gb),
            "TB" => Ok(Units::Tb),
            _ => Err(ConfigError::InvalidValue {
                key: "units".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Units::Byte => "BYTE",
            Units::Kb => "KB",
            Units::Mb => "MB",
            Units::Gb => "GB",
            Units::Tb => "TB",
        };
        f.write_str(name)
    }
}

/// Memory pressure level indicating budget health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-100% utilization)
    High,
    /// Usage has reached or exceeded the budget
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 1.0 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }
}

/// Outcome of a single [`MemoryAccountant::add_bytes`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    /// Usage after the charge was committed
    pub used: i64,
    /// Budget minus usage after the charge; negative on overflow
    pub remaining: i64,
    /// Magnitude of the deficit when the charge overflowed the budget
    pub overflow: Option<u64>,
}

impl Charge {
    /// Whether this charge pushed usage past the budget
    pub fn overflowed(&self) -> bool {
        self.overflow.is_some()
    }
}

/// Budget-versus-usage bookkeeping for one memory class
///
/// Charges are committed unconditionally ("charge, then report"), so
/// `used_bytes()` is always exactly the sum of every `add_bytes` minus the sum
/// of every `remove_bytes` since the last `clear()`. Usage is signed and never
/// clamped.
///
/// # Example
///
/// ```
/// use imagekeep_cache::{MemoryAccountant, Units};
///
/// let mut ram = MemoryAccountant::new("ram", 1, Units::Mb);
///
/// let charge = ram.add_bytes(512 * 1024);
/// assert!(!charge.overflowed());
///
/// let charge = ram.add_bytes(768 * 1024);
/// assert_eq!(charge.overflow, Some(256 * 1024));
///
/// // The overflowing charge was still committed
/// assert_eq!(ram.used_bytes(), 1280 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryAccountant {
    name: &'static str,
    budget: u64,
    used: i64,
    count: u64,
    /// Sum of the post-operation usage of every operation, for averaging
    usage_sum: f64,
}

impl MemoryAccountant {
    /// Create an accountant with a budget of `size` × `units`
    pub fn new(name: &'static str, size: u64, units: Units) -> Self {
        Self::with_bytes(name, units.to_bytes(size))
    }

    /// Create an accountant with a budget in raw bytes
    pub fn with_bytes(name: &'static str, budget: u64) -> Self {
        Self {
            name,
            budget,
            used: 0,
            count: 0,
            usage_sum: 0.0,
        }
    }

    /// Name used in log output
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the budget in bytes
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Replace the budget; current usage is left untouched
    pub fn set_budget(&mut self, size: u64, units: Units) {
        self.budget = units.to_bytes(size);
    }

    /// Get the current usage in bytes
    pub fn used_bytes(&self) -> i64 {
        self.used
    }

    /// Number of add/remove operations since the last clear
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Budget minus usage; negative while over budget
    pub fn remaining(&self) -> i64 {
        budget_as_i64(self.budget).saturating_sub(self.used)
    }

    /// Check whether usage currently exceeds the budget
    pub fn is_over_budget(&self) -> bool {
        self.remaining() < 0
    }

    /// Get the current utilization ratio (may exceed 1.0)
    pub fn utilization(&self) -> f64 {
        if self.budget == 0 {
            if self.used > 0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            self.used as f64 / self.budget as f64
        }
    }

    /// Get the current memory pressure level
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// Mean usage observed after each operation since the last clear
    pub fn average_usage(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.usage_sum / self.count as f64
        }
    }

    /// Charge `bytes` against the budget
    ///
    /// The charge is always committed. If usage now exceeds the budget the
    /// returned [`Charge`] carries the exact deficit.
    pub fn add_bytes(&mut self, bytes: u64) -> Charge {
        self.used = self.used.saturating_add(bytes_as_i64(bytes));
        self.record_operation();

        let remaining = self.remaining();
        let overflow = (remaining < 0).then(|| remaining.unsigned_abs());
        if let Some(deficit) = overflow {
            debug!(
                accountant = self.name,
                bytes,
                used = self.used,
                budget = self.budget,
                deficit,
                "charge overflowed budget"
            );
        }

        Charge {
            used: self.used,
            remaining,
            overflow,
        }
    }

    /// Release `bytes` previously charged
    ///
    /// Does not re-check or clear any overflow condition. Returns the new usage.
    pub fn remove_bytes(&mut self, bytes: u64) -> i64 {
        self.used = self.used.saturating_sub(bytes_as_i64(bytes));
        self.record_operation();
        self.used
    }

    /// Reset usage and operation count to zero
    pub fn clear(&mut self) {
        debug!(accountant = self.name, used = self.used, "accountant cleared");
        self.used = 0;
        self.count = 0;
        self.usage_sum = 0.0;
    }

    fn record_operation(&mut self) {
        self.count += 1;
        self.usage_sum += self.used as f64;
    }
}

fn bytes_as_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn budget_as_i64(budget: u64) -> i64 {
    i64::try_from(budget).unwrap_or(i64::MAX)
}
