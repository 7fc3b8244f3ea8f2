//! Admission control for new runs.

use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};

/// Which runs may execute concurrently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    /// Any number of independent sessions.
    #[default]
    MultiSession,
    /// At most one in-flight run per process.
    SingleFlight,
}

impl AdmissionPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MultiSession => "multi-session",
            Self::SingleFlight => "single-flight",
        }
    }
}

impl std::fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multi-session" | "multi" => Ok(Self::MultiSession),
            "single-flight" | "single" => Ok(Self::SingleFlight),
            other => Err(format!(
                "unknown admission policy `{other}` (expected multi-session or single-flight)"
            )),
        }
    }
}

/// Decides whether a new run may start now.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
    in_flight: Arc<AtomicBool>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Whether a single-flight run is currently outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Admit a run, or `None` if the single-flight slot is taken.
    ///
    /// The returned permit must live as long as the run; dropping it frees
    /// the slot.
    #[must_use]
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        match self.policy {
            AdmissionPolicy::MultiSession => Some(AdmissionPermit { slot: None }),
            AdmissionPolicy::SingleFlight => self
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| AdmissionPermit {
                    slot: Some(Arc::clone(&self.in_flight)),
                }),
        }
    }
}

/// Proof of admission. Releases the single-flight slot on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    slot: Option<Arc<AtomicBool>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.store(false, Ordering::Release);
        }
    }
}
