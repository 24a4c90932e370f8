// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering::SeqCst};

/// Failover progress. `Relaunch` is the deferred form taken when a failover
/// fires while the secondary is mid-load; the load path re-arms it once the
/// checkpoint is consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FailoverStatus {
    None = 0,
    Handling = 1,
    Completed = 2,
    Relaunch = 3,
}

impl FailoverStatus {
    fn from_u8(v: u8) -> FailoverStatus {
        match v {
            1 => FailoverStatus::Handling,
            2 => FailoverStatus::Completed,
            3 => FailoverStatus::Relaunch,
            _ => FailoverStatus::None,
        }
    }
}

/// CAS-style failover state cell.
#[derive(Debug, Default)]
pub struct FailoverState(AtomicU8);

impl FailoverState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> FailoverStatus {
        FailoverStatus::from_u8(self.0.load(SeqCst))
    }

    /// Attempt `old → new`; returns the state actually observed, which is
    /// `old` exactly when the transition happened.
    pub fn set_state(&self, old: FailoverStatus, new: FailoverStatus) -> FailoverStatus {
        match self.0.compare_exchange(old as u8, new as u8, SeqCst, SeqCst) {
            Ok(prev) => FailoverStatus::from_u8(prev),
            Err(prev) => FailoverStatus::from_u8(prev),
        }
    }

    /// A failover has been requested (and possibly finished).
    pub fn active(&self) -> bool {
        self.get() != FailoverStatus::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_state_reports_observed_state() {
        let st = FailoverState::new();
        assert_eq!(
            st.set_state(FailoverStatus::None, FailoverStatus::Handling),
            FailoverStatus::None
        );
        // Losing the race reports what was really there.
        assert_eq!(
            st.set_state(FailoverStatus::None, FailoverStatus::Handling),
            FailoverStatus::Handling
        );
        assert!(st.active());
    }

    #[test]
    fn relaunch_rearms_to_none() {
        let st = FailoverState::new();
        st.set_state(FailoverStatus::None, FailoverStatus::Handling);
        st.set_state(FailoverStatus::Handling, FailoverStatus::Relaunch);
        assert_eq!(
            st.set_state(FailoverStatus::Relaunch, FailoverStatus::None),
            FailoverStatus::Relaunch
        );
        assert!(!st.active());
    }
}
