//! Voting-round arithmetic.
//!
//! Rounds are fixed-length epochs counted from the first round start:
//! `round = floor((block_timestamp - first_round_start) / round_duration)`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::AttestationError;

/// Protocol constants read once from the round-schedule contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSchedule {
    /// Unix timestamp (seconds) at which round 0 starts.
    pub first_round_start: u64,
    /// Round length in seconds.
    pub round_duration: u64,
}

impl RoundSchedule {
    pub fn new(first_round_start: u64, round_duration: u64) -> Self {
        Self {
            first_round_start,
            round_duration,
        }
    }

    /// Voting round containing `block_timestamp`.
    pub fn round_for(&self, block_timestamp: u64) -> Result<u64, AttestationError> {
        if self.round_duration == 0 {
            return Err(AttestationError::InvalidResponse(
                "round duration is zero".into(),
            ));
        }
        if block_timestamp < self.first_round_start {
            return Err(AttestationError::BeforeFirstRound {
                timestamp: block_timestamp,
                first_round_start: self.first_round_start,
            });
        }
        Ok((block_timestamp - self.first_round_start) / self.round_duration)
    }

    /// First second of `round`.
    pub fn round_start(&self, round: u64) -> u64 {
        self.first_round_start + round * self.round_duration
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.round_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFSET: u64 = 1_658_430_000;
    const DURATION: u64 = 90;

    #[test]
    fn round_boundaries() {
        let schedule = RoundSchedule::new(OFFSET, DURATION);
        for k in [0u64, 1, 2, 17, 12_345, 1_000_000] {
            let start = OFFSET + k * DURATION;
            assert_eq!(schedule.round_for(start).unwrap(), k);
            assert_eq!(schedule.round_start(k), start);
            if k > 0 {
                assert_eq!(schedule.round_for(start - 1).unwrap(), k - 1);
            }
        }
    }

    #[test]
    fn timestamp_before_first_round_is_rejected() {
        let schedule = RoundSchedule::new(OFFSET, DURATION);
        assert!(matches!(
            schedule.round_for(OFFSET - 1),
            Err(AttestationError::BeforeFirstRound { .. })
        ));
    }

    #[test]
    fn zero_duration_is_rejected() {
        let schedule = RoundSchedule::new(OFFSET, 0);
        assert!(schedule.round_for(OFFSET).is_err());
    }
}
