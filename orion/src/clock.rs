//! Mapping between the monotonic clock and persisted wall-clock timestamps.
//!
//! All ordering decisions use `tokio::time::Instant`. Snapshots on disk carry
//! `DateTime<Utc>` mirrors, converted through a single paired reading so a
//! restored instant keeps its age relative to "now".

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A monotonic and a wall-clock reading taken together.
#[derive(Debug, Clone, Copy)]
pub struct ClockPair {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

impl ClockPair {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    pub fn to_wall(&self, instant: Instant) -> DateTime<Utc> {
        if instant <= self.instant {
            let age = self.instant.duration_since(instant);
            self.wall - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero())
        } else {
            let ahead = instant.duration_since(self.instant);
            self.wall + chrono::Duration::from_std(ahead).unwrap_or(chrono::Duration::zero())
        }
    }

    /// Timestamps from the future (clock skew) clamp to `now`.
    pub fn to_instant(&self, wall: DateTime<Utc>) -> Instant {
        let age = (self.wall - wall).to_std().unwrap_or(Duration::ZERO);
        self.instant.checked_sub(age).unwrap_or(self.instant)
    }

    /// Like [`to_instant`](Self::to_instant), but future timestamps stay in
    /// the future. Used for deadlines such as an open circuit.
    pub fn to_deadline(&self, wall: DateTime<Utc>) -> Instant {
        match (wall - self.wall).to_std() {
            Ok(ahead) => self.instant + ahead,
            Err(_) => self.to_instant(wall),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_past_instants() {
        let clock = ClockPair::now();
        let earlier = clock
            .instant
            .checked_sub(Duration::from_secs(90))
            .unwrap_or(clock.instant);
        let age = clock.instant.duration_since(earlier);
        let restored = clock.to_instant(clock.to_wall(earlier));
        assert_eq!(clock.instant.duration_since(restored), age);
    }

    #[test]
    fn future_wall_time_clamps_to_now() {
        let clock = ClockPair::now();
        let future = clock.wall + chrono::Duration::seconds(30);
        assert_eq!(clock.to_instant(future), clock.instant);
    }

    #[test]
    fn deadlines_keep_their_distance() {
        let clock = ClockPair::now();
        let future = clock.wall + chrono::Duration::seconds(30);
        assert_eq!(
            clock.to_deadline(future).duration_since(clock.instant),
            Duration::from_secs(30)
        );
        let past = clock.wall - chrono::Duration::seconds(5);
        assert_eq!(clock.to_deadline(past), clock.to_instant(past));
    }
}
