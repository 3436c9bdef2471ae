//! Bounds amount of signing attempts a single guardian can be involved into

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::identity::PartyIndex;
use crate::tracking_id::TrackingId;

/// Counts in-flight signing attempts per guardian
///
/// A guardian is counted once per tracking id, from the first message it sent for that signing
/// until the signing ends or expires.
#[derive(Debug, Default)]
pub struct SigCounter {
    first_seen: HashMap<TrackingId, Instant>,
    participants: HashMap<TrackingId, HashSet<PartyIndex>>,
    in_flight: HashMap<PartyIndex, usize>,
}

impl SigCounter {
    /// Constructs an empty counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `guardian` as participating in `tracking_id`
    ///
    /// Returns `false` if guardian is not yet counted for this signing and is already
    /// participating in `max` signings.
    pub fn add(&mut self, tracking_id: &TrackingId, guardian: PartyIndex, max: usize) -> bool {
        if self
            .participants
            .get(tracking_id)
            .map(|p| p.contains(&guardian))
            .unwrap_or(false)
        {
            return true;
        }

        let count = self.in_flight.entry(guardian).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;

        self.first_seen
            .entry(*tracking_id)
            .or_insert_with(Instant::now);
        self.participants
            .entry(*tracking_id)
            .or_default()
            .insert(guardian);
        true
    }

    /// Forgets signing `tracking_id`
    pub fn remove(&mut self, tracking_id: &TrackingId) {
        self.first_seen.remove(tracking_id);
        let Some(participants) = self.participants.remove(tracking_id) else {
            return;
        };
        for guardian in participants {
            if let Some(count) = self.in_flight.get_mut(&guardian) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.in_flight.remove(&guardian);
                }
            }
        }
    }

    /// Forgets signings first seen more than `max_age` ago
    pub fn clean_self(&mut self, max_age: Duration) {
        let now = Instant::now();
        let expired = self
            .first_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > max_age)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in expired {
            self.remove(&id);
        }
    }

    /// Amount of signings guardian participates in
    pub fn in_flight(&self, guardian: PartyIndex) -> usize {
        self.in_flight.get(&guardian).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking_id::{ChainId, ProtocolTag};

    fn tracking_id(i: u8) -> TrackingId {
        TrackingId::new(ProtocolTag::Ecdsa, [i; 32], ChainId(1), &[0, 1, 2]).unwrap()
    }

    #[test]
    fn caps_signings_per_guardian() {
        let mut counter = SigCounter::new();
        for i in 0..3 {
            assert!(counter.add(&tracking_id(i), 1, 3));
        }
        assert!(!counter.add(&tracking_id(3), 1, 3));
        // already counted signing is fine
        assert!(counter.add(&tracking_id(0), 1, 3));
        // other guardians aren't affected
        assert!(counter.add(&tracking_id(3), 2, 3));

        counter.remove(&tracking_id(0));
        assert_eq!(counter.in_flight(1), 2);
        assert!(counter.add(&tracking_id(3), 1, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_signings_are_released() {
        let mut counter = SigCounter::new();
        assert!(counter.add(&tracking_id(0), 1, 2));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(counter.add(&tracking_id(1), 1, 2));

        tokio::time::advance(Duration::from_secs(10)).await;
        counter.clean_self(Duration::from_secs(15));
        assert_eq!(counter.in_flight(1), 1);
        assert!(counter.add(&tracking_id(2), 1, 2));
        assert!(!counter.add(&tracking_id(3), 1, 2));
    }
}
