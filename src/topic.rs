//! # Per-Topic Radius Convergence
//!
//! Each tracked topic keeps a search radius around the 64-bit prefix of its
//! hash. Registration tickets observed from peers inside the radius feed a
//! two-phase controller:
//!
//! ```text
//! error    = clamp((wait / target_wait - 1) * 2, -1, 1)
//! radius' = radius * (1 + error * rate)      rate = 0.1 searching, 0.01 converged
//! ```
//!
//! Waits longer than the target mean the registrars near the topic are busy,
//! so the radius widens; shorter waits shrink it. A smoothed shadow of the
//! radius detects when growth has caught up with its own trailing average,
//! at which point the topic is converged and the controller slows down.
//!
//! Topics that are being registered also own a time schedule: ticket slots
//! grouped by the bucket in which they become usable.

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::Identity;
use crate::radius::MAX_RADIUS;
use crate::random::TicketRandom;
use crate::ticket::TicketRef;

/// Desired steady-state wait between obtaining a ticket and using it.
pub(crate) const TARGET_WAIT_TIME: Duration = Duration::from_secs(10 * 60);

const SEARCH_RATE: f64 = 0.1;
const CONVERGED_RATE: f64 = 0.01;

/// Smoothing factor of the convergence detector.
const FILTER_ALPHA: f64 = 0.05;

/// Opaque topic name. Any byte string is a valid topic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<u8>);

impl Topic {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self(name.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// BLAKE3 digest of the topic name.
    pub fn hash(&self) -> [u8; 32] {
        *blake3::hash(self.as_bytes()).as_bytes()
    }

    /// Leading 64 bits of [`Topic::hash`], big-endian.
    pub fn hash_prefix(&self) -> u64 {
        let digest = self.hash();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&[u8]> for Topic {
    fn from(name: &[u8]) -> Self {
        Self::new(name)
    }
}

impl From<Vec<u8>> for Topic {
    fn from(name: Vec<u8>) -> Self {
        Self(name)
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Lossy UTF-8 rendering for log fields.
impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Point-in-time view of a topic's controller state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RadiusSnapshot {
    pub radius: u64,
    pub filtered_radius: f64,
    pub converged: bool,
}

#[derive(Debug)]
pub struct TopicTickets {
    topic: Topic,
    topic_hash_prefix: u64,
    radius: u64,
    /// Only used for convergence detection.
    filtered_radius: f64,
    converged: bool,
    target_wait: Duration,
    /// Ticket slots keyed by the bucket in which they become usable.
    /// `None` when the topic is only observed, not registered.
    schedule: Option<BTreeMap<u64, Vec<TicketRef>>>,
}

impl TopicTickets {
    pub fn new(topic: Topic, register: bool) -> Self {
        Self::with_target_wait(topic, register, TARGET_WAIT_TIME)
    }

    pub(crate) fn with_target_wait(topic: Topic, register: bool, target_wait: Duration) -> Self {
        let topic_hash_prefix = topic.hash_prefix();
        Self {
            topic,
            topic_hash_prefix,
            radius: MAX_RADIUS,
            filtered_radius: MAX_RADIUS as f64,
            converged: false,
            target_wait,
            schedule: register.then(BTreeMap::new),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn topic_hash_prefix(&self) -> u64 {
        self.topic_hash_prefix
    }

    pub fn radius(&self) -> u64 {
        self.radius
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn is_registering(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn snapshot(&self) -> RadiusSnapshot {
        RadiusSnapshot {
            radius: self.radius,
            filtered_radius: self.filtered_radius,
            converged: self.converged,
        }
    }

    pub fn is_in_radius(&self, node: &Identity) -> bool {
        node.prefix() ^ self.topic_hash_prefix < self.radius
    }

    /// Random lookup target inside the current radius.
    pub fn next_target<R: TicketRandom + ?Sized>(&self, rng: &mut R) -> Identity {
        let half = self.radius / 2;
        let offset = if half == 0 { 0 } else { rng.below(half) * 2 };
        Identity::from_prefix(self.topic_hash_prefix ^ offset)
    }

    /// One controller step for a ticket slot usable at `reg_time`.
    pub fn adjust(&mut self, local_time: u64, reg_time: u64, min_radius: u64) {
        let wait = reg_time.saturating_sub(local_time);
        let target = self.target_wait.as_nanos() as f64;
        let mut error = ((wait as f64 / target - 1.0) * 2.0).clamp(-1.0, 1.0);
        error *= if self.converged { CONVERGED_RATE } else { SEARCH_RATE };

        let mut proposed = self.radius as f64 * (1.0 + error);
        if proposed > MAX_RADIUS as f64 {
            self.radius = MAX_RADIUS;
            proposed = MAX_RADIUS as f64;
        } else {
            self.radius = (proposed as u64).max(min_radius);
        }

        if !self.converged {
            if proposed >= self.filtered_radius {
                self.converged = true;
                debug!(
                    topic = %self.topic,
                    radius = self.radius,
                    "topic radius converged"
                );
            } else {
                self.filtered_radius += (proposed - self.filtered_radius) * FILTER_ALPHA;
            }
        }
    }

    pub(crate) fn schedule(&mut self, bucket: u64, slot: TicketRef) -> bool {
        match self.schedule.as_mut() {
            Some(buckets) => {
                buckets.entry(bucket).or_default().push(slot);
                true
            }
            None => false,
        }
    }

    /// Remove every slot in buckets `from..=current` whose deadline has
    /// passed, then drop all buckets older than `current`.
    pub(crate) fn drain_due(&mut self, from: u64, current: u64, local_time: u64) -> Vec<TicketRef> {
        let Some(buckets) = self.schedule.as_mut() else {
            return Vec::new();
        };

        let mut due = Vec::new();
        if from <= current {
            for (_, slots) in buckets.range_mut(from..=current) {
                slots.retain(|slot| {
                    if slot.reg_time <= local_time {
                        due.push(*slot);
                        false
                    } else {
                        true
                    }
                });
            }
        }

        let kept = buckets.split_off(&current);
        let expired = std::mem::replace(buckets, kept);
        debug_assert!(
            expired.values().all(|slots| slots.is_empty()),
            "expired bucket still held pending slots"
        );

        due
    }

    pub(crate) fn scheduled_in(&self, buckets: Range<u64>) -> usize {
        match &self.schedule {
            Some(map) if buckets.start < buckets.end => {
                map.range(buckets).map(|(_, slots)| slots.len()).sum()
            }
            _ => 0,
        }
    }

    pub(crate) fn scheduled_len(&self) -> usize {
        self.schedule
            .as_ref()
            .map(|map| map.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.schedule.as_ref().map(BTreeMap::len).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn oldest_bucket(&self) -> Option<u64> {
        self.schedule
            .as_ref()
            .and_then(|map| map.keys().next().copied())
    }

    #[cfg(test)]
    pub(crate) fn scheduled(&self) -> impl Iterator<Item = &TicketRef> {
        self.schedule.iter().flat_map(|map| map.values().flatten())
    }

    pub(crate) fn earliest_scheduled(&self) -> Option<TicketRef> {
        self.schedule
            .as_ref()?
            .values()
            .flatten()
            .min_by_key(|slot| slot.reg_time)
            .copied()
    }
}
