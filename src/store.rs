//! # Ticket Store
//!
//! The store is the registrant-side coordinator of topic registration:
//!
//! - it owns one [`TopicTickets`] controller per tracked topic,
//! - it decides which incoming tickets are worth holding on to,
//! - it schedules the retained topic slots into per-topic time buckets,
//! - it hands out slots whose deadline has passed on every [`TicketStore::fetch`].
//!
//! ## Admission
//!
//! At most one ticket is retained per registrar. Every topic slot of a new
//! ticket whose registrar lies inside the topic's radius tunes that topic's
//! controller. Once a topic has converged, the slot is retained with a
//! randomized cutoff on its wait:
//!
//! ```text
//! keep if wait < keep_const + keep_exp * min(Exp(1), 10)
//! ```
//!
//! The random cutoff favours early slots without all registrants piling onto
//! exactly the earliest legal time.
//!
//! ## Ownership
//!
//! Held tickets live in an arena keyed by [`TicketId`]; schedule entries
//! refer to them by id. Each arena entry counts the slots still scheduled for
//! it and is dropped, together with its registrar index entry, when the count
//! reaches zero.
//!
//! All operations take `&mut self` and never block. Callers that share a
//! store across tasks go through [`crate::service::TicketService`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, trace, warn};

use crate::identity::Identity;
use crate::radius::{MinRadiusEstimator, MIN_RADIUS_WINDOW};
use crate::random::{StdRandom, TicketRandom};
use crate::ticket::{HeldTicket, Ticket, TicketId, TicketRef};
use crate::topic::{RadiusSnapshot, Topic, TopicTickets, TARGET_WAIT_TIME};

// ============================================================================
// Scheduling Configuration Constants
// ============================================================================

/// Width of one time bucket.
pub(crate) const TICKET_GROUP_TIME: Duration = Duration::from_secs(60);

/// Number of buckets counted by [`TicketStore::tickets_in_window`].
pub(crate) const TIME_WINDOW: u64 = 30;

/// Fixed part of the retention cutoff.
pub(crate) const KEEP_TICKET_CONST: Duration = Duration::from_secs(20 * 60);

/// Randomized part of the retention cutoff, scaled by an Exp(1) draw.
pub(crate) const KEEP_TICKET_EXP: Duration = Duration::from_secs(20 * 60);

/// Upper bound on the exponential draw used for retention.
const MAX_EXP_DRAW: f64 = 10.0;

/// Depth of the service command channel.
pub(crate) const DEFAULT_COMMAND_BUFFER: usize = 100;

/// Depth of the service's due-ticket channel. The periodic fetch never drains
/// more slots than this channel has room for.
pub(crate) const DEFAULT_DUE_BUFFER: usize = 256;

#[derive(Clone, Debug)]
pub struct TicketStoreConfig {
    pub group_time: Duration,
    pub time_window: u64,
    pub keep_ticket_const: Duration,
    pub keep_ticket_exp: Duration,
    pub target_wait_time: Duration,
    pub min_radius_window: u64,
    pub command_buffer: usize,
    pub due_buffer: usize,
}

impl Default for TicketStoreConfig {
    fn default() -> Self {
        Self {
            group_time: TICKET_GROUP_TIME,
            time_window: TIME_WINDOW,
            keep_ticket_const: KEEP_TICKET_CONST,
            keep_ticket_exp: KEEP_TICKET_EXP,
            target_wait_time: TARGET_WAIT_TIME,
            min_radius_window: MIN_RADIUS_WINDOW,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            due_buffer: DEFAULT_DUE_BUFFER,
        }
    }
}

impl TicketStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group_time.as_nanos() == 0 {
            return Err(anyhow!("group_time must be non-zero"));
        }
        if self.group_time.as_nanos() > u128::from(u64::MAX) {
            return Err(anyhow!("group_time must fit in u64 nanoseconds"));
        }
        if self.target_wait_time.is_zero() {
            return Err(anyhow!("target_wait_time must be non-zero"));
        }
        if self.time_window == 0 {
            return Err(anyhow!("time_window must be at least one bucket"));
        }
        if self.min_radius_window == 0 {
            return Err(anyhow!("min_radius_window must be at least one sample"));
        }
        if self.command_buffer == 0 {
            return Err(anyhow!("command_buffer must be non-zero"));
        }
        if self.due_buffer == 0 {
            return Err(anyhow!("due_buffer must be non-zero"));
        }
        Ok(())
    }

    fn group_nanos(&self) -> u64 {
        self.group_time.as_nanos() as u64
    }
}

/// Result of offering a ticket to [`TicketStore::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// A ticket from the same registrar is already held.
    Duplicate,
    /// No topic slot was scheduled; the ticket was dropped.
    Discarded,
    /// The ticket is held with `scheduled` topic slots pending.
    Retained { id: TicketId, scheduled: usize },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TicketStoreStats {
    pub tracked_topics: usize,
    pub registering_topics: usize,
    pub held_tickets: usize,
    /// Sum of the reference counts of all held tickets.
    pub held_refs: usize,
    pub scheduled_slots: usize,
    pub min_radius: u64,
    pub last_group_fetched: Option<u64>,
}

pub struct TicketStore<R: TicketRandom = StdRandom> {
    config: TicketStoreConfig,
    topics: HashMap<Topic, TopicTickets>,
    tickets: HashMap<TicketId, HeldTicket>,
    nodes: HashMap<Identity, TicketId>,
    last_group_fetched: Option<u64>,
    min_radius: MinRadiusEstimator,
    rng: R,
    next_id: u64,
}

impl TicketStore<StdRandom> {
    pub fn new() -> Self {
        Self::build(TicketStoreConfig::default(), StdRandom::new())
    }
}

impl Default for TicketStore<StdRandom> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: TicketRandom> TicketStore<R> {
    pub fn with_config(config: TicketStoreConfig, rng: R) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, rng))
    }

    fn build(config: TicketStoreConfig, rng: R) -> Self {
        let min_radius = MinRadiusEstimator::new(config.min_radius_window);
        Self {
            config,
            topics: HashMap::new(),
            tickets: HashMap::new(),
            nodes: HashMap::new(),
            last_group_fetched: None,
            min_radius,
            rng,
            next_id: 0,
        }
    }

    pub fn config(&self) -> &TicketStoreConfig {
        &self.config
    }

    /// Start tracking a topic. With `register` set the local node registers
    /// the topic and tickets for it are collected; otherwise tickets only
    /// tune the topic's radius. Calling it for a tracked topic is a no-op.
    pub fn add_topic(&mut self, topic: Topic, register: bool) {
        if self.topics.contains_key(&topic) {
            return;
        }
        debug!(topic = %topic, register = register, "tracking topic");
        let tt = TopicTickets::with_target_wait(topic.clone(), register, self.config.target_wait_time);
        self.topics.insert(topic, tt);
    }

    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.topics.contains_key(topic)
    }

    /// Target of the next lookup for registration or topic search.
    pub fn next_target(&mut self, topic: &Topic) -> Option<Identity> {
        let tt = self.topics.get(topic)?;
        Some(tt.next_target(&mut self.rng))
    }

    /// Number of slots scheduled for `topic` in the registration window
    /// starting at the bucket containing `local_time`.
    pub fn tickets_in_window(&self, topic: &Topic, local_time: u64) -> usize {
        let Some(tt) = self.topics.get(topic) else {
            return 0;
        };
        let current = local_time / self.config.group_nanos();
        tt.scheduled_in(current..current.saturating_add(self.config.time_window))
    }

    pub fn add(&mut self, local_time: u64, ticket: Ticket) -> AddOutcome {
        if self.nodes.contains_key(&ticket.registrar) {
            trace!(
                peer = %ticket.registrar.short_hex(),
                "ticket ignored: registrar already has a held ticket"
            );
            return AddOutcome::Duplicate;
        }

        let group = self.config.group_nanos();
        let last_fetched = *self.last_group_fetched.get_or_insert(local_time / group);
        let min_radius = self.min_radius.min_radius();
        let keep_const = self.config.keep_ticket_const.as_nanos() as f64;
        let keep_exp = self.config.keep_ticket_exp.as_nanos() as f64;
        let id = TicketId(self.next_id);
        let mut ref_cnt = 0usize;

        let slots = ticket.topics.iter().zip(ticket.reg_time.iter().copied());
        for (index, (topic, reg_time)) in slots.enumerate() {
            let Some(tt) = self.topics.get_mut(topic) else {
                continue;
            };
            if !tt.is_in_radius(&ticket.registrar) {
                trace!(topic = %topic, peer = %ticket.registrar.short_hex(), "registrar outside topic radius");
                continue;
            }

            tt.adjust(local_time, reg_time, min_radius);
            if !tt.converged() {
                continue;
            }

            let wait = reg_time.saturating_sub(local_time);
            let rnd = self.rng.exp().min(MAX_EXP_DRAW);
            if tt.is_registering() && (wait as f64) < keep_const + keep_exp * rnd {
                // A slot whose bucket was already drained goes into the
                // oldest bucket the next fetch will still scan.
                let bucket = (reg_time / group).max(last_fetched);
                tt.schedule(bucket, TicketRef { ticket: id, index, reg_time });
                ref_cnt += 1;
                trace!(topic = %topic, bucket = bucket, wait_ns = wait, "scheduled ticket slot");
            }
        }

        if ref_cnt == 0 {
            trace!(peer = %ticket.registrar.short_hex(), "ticket discarded");
            return AddOutcome::Discarded;
        }

        self.next_id += 1;
        debug!(
            peer = %ticket.registrar.short_hex(),
            serial = ticket.serial,
            scheduled = ref_cnt,
            "ticket retained"
        );
        self.nodes.insert(ticket.registrar, id);
        self.tickets.insert(
            id,
            HeldTicket {
                ticket: Arc::new(ticket),
                ref_cnt,
            },
        );
        AddOutcome::Retained {
            id,
            scheduled: ref_cnt,
        }
    }

    /// Pull every scheduled slot whose deadline is at or before `local_time`.
    /// A ticket appears once per due slot.
    pub fn fetch(&mut self, local_time: u64) -> Vec<Arc<Ticket>> {
        self.fetch_limited(local_time, usize::MAX)
    }

    /// Like [`TicketStore::fetch`], but hands out at most `limit` slots. Due
    /// slots beyond the limit stay scheduled in the current bucket and are
    /// returned by a later fetch.
    pub fn fetch_limited(&mut self, local_time: u64, limit: usize) -> Vec<Arc<Ticket>> {
        let current = local_time / self.config.group_nanos();
        let from = self.last_group_fetched.unwrap_or(current);
        let mut due = Vec::new();
        let mut deferred = 0usize;

        for tt in self.topics.values_mut() {
            for slot in tt.drain_due(from, current, local_time) {
                if due.len() >= limit {
                    tt.schedule(current, slot);
                    deferred += 1;
                    continue;
                }
                let Some(held) = self.tickets.get_mut(&slot.ticket) else {
                    warn!(ticket = ?slot.ticket, "scheduled slot refers to a released ticket");
                    continue;
                };
                due.push(held.ticket.clone());
                held.ref_cnt -= 1;
                if held.ref_cnt == 0 {
                    let registrar = held.ticket.registrar;
                    self.tickets.remove(&slot.ticket);
                    if self.nodes.get(&registrar) == Some(&slot.ticket) {
                        self.nodes.remove(&registrar);
                    }
                    trace!(peer = %registrar.short_hex(), "ticket released");
                }
            }
        }

        let fetched = current.max(from);
        self.last_group_fetched = Some(fetched);
        if !due.is_empty() {
            debug!(count = due.len(), bucket = current, "fetched due ticket slots");
        }
        if deferred > 0 {
            debug!(deferred = deferred, bucket = fetched, "due ticket slots deferred to next fetch");
        }
        due
    }

    /// The scheduled slot with the earliest deadline and the time left until
    /// it may be used. A zero wait means the ticket can be used now; the same
    /// ticket may be returned again for its other topics.
    pub fn next_registerable_ticket(&self, local_time: u64) -> Option<(Arc<Ticket>, Duration)> {
        let slot = self
            .topics
            .values()
            .filter_map(TopicTickets::earliest_scheduled)
            .min_by_key(|slot| slot.reg_time)?;
        let held = self.tickets.get(&slot.ticket)?;
        let wait = Duration::from_nanos(slot.reg_time.saturating_sub(local_time));
        Some((held.ticket.clone(), wait))
    }

    pub fn get_node_ticket(&self, id: &Identity) -> Option<&Arc<Ticket>> {
        let ticket_id = self.nodes.get(id)?;
        self.tickets.get(ticket_id).map(|held| &held.ticket)
    }

    /// Number of scheduled slots still referencing a held ticket.
    pub fn ticket_ref_count(&self, id: TicketId) -> usize {
        self.tickets.get(&id).map(|held| held.ref_cnt).unwrap_or(0)
    }

    /// Feed the distance between a lookup target and the node found for it
    /// into the global minimum radius estimate.
    pub fn adjust_min_radius(&mut self, target: &Identity, found: &Identity) {
        self.min_radius.observe(target, found);
    }

    pub fn min_radius(&self) -> u64 {
        self.min_radius.min_radius()
    }

    pub fn topic_radius(&self, topic: &Topic) -> Option<RadiusSnapshot> {
        self.topics.get(topic).map(TopicTickets::snapshot)
    }

    pub fn stats(&self) -> TicketStoreStats {
        TicketStoreStats {
            tracked_topics: self.topics.len(),
            registering_topics: self.topics.values().filter(|tt| tt.is_registering()).count(),
            held_tickets: self.tickets.len(),
            held_refs: self.tickets.values().map(|held| held.ref_cnt).sum(),
            scheduled_slots: self.topics.values().map(TopicTickets::scheduled_len).sum(),
            min_radius: self.min_radius.min_radius(),
            last_group_fetched: self.last_group_fetched,
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut refs: HashMap<TicketId, usize> = HashMap::new();
        for tt in self.topics.values() {
            for slot in tt.scheduled() {
                *refs.entry(slot.ticket).or_default() += 1;
            }
        }

        assert_eq!(self.tickets.len(), self.nodes.len(), "arena and node index diverged");
        for (id, held) in &self.tickets {
            assert!(held.ref_cnt > 0, "held ticket with zero refcount");
            assert_eq!(refs.get(id).copied().unwrap_or(0), held.ref_cnt, "refcount mismatch");
            assert_eq!(self.nodes.get(&held.ticket.registrar), Some(id));
        }
        for id in refs.keys() {
            assert!(self.tickets.contains_key(id), "slot scheduled for unknown ticket");
        }
        if let Some(last) = self.last_group_fetched {
            for tt in self.topics.values() {
                if let Some(oldest) = tt.oldest_bucket() {
                    assert!(oldest >= last, "stale bucket survived fetch");
                }
            }
        }
    }
}
