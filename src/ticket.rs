//! # Registration Tickets
//!
//! A [`Ticket`] is the registrant-side record of a registrar's promise: for
//! each topic it names, the earliest local time at which the registrant may
//! come back and register. Times are absolute nanoseconds of the local clock.
//!
//! Tickets are immutable once built. The store shares them behind an `Arc`
//! and tracks how many topic slots still reference each one; a
//! [`TicketRef`] names one such slot.

use std::sync::Arc;
use std::time::Duration;

use crate::identity::Identity;
use crate::messages::{topic_set_hash, DecodedPong, Pong};
use crate::topic::Topic;

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub topics: Vec<Topic>,
    /// Per-topic local absolute time when the ticket can be used.
    pub reg_time: Vec<u64>,
    /// Serial number issued by the registrar.
    pub serial: u32,
    /// Local time the ticket was created.
    pub issue_time: u64,
    /// The registrar that signed this ticket.
    pub registrar: Identity,
    /// Encoded pong signed by the registrar.
    pub pong: Vec<u8>,
}

impl Ticket {
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Time left until slot `index` may be used, zero if already usable.
    pub fn wait(&self, index: usize, local_time: u64) -> Option<Duration> {
        self.reg_time
            .get(index)
            .map(|reg| Duration::from_nanos(reg.saturating_sub(local_time)))
    }
}

/// Stable key of a held ticket inside the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId(pub u64);

/// One topic slot of a held ticket. Carries a copy of the slot's deadline so
/// schedule scans do not need to consult the ticket itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TicketRef {
    pub ticket: TicketId,
    pub index: usize,
    pub reg_time: u64,
}

/// A ticket together with the number of scheduled slots still using it.
#[derive(Debug)]
pub(crate) struct HeldTicket {
    pub ticket: Arc<Ticket>,
    pub ref_cnt: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketError {
    /// The pong's wait-period list does not line up with the requested topics.
    TopicCountMismatch { topics: usize, wait_periods: usize },
}

impl std::fmt::Display for TicketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketError::TopicCountMismatch {
                topics,
                wait_periods,
            } => write!(
                f,
                "pong carries {} wait periods for {} topics",
                wait_periods, topics
            ),
        }
    }
}

impl std::error::Error for TicketError {}

/// Convert a registrar's pong into a ticket, turning each relative wait
/// period into an absolute local deadline.
pub fn pong_to_ticket(
    local_time: u64,
    topics: Vec<Topic>,
    registrar: Identity,
    pong: &DecodedPong,
) -> Result<Ticket, TicketError> {
    let wait_periods = pong.wait_periods();
    if wait_periods.len() != topics.len() {
        return Err(TicketError::TopicCountMismatch {
            topics: topics.len(),
            wait_periods: wait_periods.len(),
        });
    }

    let reg_time = wait_periods
        .iter()
        .map(|&wp| local_time.saturating_add(u64::from(wp) * NANOS_PER_SEC))
        .collect();

    Ok(Ticket {
        topics,
        reg_time,
        serial: pong.pong.ticket_serial,
        issue_time: local_time,
        registrar,
        pong: pong.raw.clone(),
    })
}

/// Rebuild the wire pong a registrar would emit for this ticket.
pub fn ticket_to_pong(ticket: &Ticket) -> Pong {
    let wait_periods = ticket
        .reg_time
        .iter()
        .map(|&reg| {
            let secs = reg.saturating_sub(ticket.issue_time) / NANOS_PER_SEC;
            u32::try_from(secs).unwrap_or(u32::MAX)
        })
        .collect();

    Pong {
        expiration: ticket.issue_time / NANOS_PER_SEC,
        topic_hash: topic_set_hash(&ticket.topics),
        ticket_serial: ticket.serial,
        wait_periods,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::encode_pong;

    fn registrar() -> Identity {
        Identity::from_bytes([0x21; 32])
    }

    fn decoded(wait_periods: Vec<u32>, serial: u32) -> DecodedPong {
        let pong = Pong {
            expiration: 0,
            topic_hash: [0u8; 32],
            ticket_serial: serial,
            wait_periods,
        };
        let raw = encode_pong(&pong).expect("encode");
        DecodedPong { pong, raw }
    }

    #[test]
    fn wait_periods_become_absolute_deadlines() {
        let topics = vec![Topic::from("a"), Topic::from("b")];
        let pong = decoded(vec![5, 120], 9);
        let t = pong_to_ticket(1_000, topics.clone(), registrar(), &pong).expect("ticket");

        assert_eq!(t.topics, topics);
        assert_eq!(t.reg_time, vec![1_000 + 5 * NANOS_PER_SEC, 1_000 + 120 * NANOS_PER_SEC]);
        assert_eq!(t.issue_time, 1_000);
        assert_eq!(t.serial, 9);
        assert_eq!(t.registrar, registrar());
        assert_eq!(t.pong, pong.raw);
    }

    #[test]
    fn mismatched_topic_count_is_rejected() {
        let pong = decoded(vec![5], 1);
        let err = pong_to_ticket(0, vec![Topic::from("a"), Topic::from("b")], registrar(), &pong)
            .expect_err("mismatch");
        assert_eq!(
            err,
            TicketError::TopicCountMismatch {
                topics: 2,
                wait_periods: 1
            }
        );
        assert!(err.to_string().contains("1 wait periods for 2 topics"));
    }

    #[test]
    fn ticket_to_pong_inverts_pong_to_ticket() {
        let topics = vec![Topic::from("x"), Topic::from("y"), Topic::from("z")];
        let local_time = 42 * NANOS_PER_SEC + 17;
        let original = decoded(vec![0, 60, 3600], 77);
        let ticket = pong_to_ticket(local_time, topics.clone(), registrar(), &original).expect("ticket");

        let pong = ticket_to_pong(&ticket);
        assert_eq!(pong.wait_periods, vec![0, 60, 3600]);
        assert_eq!(pong.ticket_serial, 77);
        assert_eq!(pong.expiration, 42);
        assert_eq!(pong.topic_hash, topic_set_hash(&topics));

        let replay = DecodedPong {
            raw: encode_pong(&pong).expect("encode"),
            pong,
        };
        let again = pong_to_ticket(local_time, topics, registrar(), &replay).expect("ticket");
        assert_eq!(again.reg_time, ticket.reg_time);
    }

    #[test]
    fn wait_saturates_at_zero() {
        let pong = decoded(vec![10], 1);
        let t = pong_to_ticket(0, vec![Topic::from("a")], registrar(), &pong).expect("ticket");

        assert_eq!(t.wait(0, 0), Some(Duration::from_secs(10)));
        assert_eq!(t.wait(0, 20 * NANOS_PER_SEC), Some(Duration::ZERO));
        assert_eq!(t.wait(1, 0), None);
        assert_eq!(t.len(), 1);
        assert!(!t.is_empty());
    }
}
