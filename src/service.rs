//! # Ticket Service
//!
//! The [`TicketStore`] assumes exclusive access. [`TicketService`] gives a
//! discovery loop that exclusivity without locks: a spawned actor task owns
//! the store and a [`LocalClock`], and every operation is a command sent over
//! an `mpsc` channel with the reply coming back on a `oneshot`.
//!
//! ```ignore
//! let service = TicketService::spawn(TicketStoreConfig::default())?;
//! service.add_topic(Topic::from("les2"), true).await?;
//!
//! let mut due = service.due_tickets().await?;
//! while let Some(ticket) = due.recv().await {
//!     // turn the ticket into a registration message
//! }
//! ```
//!
//! A periodic task polls the store once per bucket and forwards due tickets
//! to the receiver returned by [`TicketService::due_tickets`]. A slot leaves
//! the store only once the channel has room for it, so a slow or absent
//! consumer delays due tickets but never loses them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::identity::Identity;
use crate::messages::DecodedPong;
use crate::random::{StdRandom, TicketRandom};
use crate::store::{AddOutcome, TicketStore, TicketStoreConfig, TicketStoreStats};
use crate::ticket::{pong_to_ticket, Ticket, TicketError};
use crate::topic::Topic;

/// Monotonic local time in nanoseconds since the clock was created.
///
/// Backed by `tokio::time::Instant`, so it follows paused test time.
#[derive(Clone, Copy, Debug)]
pub struct LocalClock {
    origin: Instant,
}

impl LocalClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver that can be taken exactly once.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

type DueTicket = (Arc<Ticket>, Duration);

enum Command {
    AddTopic(Topic, bool),
    AddPong {
        topics: Vec<Topic>,
        registrar: Identity,
        pong: DecodedPong,
        reply: oneshot::Sender<Result<AddOutcome, TicketError>>,
    },
    AdjustMinRadius(Identity, Identity),

    NextTarget(Topic, oneshot::Sender<Option<Identity>>),
    TicketsInWindow(Topic, oneshot::Sender<usize>),
    NodeTicket(Identity, oneshot::Sender<Option<Arc<Ticket>>>),
    NextRegisterable(oneshot::Sender<Option<DueTicket>>),
    Stats(oneshot::Sender<TicketStoreStats>),
    LocalTime(oneshot::Sender<u64>),

    Fetch(oneshot::Sender<Vec<Arc<Ticket>>>),
    PollDue,

    Quit,
}

#[derive(Clone)]
pub struct TicketService {
    cmd_tx: mpsc::Sender<Command>,
    due_receiver: Arc<TakeOnce<Arc<Ticket>>>,
}

struct TicketActor<R: TicketRandom> {
    store: TicketStore<R>,
    clock: LocalClock,
    cmd_rx: mpsc::Receiver<Command>,
    due_tx: mpsc::Sender<Arc<Ticket>>,
}

impl TicketService {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(config: TicketStoreConfig) -> Result<Self> {
        Self::spawn_with_random(config, StdRandom::new())
    }

    pub fn spawn_with_random<R: TicketRandom + 'static>(config: TicketStoreConfig, rng: R) -> Result<Self> {
        let store = TicketStore::with_config(config.clone(), rng).context("invalid ticket store config")?;
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let (due_tx, due_rx) = mpsc::channel(config.due_buffer);

        let actor = TicketActor {
            store,
            clock: LocalClock::new(),
            cmd_rx,
            due_tx,
        };
        tokio::spawn(actor.run());

        let service = Self {
            cmd_tx,
            due_receiver: Arc::new(Mutex::new(Some(due_rx))),
        };
        service.spawn_periodic_fetch(config.group_time);
        info!(
            group_time_secs = config.group_time.as_secs(),
            time_window = config.time_window,
            "ticket service started"
        );
        Ok(service)
    }

    fn spawn_periodic_fetch(&self, period: Duration) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if cmd_tx.send(Command::PollDue).await.is_err() {
                    break;
                }
            }
            debug!("periodic ticket fetch stopped");
        });
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("ticket service closed"))?;
        rx.await.map_err(|_| anyhow!("ticket service closed"))
    }

    /// Receiver of tickets that became due, fed once per bucket.
    pub async fn due_tickets(&self) -> Result<mpsc::Receiver<Arc<Ticket>>> {
        let mut guard = self.due_receiver.lock().await;
        guard.take().context("due ticket receiver already taken")
    }

    pub async fn add_topic(&self, topic: Topic, register: bool) -> Result<()> {
        self.cmd_tx
            .send(Command::AddTopic(topic, register))
            .await
            .map_err(|_| anyhow!("ticket service closed"))
    }

    /// Turn a registrar's pong into a ticket stamped with the service clock
    /// and offer it to the store.
    pub async fn add_pong(&self, topics: Vec<Topic>, registrar: Identity, pong: DecodedPong) -> Result<AddOutcome> {
        let outcome = self
            .request(|reply| Command::AddPong {
                topics,
                registrar,
                pong,
                reply,
            })
            .await?;
        Ok(outcome?)
    }

    pub async fn adjust_min_radius(&self, target: Identity, found: Identity) -> Result<()> {
        self.cmd_tx
            .send(Command::AdjustMinRadius(target, found))
            .await
            .map_err(|_| anyhow!("ticket service closed"))
    }

    pub async fn next_target(&self, topic: Topic) -> Result<Option<Identity>> {
        self.request(|reply| Command::NextTarget(topic, reply)).await
    }

    pub async fn tickets_in_window(&self, topic: Topic) -> Result<usize> {
        self.request(|reply| Command::TicketsInWindow(topic, reply)).await
    }

    pub async fn get_node_ticket(&self, id: Identity) -> Result<Option<Arc<Ticket>>> {
        self.request(|reply| Command::NodeTicket(id, reply)).await
    }

    pub async fn next_registerable_ticket(&self) -> Result<Option<(Arc<Ticket>, Duration)>> {
        self.request(Command::NextRegisterable).await
    }

    pub async fn stats(&self) -> Result<TicketStoreStats> {
        self.request(Command::Stats).await
    }

    /// Current reading of the service clock.
    pub async fn local_time(&self) -> Result<u64> {
        self.request(Command::LocalTime).await
    }

    /// Drain due tickets directly, bypassing the periodic receiver.
    pub async fn fetch(&self) -> Result<Vec<Arc<Ticket>>> {
        self.request(Command::Fetch).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<R: TicketRandom> TicketActor<R> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::AddTopic(topic, register) => {
                    self.store.add_topic(topic, register);
                }
                Command::AddPong {
                    topics,
                    registrar,
                    pong,
                    reply,
                } => {
                    let now = self.clock.now();
                    let outcome = pong_to_ticket(now, topics, registrar, &pong)
                        .map(|ticket| self.store.add(now, ticket));
                    if let Err(e) = &outcome {
                        warn!(peer = %registrar.short_hex(), error = %e, "rejecting malformed ticket");
                    }
                    let _ = reply.send(outcome);
                }
                Command::AdjustMinRadius(target, found) => {
                    self.store.adjust_min_radius(&target, &found);
                }
                Command::NextTarget(topic, reply) => {
                    let _ = reply.send(self.store.next_target(&topic));
                }
                Command::TicketsInWindow(topic, reply) => {
                    let now = self.clock.now();
                    let _ = reply.send(self.store.tickets_in_window(&topic, now));
                }
                Command::NodeTicket(id, reply) => {
                    let _ = reply.send(self.store.get_node_ticket(&id).cloned());
                }
                Command::NextRegisterable(reply) => {
                    let now = self.clock.now();
                    let _ = reply.send(self.store.next_registerable_ticket(now));
                }
                Command::Stats(reply) => {
                    let _ = reply.send(self.store.stats());
                }
                Command::LocalTime(reply) => {
                    let _ = reply.send(self.clock.now());
                }
                Command::Fetch(reply) => {
                    let now = self.clock.now();
                    let _ = reply.send(self.store.fetch(now));
                }
                Command::PollDue => {
                    self.forward_due();
                }
                Command::Quit => {
                    break;
                }
            }
        }
        debug!("ticket service actor stopped");
    }

    /// Move due slots into the due-ticket channel. Slots are drained from the
    /// store only against reserved channel capacity; the rest stay scheduled
    /// for the next tick.
    fn forward_due(&mut self) {
        let due_tx = &self.due_tx;
        let permits: Vec<_> = std::iter::from_fn(|| due_tx.try_reserve().ok()).collect();
        let now = self.clock.now();
        let tickets = self.store.fetch_limited(now, permits.len());
        if permits.is_empty() {
            trace!(closed = due_tx.is_closed(), "due ticket channel has no room");
        }
        for (permit, ticket) in permits.into_iter().zip(tickets) {
            permit.send(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{encode_pong, Pong};

    fn pong(wait_periods: Vec<u32>) -> DecodedPong {
        let pong = Pong {
            expiration: 0,
            topic_hash: [0u8; 32],
            ticket_serial: 3,
            wait_periods,
        };
        let raw = encode_pong(&pong).expect("encode");
        DecodedPong { pong, raw }
    }

    #[tokio::test(start_paused = true)]
    async fn local_clock_follows_paused_time() {
        let clock = LocalClock::new();
        assert_eq!(clock.now(), 0);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), 90_000_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_pong_is_an_error() {
        let service = TicketService::spawn_with_random(TicketStoreConfig::default(), StdRandom::seeded(1))
            .expect("spawn");
        let topic = Topic::from("foo");
        service.add_topic(topic.clone(), true).await.expect("add topic");

        let result = service
            .add_pong(vec![topic], Identity::from_bytes([1; 32]), pong(vec![1, 2]))
            .await;
        let err = result.expect_err("count mismatch");
        assert!(err.to_string().contains("wait periods"));
        service.quit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn calls_fail_after_quit() {
        let service = TicketService::spawn(TicketStoreConfig::default()).expect("spawn");
        service.quit().await;
        tokio::task::yield_now().await;

        assert!(service.stats().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn due_receiver_can_only_be_taken_once() {
        let service = TicketService::spawn(TicketStoreConfig::default()).expect("spawn");
        assert!(service.due_tickets().await.is_ok());
        assert!(service.due_tickets().await.is_err());
        service.quit().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = TicketStoreConfig {
            command_buffer: 0,
            ..Default::default()
        };
        assert!(TicketService::spawn(config).is_err());
    }
}
