//! Integration tests for the TicketService actor.
//!
//! All tests run on a paused tokio clock: the runtime advances time whenever
//! every task is idle, so the periodic fetch fires deterministically.
//!
//! Run with verbose output: RUST_LOG=trace cargo test --test ticket_service -- --nocapture

use std::sync::Once;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use topicdisc::{
    encode_pong, AddOutcome, DecodedPong, Identity, Pong, TicketRandom, TicketService, TicketStoreConfig, Topic,
};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Retention cutoff of exactly 30 minutes.
struct Scripted;

impl TicketRandom for Scripted {
    fn below(&mut self, bound: u64) -> u64 {
        bound / 2
    }

    fn exp(&mut self) -> f64 {
        0.5
    }
}

const MINUTE: Duration = Duration::from_secs(60);

fn spawn() -> TicketService {
    TicketService::spawn_with_random(TicketStoreConfig::default(), Scripted).expect("spawn")
}

fn registrar(topic: &Topic, offset: u64) -> Identity {
    Identity::from_prefix(topic.hash_prefix() ^ offset)
}

fn pong(waits_secs: &[u32]) -> DecodedPong {
    let pong = Pong {
        expiration: 0,
        topic_hash: [0; 32],
        ticket_serial: 1,
        wait_periods: waits_secs.to_vec(),
    };
    DecodedPong::decode(encode_pong(&pong).expect("encode")).expect("decode")
}

/// Track `topic` for registration and converge its radius with a ticket
/// due in 20 minutes.
async fn warm_up(service: &TicketService, topic: &Topic) -> Identity {
    service.add_topic(topic.clone(), true).await.expect("add topic");
    let from = registrar(topic, 1);
    let outcome = service
        .add_pong(vec![topic.clone()], from, pong(&[20 * 60]))
        .await
        .expect("add pong");
    assert!(matches!(outcome, AddOutcome::Retained { scheduled: 1, .. }));
    from
}

#[tokio::test(start_paused = true)]
async fn due_tickets_are_delivered_on_periodic_tick() {
    init_tracing();
    let service = spawn();
    let topic = Topic::from("les2");
    let mut due = service.due_tickets().await.expect("receiver");

    let slow = warm_up(&service, &topic).await;
    let fast = registrar(&topic, 2);
    let outcome = service
        .add_pong(vec![topic.clone()], fast, pong(&[5 * 60]))
        .await
        .expect("add pong");
    assert!(matches!(outcome, AddOutcome::Retained { .. }));
    assert_eq!(service.tickets_in_window(topic.clone()).await.expect("window"), 2);

    let first = timeout(10 * MINUTE, due.recv())
        .await
        .expect("ticket within 10 minutes")
        .expect("channel open");
    assert_eq!(first.registrar, fast);
    assert!(service.local_time().await.expect("clock") >= 5 * 60 * 1_000_000_000);

    let second = timeout(30 * MINUTE, due.recv())
        .await
        .expect("ticket within 30 minutes")
        .expect("channel open");
    assert_eq!(second.registrar, slow);

    let stats = service.stats().await.expect("stats");
    assert_eq!(stats.held_tickets, 0);
    assert_eq!(stats.scheduled_slots, 0);
    service.quit().await;
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_delays_but_never_loses_due_tickets() {
    init_tracing();
    let config = TicketStoreConfig {
        due_buffer: 1,
        ..Default::default()
    };
    let service = TicketService::spawn_with_random(config, Scripted).expect("spawn");
    let topic = Topic::from("les2");
    let slow = warm_up(&service, &topic).await;

    let mut expected = Vec::new();
    for offset in 2..5u64 {
        let from = registrar(&topic, offset);
        let outcome = service
            .add_pong(vec![topic.clone()], from, pong(&[5 * 60]))
            .await
            .expect("add pong");
        assert!(matches!(outcome, AddOutcome::Retained { .. }));
        expected.push(from);
    }

    // Nobody reads the due channel while all three slots come due.
    tokio::time::sleep(7 * MINUTE).await;
    let stats = service.stats().await.expect("stats");
    assert_eq!(stats.held_tickets, 3, "only one slot fits the channel");
    assert_eq!(stats.scheduled_slots, 3);

    let mut due = service.due_tickets().await.expect("receiver");
    let mut delivered = Vec::new();
    for _ in 0..3 {
        let ticket = timeout(5 * MINUTE, due.recv())
            .await
            .expect("ticket delivered on a later tick")
            .expect("channel open");
        delivered.push(ticket.registrar);
    }
    delivered.sort();
    expected.sort();
    assert_eq!(delivered, expected);

    let stats = service.stats().await.expect("stats");
    assert_eq!(stats.held_tickets, 1);
    assert!(service.get_node_ticket(slow).await.expect("query").is_some());
    service.quit().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_receiver_leaves_slots_for_direct_fetch() {
    let service = spawn();
    let topic = Topic::from("les2");
    let from = warm_up(&service, &topic).await;
    drop(service.due_tickets().await.expect("receiver"));

    tokio::time::sleep(21 * MINUTE).await;
    assert_eq!(service.stats().await.expect("stats").held_tickets, 1);

    let fetched = service.fetch().await.expect("fetch");
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].registrar, from);
    service.quit().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_pongs_are_serialized_by_the_actor() {
    init_tracing();
    let service = spawn();
    let topic = Topic::from("les2");
    warm_up(&service, &topic).await;

    let outcomes = join_all((0..16u64).map(|i| {
        let service = service.clone();
        let topics = vec![topic.clone()];
        let from = registrar(&topic, i + 2);
        async move {
            let waits = [((i + 1) * 60) as u32];
            service.add_pong(topics, from, pong(&waits)).await
        }
    }))
    .await;

    for outcome in outcomes {
        assert!(matches!(outcome.expect("add pong"), AddOutcome::Retained { .. }));
    }
    let stats = service.stats().await.expect("stats");
    assert_eq!(stats.held_tickets, 17);
    assert_eq!(stats.held_refs, 17);
    assert_eq!(service.tickets_in_window(topic).await.expect("window"), 17);
    service.quit().await;
}

#[tokio::test(start_paused = true)]
async fn queries_reflect_store_state() {
    let service = spawn();
    let topic = Topic::from("les2");
    assert!(service.next_target(topic.clone()).await.expect("target").is_none());

    let from = warm_up(&service, &topic).await;
    let held = service.get_node_ticket(from).await.expect("query").expect("held");
    assert_eq!(held.registrar, from);

    let (next, wait) = service
        .next_registerable_ticket()
        .await
        .expect("query")
        .expect("scheduled");
    assert_eq!(next.registrar, from);
    assert_eq!(wait, 20 * MINUTE);

    let target = service.next_target(topic.clone()).await.expect("target").expect("tracked");
    assert_eq!(target.prefix() ^ topic.hash_prefix(), u64::MAX / 2 / 2 * 2);

    service
        .adjust_min_radius(Identity::from_prefix(0), Identity::from_prefix(1 << 20))
        .await
        .expect("adjust");
    assert_eq!(service.stats().await.expect("stats").min_radius, 16 << 20);

    let fetched = service.fetch().await.expect("fetch");
    assert!(fetched.is_empty());
    service.quit().await;
}
