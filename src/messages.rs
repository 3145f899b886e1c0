//! # Registration Pong Wire Format
//!
//! A registrar answers a topic registration ping with a pong carrying one wait
//! period per requested topic. The registrant keeps the raw signed bytes so
//! they can be replayed when the ticket is finally used.
//!
//! Pongs are serialized using bincode with a size limit so that a hostile
//! registrar cannot make the decoder allocate unbounded memory. Signature
//! checking happens in the transport layer before a pong reaches this module.

use bincode::Options;
use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::topic::Topic;

/// Maximum number of wait periods a single pong may carry.
/// SECURITY: Bounds the per-ticket topic list.
pub const MAX_WAIT_PERIODS: usize = 256;

/// Maximum encoded pong size accepted by the decoder.
pub const MAX_PONG_SIZE: u64 = 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PONG_SIZE)
        .with_fixint_encoding()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Ticket issue time in whole seconds of the registrant's clock.
    pub expiration: u64,
    /// Hash of the topic list the ticket covers, see [`topic_set_hash`].
    pub topic_hash: [u8; 32],
    pub ticket_serial: u32,
    /// Per-topic wait in seconds, in the same order as the topic list.
    pub wait_periods: Vec<u32>,
}

impl Pong {
    pub fn validate_structure(&self) -> bool {
        self.wait_periods.len() <= MAX_WAIT_PERIODS
    }
}

pub fn encode_pong(pong: &Pong) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(pong)
}

pub fn decode_pong(bytes: &[u8]) -> Result<Pong, bincode::Error> {
    let pong: Pong = bincode_options().deserialize(bytes)?;
    if !pong.validate_structure() {
        return Err(Box::new(bincode::ErrorKind::Custom(format!(
            "pong carries {} wait periods, limit is {}",
            pong.wait_periods.len(),
            MAX_WAIT_PERIODS
        ))));
    }
    Ok(pong)
}

/// A pong as handed over by the transport: already authenticated, decoded,
/// and paired with the raw bytes it was decoded from.
#[derive(Clone, Debug)]
pub struct DecodedPong {
    pub pong: Pong,
    pub raw: Vec<u8>,
}

impl DecodedPong {
    pub fn decode(raw: Vec<u8>) -> Result<Self, bincode::Error> {
        let pong = decode_pong(&raw)?;
        Ok(Self { pong, raw })
    }

    pub fn wait_periods(&self) -> &[u32] {
        &self.pong.wait_periods
    }
}

/// Hash binding a pong to the ordered topic list it answers.
/// Format: count(4) || [len(4) || topic]*
pub fn topic_set_hash(topics: &[Topic]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(&(topics.len() as u32).to_le_bytes());
    for topic in topics {
        let bytes = topic.as_bytes();
        hasher.update(&(bytes.len() as u32).to_le_bytes());
        hasher.update(bytes);
    }
    *hasher.finalize().as_bytes()
}
