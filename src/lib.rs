mod identity;
mod messages;
mod radius;
mod random;
mod service;
mod store;
mod ticket;
mod topic;

pub use identity::Identity;
pub use messages::{decode_pong, encode_pong, topic_set_hash, DecodedPong, Pong, MAX_PONG_SIZE, MAX_WAIT_PERIODS};
pub use radius::{MinRadiusEstimator, MAX_RADIUS};
pub use random::{StdRandom, TicketRandom};
pub use service::{LocalClock, TicketService};
pub use store::{AddOutcome, TicketStore, TicketStoreConfig, TicketStoreStats};
pub use ticket::{pong_to_ticket, ticket_to_pong, Ticket, TicketError, TicketId, TicketRef};
pub use topic::{RadiusSnapshot, Topic, TopicTickets};
