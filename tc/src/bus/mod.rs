//! Message bus: envelopes, mailboxes and routing
//!
//! Four directions are supported: downward (parent to child), upward (child to
//! parent), lateral (between siblings of one peer group) and broadcast (topic
//! subscribers). Every send is metered against the sender's communication
//! reserve and either lands in a mailbox or comes back as an explicit outcome.

mod config;
mod core;
mod envelope;
mod mailbox;

pub use config::BusConfig;
pub use core::{BusMetrics, CommunicationMeter, MessageBus, Registration, SendOutcome};
pub use envelope::{Direction, Envelope, Payload};
pub use mailbox::Mailbox;
