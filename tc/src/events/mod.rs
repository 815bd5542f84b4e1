//! Observability stream of kernel activity

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::KernelEvent;
