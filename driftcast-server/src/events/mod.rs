//! Progress broadcasting with bounded per-subscriber queues.

pub mod bus;

pub use bus::{ProgressBus, Subscriber};
