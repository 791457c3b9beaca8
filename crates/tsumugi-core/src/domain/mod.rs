//! Domain model (IDs, clock, envelope, demo payloads).

pub mod clock;
pub mod envelope;
pub mod ids;
pub mod quote;

pub use clock::{Clock, FixedClock, SystemClock};
pub use envelope::{Envelope, Meta};
pub use ids::{CorrelationId, TaskId};
pub use quote::{Midpoint, Quote};
