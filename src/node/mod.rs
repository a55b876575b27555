//! Node context: the engine that owns chain and mempool, and its clock

pub mod clock;
pub mod engine;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, PendingOrder};
