//! Networking collaborators
//!
//! The ledger core does not speak any wire protocol itself. It announces
//! committed blocks through [`BlockBroadcaster`]; peer transport sits behind
//! that seam.

pub mod broadcast;

pub use broadcast::{BlockBroadcaster, ChannelBroadcaster, NullBroadcaster};
