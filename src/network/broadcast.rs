//! Outbound gossip collaborator
//!
//! The engine hands every committed block to a [`BlockBroadcaster`] and never
//! waits for an acknowledgement. Transport (peers, sockets, retries) lives on
//! the receiving end of the channel.

use crate::core::Block;
use log::{debug, warn};
use tokio::sync::mpsc;

/// Fire-and-forget block announcement
pub trait BlockBroadcaster: Send + Sync {
    fn broadcast(&self, block: &Block);
}

/// Pushes committed blocks into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: mpsc::UnboundedSender<Block>,
}

impl ChannelBroadcaster {
    /// Create the broadcaster and the receiver a transport task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Block>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BlockBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, block: &Block) {
        match self.tx.send(block.clone()) {
            Ok(()) => debug!("Queued block #{} for gossip", block.index),
            Err(_) => warn!(
                "Gossip channel closed, block #{} not announced",
                block.index
            ),
        }
    }
}

/// Drops every announcement (single-node and test setups)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcaster;

impl BlockBroadcaster for NullBroadcaster {
    fn broadcast(&self, _block: &Block) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_broadcaster_delivers() {
        let (broadcaster, mut rx) = ChannelBroadcaster::new();
        let block = Block::new(3, "0".repeat(64), vec![], 1, 100);

        broadcaster.broadcast(&block);

        assert_eq!(rx.recv().await, Some(block));
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (broadcaster, rx) = ChannelBroadcaster::new();
        drop(rx);
        broadcaster.broadcast(&Block::new(1, "0".repeat(64), vec![], 1, 100));
    }
}
