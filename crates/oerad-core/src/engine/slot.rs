//! Per-direction transfer bookkeeping.

use std::collections::VecDeque;

use super::handler::TransferHandler;
use crate::protocol::Command;
use crate::transport::TransferToken;

/// Inbound arm plus the single pending IN transfer.
#[derive(Default)]
pub(crate) struct InboundSlot {
    pub handler: Option<Box<dyn TransferHandler>>,
    /// Requested length of every IN transfer.
    pub len: usize,
    pub pending: Option<TransferToken>,
    /// Buffer returned by the previous completion, reused for the next
    /// submission.
    pub spare: Option<Vec<u8>>,
}

impl InboundSlot {
    pub fn is_armed(&self) -> bool {
        self.handler.is_some() && self.len > 0
    }

    /// A zeroed buffer of the armed length, recycling the spare.
    pub fn next_buffer(&mut self) -> Vec<u8> {
        let mut buf = self.spare.take().unwrap_or_default();
        buf.clear();
        buf.resize(self.len, 0);
        buf
    }
}

/// Outbound arm, the single in-flight command, and commands held behind it.
#[derive(Default)]
pub(crate) struct OutboundSlot {
    pub handler: Option<Box<dyn TransferHandler>>,
    pub capacity: usize,
    pub pending: Option<(TransferToken, Command)>,
    pub queue: VecDeque<Command>,
}

impl OutboundSlot {
    pub fn is_armed(&self) -> bool {
        self.handler.is_some() && self.capacity > 0
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || !self.queue.is_empty()
    }
}
