use std::collections::VecDeque;

use crate::protocol::ChatMessage;

/// Append-only chat log of one room, oldest first.
/// With a limit set, the oldest entries fall off the front.
#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    entries: VecDeque<ChatMessage>,
    limit:   Option<usize>,
}

impl ChatLog {
    pub fn new(limit: Option<usize>) -> Self {
        Self { entries: VecDeque::new(), limit }
    }

    /// Append and hand back the updated log for broadcast.
    pub fn append(&mut self, msg: ChatMessage) -> Vec<ChatMessage> {
        self.entries.push_back(msg);
        if let Some(cap) = self.limit {
            while self.entries.len() > cap {
                self.entries.pop_front();
            }
        }
        self.replay()
    }

    pub fn replay(&self) -> Vec<ChatMessage> {
        self.entries.iter().cloned().collect()
    }
}
