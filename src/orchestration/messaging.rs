//! Direct and broadcast messaging between workers.
//!
//! Every message is appended to the store's message log, which is the
//! record of truth. Live subscribers additionally receive each message over
//! a `tokio::broadcast` channel; a subscriber that falls behind can always
//! catch up from the log with [`MessageChannel::inbox`].
//!
//! Messages are advisory. Nothing here changes task state.

use tokio::sync::broadcast;

use crate::clog_debug;
use crate::core::{Message, MessageKind, Payload, Recipient, Sender, TaskId, WorkerId};
use crate::error::Result;
use crate::store::SharedStore;

const LIVE_CAPACITY: usize = 128;

pub struct MessageChannel {
    store: SharedStore,
    live: broadcast::Sender<Message>,
}

impl MessageChannel {
    pub fn new(store: SharedStore) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self { store, live }
    }

    /// Log a message and fan it out to live subscribers.
    pub fn post(&self, message: Message) -> Result<Message> {
        let message = self.store.append_message(message)?;
        clog_debug!(
            "message #{} {:?} -> {:?} ({:?})",
            message.seq,
            message.sender,
            message.recipient,
            message.kind
        );
        // No receivers is fine: the log already has it.
        let _ = self.live.send(message.clone());
        Ok(message)
    }

    pub fn send(&self, from: Sender, to: WorkerId, payload: Payload) -> Result<Message> {
        self.post(Message::new(from, Recipient::Worker(to), payload))
    }

    pub fn broadcast(&self, from: Sender, payload: Payload) -> Result<Message> {
        self.post(Message::new(from, Recipient::Broadcast, payload))
    }

    /// Coordinator notice to a task's owner.
    pub fn notify(
        &self,
        to: WorkerId,
        kind: MessageKind,
        task: &TaskId,
        text: impl Into<String>,
    ) -> Result<Message> {
        self.post(
            Message::new(Sender::Coordinator, Recipient::Worker(to), Payload::text(text))
                .with_kind(kind)
                .about(task.clone()),
        )
    }

    /// Messages for `worker` with a sequence number above `after_seq`.
    pub fn inbox(&self, worker: &WorkerId, after_seq: u64) -> Result<Vec<Message>> {
        Ok(self
            .store
            .messages()?
            .into_iter()
            .filter(|m| m.seq > after_seq && m.is_for(worker))
            .collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.live.subscribe()
    }

    pub fn log(&self) -> Result<Vec<Message>> {
        self.store.messages()
    }
}
