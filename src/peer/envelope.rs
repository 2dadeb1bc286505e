//! Outbound message plus its optional completion signal.

use crate::peer::wire::Message;
use tokio::sync::oneshot;

/// Signals that a queued message was written, dropped, or abandoned at
/// shutdown. Either outcome resolves the receiver.
pub type CompletionSender = oneshot::Sender<()>;

/// A message waiting to be handed to the writer.
///
/// The completion signal fires exactly once: either through
/// [`OutboundEnvelope::complete`] or when the envelope is dropped, so an
/// envelope discarded on any shutdown path can never leave its sender
/// waiting.
#[derive(Debug)]
pub struct OutboundEnvelope {
    message: Message,
    done: Option<CompletionSender>,
}

impl OutboundEnvelope {
    pub fn new(message: Message, done: Option<CompletionSender>) -> Self {
        Self { message, done }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn has_completion(&self) -> bool {
        self.done.is_some()
    }

    /// Fire the completion signal, if any
    pub fn complete(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(done) = self.done.take() {
            // The waiter may have given up (deadline); nothing to do then.
            let _ = done.send(());
        }
    }
}

impl From<Message> for OutboundEnvelope {
    fn from(message: Message) -> Self {
        Self::new(message, None)
    }
}

impl Drop for OutboundEnvelope {
    fn drop(&mut self) {
        self.fire();
    }
}
