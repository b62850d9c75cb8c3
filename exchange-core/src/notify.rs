use serde::{Deserialize, Serialize};

use crate::{EventId, ExchangeError, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// From a giver to the person they ship to. Never carries the giver's identity.
    ToRecipient,
    /// From a recipient back to whoever ships to them.
    ToSender,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventId,
    pub recipient: ParticipantId,
    pub sender: Option<ParticipantId>,
    pub kind: MessageKind,
    pub body: String,
}

/// Delivers a message to a participant's contact address.
pub trait Notifier {
    fn deliver(&mut self, envelope: Envelope) -> Result<(), ExchangeError>;
}

/// Keeps every envelope it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    pub delivered: Vec<Envelope>,
}

impl Notifier for RecordingNotifier {
    fn deliver(&mut self, envelope: Envelope) -> Result<(), ExchangeError> {
        self.delivered.push(envelope);
        Ok(())
    }
}

impl<N: Notifier + ?Sized> Notifier for &mut N {
    fn deliver(&mut self, envelope: Envelope) -> Result<(), ExchangeError> {
        (**self).deliver(envelope)
    }
}
