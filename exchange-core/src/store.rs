//! Participant persistence port.
//!
//! Every call is scoped to one event; nothing stored under one event is
//! visible from another.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Assignment, EventId, ExchangeError, Participant};

pub trait ParticipantStore {
    /// Forward lookup by identity.
    fn get(&self, event: &str, id: &str) -> Option<Participant>;

    /// Reverse lookup: the participant whose `shipping_to` is `id`.
    fn find_sender_of(&self, event: &str, id: &str) -> Option<Participant>;

    /// All participants of `event`, in sign-up order.
    fn roster(&self, event: &str) -> Vec<Participant>;

    /// Create or replace the record for `participant.id`.
    fn upsert(&mut self, event: &str, participant: Participant) -> Result<(), ExchangeError>;

    /// Overwrite `shipping_to` for the whole roster in one step. Participants
    /// missing from `assignment` end up unassigned. Implementations must apply
    /// all of it or none of it.
    fn replace_assignments(
        &mut self,
        event: &str,
        assignment: &Assignment,
    ) -> Result<(), ExchangeError>;
}

/// A `HashMap`-backed store, serializable so hosts can snapshot it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    events: HashMap<EventId, Vec<Participant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

impl ParticipantStore for MemoryStore {
    fn get(&self, event: &str, id: &str) -> Option<Participant> {
        self.events
            .get(event)?
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    fn find_sender_of(&self, event: &str, id: &str) -> Option<Participant> {
        self.events
            .get(event)?
            .iter()
            .find(|p| p.shipping_to.as_deref() == Some(id))
            .cloned()
    }

    fn roster(&self, event: &str) -> Vec<Participant> {
        self.events.get(event).cloned().unwrap_or_default()
    }

    fn upsert(&mut self, event: &str, participant: Participant) -> Result<(), ExchangeError> {
        let roster = self.events.entry(event.to_string()).or_default();
        match roster.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => roster.push(participant),
        }
        Ok(())
    }

    fn replace_assignments(
        &mut self,
        event: &str,
        assignment: &Assignment,
    ) -> Result<(), ExchangeError> {
        let roster = self.events.get_mut(event).map(Vec::as_mut_slice).unwrap_or_default();
        if let Some((giver, _)) = assignment
            .iter()
            .find(|(giver, _)| !roster.iter().any(|p| p.id == *giver))
        {
            return Err(ExchangeError::UnknownParticipant(giver.to_string()));
        }

        for participant in roster.iter_mut() {
            participant.shipping_to = assignment.recipient_of(&participant.id).map(str::to_string);
        }
        Ok(())
    }
}
