//! Core of a gift-exchange group: the assignment engine that decides who ships
//! to whom, and the stage machine that decides what each participant may see
//! and do at every point of an event.
//!
//! Everything here operates on plain data. Persistence and message delivery are
//! reached through the [`ParticipantStore`] and [`Notifier`] ports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod assign;
pub mod country;
pub mod exchange;
pub mod notify;
pub mod stage;
pub mod store;
pub mod view;

pub use assign::{assign, Assignment};
pub use exchange::{
    draw_assignments, message_recipient, message_sender, override_assignments, roster_overview,
    sign_up, RosterRow, SignupOutcome,
};
pub use notify::{Envelope, MessageKind, Notifier, RecordingNotifier};
pub use stage::{advance, require, Action, Stage};
pub use store::{MemoryStore, ParticipantStore};
pub use view::{stage_view, FormMode, MessagePermissions, ParticipantCard, SignupDefaults, StageView};

pub type ParticipantId = String;
pub type EventId = String;

/// Minimum roster size for a draw: two people could only ship to each other.
pub const MIN_PARTICIPANTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub shipping_address: String,
    /// ISO 3166-1 alpha-2, upper-case.
    pub shipping_country: String,
    pub shipping_to: Option<ParticipantId>,
    /// Extension data such as country restrictions. Core fields never live here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, details: SignupDetails) -> Self {
        Self {
            id: id.into(),
            display_name: details.display_name,
            shipping_address: details.shipping_address,
            shipping_country: details.shipping_country,
            shipping_to: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub stage: Stage,
}

impl Event {
    pub fn new(id: impl Into<EventId>) -> Self {
        Self {
            id: id.into(),
            stage: Stage::Signup,
        }
    }
}

/// The sign-up form payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignupDetails {
    pub display_name: String,
    pub shipping_address: String,
    pub shipping_country: String,
}

impl SignupDetails {
    /// Trims the free-text fields and canonicalises the country code.
    pub fn normalized(self) -> Result<Self, ExchangeError> {
        let display_name = self.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(ExchangeError::MissingField("display_name"));
        }
        let shipping_address = self.shipping_address.trim().to_string();
        if shipping_address.is_empty() {
            return Err(ExchangeError::MissingField("shipping_address"));
        }
        let shipping_country = country::normalize_country(&self.shipping_country)?;

        Ok(Self {
            display_name,
            shipping_address,
            shipping_country,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("at least 3 participants are required, found {found}")]
    InsufficientParticipants { found: usize },
    #[error("participant {0} appears more than once in the roster")]
    DuplicateParticipant(ParticipantId),
    #[error("participant {0} not found")]
    UnknownParticipant(ParticipantId),
    #[error("{0} has not been assigned a recipient")]
    Unassigned(ParticipantId),
    #[error("nobody ships to {0}")]
    NoSender(ParticipantId),
    #[error("unexpected stage {0}")]
    InvalidStage(i64),
    #[error("{action:?} is not allowed during {stage:?}")]
    WrongStage { stage: Stage, action: Action },
    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),
    #[error("unknown country code {0:?}")]
    InvalidCountry(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("message body is empty")]
    EmptyMessage,
    #[error("store error: {0}")]
    Store(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}
