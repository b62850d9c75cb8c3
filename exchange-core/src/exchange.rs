//! Stage-gated operations that combine the engine with the ports.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::stage::require;
use crate::{
    assign, Action, Assignment, Envelope, Event, ExchangeError, MessageKind, Notifier,
    Participant, ParticipantCard, ParticipantStore, SignupDetails, Stage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignupOutcome {
    Created,
    Updated,
}

/// Registers `identity` for the event, or updates their shipping details if
/// they are already on the roster. Any existing assignment is kept.
pub fn sign_up<S>(
    store: &mut S,
    event: &Event,
    identity: &str,
    details: SignupDetails,
) -> Result<SignupOutcome, ExchangeError>
where
    S: ParticipantStore + ?Sized,
{
    require(event.stage, Action::SignUp)?;
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(ExchangeError::MissingField("identity"));
    }
    let details = details.normalized()?;

    let (participant, outcome) = match store.get(&event.id, identity) {
        Some(mut existing) => {
            existing.display_name = details.display_name;
            existing.shipping_address = details.shipping_address;
            existing.shipping_country = details.shipping_country;
            (existing, SignupOutcome::Updated)
        }
        None => (Participant::new(identity, details), SignupOutcome::Created),
    };
    store.upsert(&event.id, participant)?;

    info!(event = %event.id, ?outcome, "sign-up recorded");
    Ok(outcome)
}

/// Draws a fresh assignment from the current roster and stores it, replacing
/// any earlier draw. Nothing is written if the draw fails.
pub fn draw_assignments<S, R>(
    store: &mut S,
    event: &Event,
    rng: &mut R,
) -> Result<Assignment, ExchangeError>
where
    S: ParticipantStore + ?Sized,
    R: Rng + ?Sized,
{
    require(event.stage, Action::Assign)?;
    let roster = store.roster(&event.id);
    let assignment = assign(&roster, rng)?;
    store.replace_assignments(&event.id, &assignment)?;

    info!(
        event = %event.id,
        participants = assignment.len(),
        "assignments saved"
    );
    Ok(assignment)
}

/// Stores an organizer-supplied assignment after checking it covers the
/// roster. Short cycles are accepted here; only the draw avoids them.
pub fn override_assignments<S>(
    store: &mut S,
    event: &Event,
    assignment: Assignment,
) -> Result<Assignment, ExchangeError>
where
    S: ParticipantStore + ?Sized,
{
    if let Stage::Invalid(code) = event.stage {
        return Err(ExchangeError::InvalidStage(code));
    }
    let roster = store.roster(&event.id);
    assignment.validate(&roster)?;
    store.replace_assignments(&event.id, &assignment)?;

    info!(
        event = %event.id,
        participants = assignment.len(),
        cycles = assignment.cycle_count(),
        "assignments overridden"
    );
    Ok(assignment)
}

/// Sends an anonymous note from `from` to the person they ship to.
pub fn message_recipient<S, N>(
    store: &S,
    notifier: &mut N,
    event: &Event,
    from: &str,
    body: &str,
) -> Result<Envelope, ExchangeError>
where
    S: ParticipantStore + ?Sized,
    N: Notifier + ?Sized,
{
    require(event.stage, Action::MessageRecipient)?;
    let body = non_empty(body)?;
    let me = member(store, event, from)?;
    let target = me
        .shipping_to
        .ok_or_else(|| ExchangeError::Unassigned(me.id.clone()))?;
    let recipient = member(store, event, &target)?;

    let envelope = Envelope {
        event: event.id.clone(),
        recipient: recipient.id,
        sender: None,
        kind: MessageKind::ToRecipient,
        body,
    };
    notifier.deliver(envelope.clone())?;
    debug!(event = %event.id, "message delivered to recipient");
    Ok(envelope)
}

/// Sends a signed note from `from` to whoever ships to them.
pub fn message_sender<S, N>(
    store: &S,
    notifier: &mut N,
    event: &Event,
    from: &str,
    body: &str,
) -> Result<Envelope, ExchangeError>
where
    S: ParticipantStore + ?Sized,
    N: Notifier + ?Sized,
{
    require(event.stage, Action::MessageSender)?;
    let body = non_empty(body)?;
    let me = member(store, event, from)?;
    let sender = store
        .find_sender_of(&event.id, &me.id)
        .ok_or_else(|| ExchangeError::NoSender(me.id.clone()))?;

    let envelope = Envelope {
        event: event.id.clone(),
        recipient: sender.id,
        sender: Some(me.id),
        kind: MessageKind::ToSender,
        body,
    };
    notifier.deliver(envelope.clone())?;
    debug!(event = %event.id, "message delivered to sender");
    Ok(envelope)
}

fn non_empty(body: &str) -> Result<String, ExchangeError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ExchangeError::EmptyMessage);
    }
    Ok(body.to_string())
}

fn member<S>(store: &S, event: &Event, id: &str) -> Result<Participant, ExchangeError>
where
    S: ParticipantStore + ?Sized,
{
    store
        .get(&event.id, id)
        .ok_or_else(|| ExchangeError::UnknownParticipant(id.to_string()))
}

/// One line of the organizer's roster table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRow {
    pub participant: ParticipantCard,
    pub shipping_to: Option<ParticipantCard>,
    pub receiving_from: Option<ParticipantCard>,
}

pub fn roster_overview<S>(store: &S, event: &str) -> Vec<RosterRow>
where
    S: ParticipantStore + ?Sized,
{
    let roster = store.roster(event);
    let find = |id: &str| roster.iter().find(|p| p.id == id).map(ParticipantCard::from);

    roster
        .iter()
        .map(|p| RosterRow {
            participant: ParticipantCard::from(p),
            shipping_to: p.shipping_to.as_deref().and_then(find),
            receiving_from: roster
                .iter()
                .find(|s| s.shipping_to.as_deref() == Some(p.id.as_str()))
                .map(ParticipantCard::from),
        })
        .collect()
}
