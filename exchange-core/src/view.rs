//! What a viewer gets to see, given the event's stage and their own record.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::country::country_name;
use crate::{Participant, ParticipantId, ParticipantStore, Stage};

/// The public part of a participant record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantCard {
    pub id: ParticipantId,
    pub display_name: String,
    pub shipping_address: String,
    pub shipping_country: String,
    pub country_name: Option<String>,
}

impl From<&Participant> for ParticipantCard {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id.clone(),
            display_name: p.display_name.clone(),
            shipping_address: p.shipping_address.clone(),
            shipping_country: p.shipping_country.clone(),
            country_name: country_name(&p.shipping_country).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupDefaults {
    pub display_name: Option<String>,
    pub shipping_address: Option<String>,
    pub shipping_country: Option<String>,
}

impl From<&Participant> for SignupDefaults {
    fn from(p: &Participant) -> Self {
        Self {
            display_name: Some(p.display_name.clone()),
            shipping_address: Some(p.shipping_address.clone()),
            shipping_country: Some(p.shipping_country.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormMode {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePermissions {
    pub to_recipient: bool,
    pub to_sender: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum StageView {
    PromptLogin,
    ShowSignupForm {
        mode: FormMode,
        defaults: SignupDefaults,
    },
    AlreadySignedUp,
    NotSignedUp,
    ShowShipping {
        recipient: ParticipantCard,
        messages: MessagePermissions,
    },
    ShowReveal {
        sender: ParticipantCard,
        recipient: ParticipantCard,
    },
    /// The viewer is signed up but a link they need is missing or dangling.
    AssignmentUnavailable,
    InvalidStage {
        code: i64,
    },
}

/// Computes the view for `viewer` (`None` when not logged in).
///
/// Never fails: an unknown stage yields [`StageView::InvalidStage`] without
/// touching the store, and missing links yield
/// [`StageView::AssignmentUnavailable`].
pub fn stage_view<S>(stage: Stage, viewer: Option<&str>, event: &str, store: &S) -> StageView
where
    S: ParticipantStore + ?Sized,
{
    if let Stage::Invalid(code) = stage {
        debug!(event, code, "view requested for invalid stage");
        return StageView::InvalidStage { code };
    }
    let Some(viewer) = viewer else {
        return StageView::PromptLogin;
    };
    let me = store.get(event, viewer);

    match (stage, me) {
        (Stage::Signup, None) => StageView::ShowSignupForm {
            mode: FormMode::Create,
            defaults: SignupDefaults::default(),
        },
        (Stage::Signup, Some(me)) => StageView::ShowSignupForm {
            mode: FormMode::Update,
            defaults: SignupDefaults::from(&me),
        },
        (Stage::Pending, Some(_)) => StageView::AlreadySignedUp,
        (Stage::Shipping, Some(me)) => {
            let Some(recipient) = recipient_of(&me, event, store) else {
                return StageView::AssignmentUnavailable;
            };
            let has_sender = store.find_sender_of(event, &me.id).is_some();
            StageView::ShowShipping {
                recipient: ParticipantCard::from(&recipient),
                messages: MessagePermissions {
                    to_recipient: true,
                    to_sender: has_sender,
                },
            }
        }
        (Stage::Reveal, Some(me)) => {
            let recipient = recipient_of(&me, event, store);
            let sender = store.find_sender_of(event, &me.id);
            match (sender, recipient) {
                (Some(sender), Some(recipient)) => StageView::ShowReveal {
                    sender: ParticipantCard::from(&sender),
                    recipient: ParticipantCard::from(&recipient),
                },
                _ => StageView::AssignmentUnavailable,
            }
        }
        (Stage::Pending | Stage::Shipping | Stage::Reveal, None) => StageView::NotSignedUp,
        (Stage::Invalid(code), _) => StageView::InvalidStage { code },
    }
}

fn recipient_of<S>(me: &Participant, event: &str, store: &S) -> Option<Participant>
where
    S: ParticipantStore + ?Sized,
{
    let target = me.shipping_to.as_deref()?;
    store.get(event, target)
}
