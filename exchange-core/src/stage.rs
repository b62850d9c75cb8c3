//! Event lifecycle: `Signup -> Pending -> Shipping -> Reveal`.
//!
//! Stages only move when an organizer says so. Any numeric value outside
//! `1..=4` is carried as [`Stage::Invalid`] so hosts can store whatever they
//! like without the core ever panicking on it.

use serde::{Deserialize, Serialize};

use crate::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Stage {
    Signup,
    Pending,
    Shipping,
    Reveal,
    /// A code outside `1..=4`. Build it through [`Stage::from_code`]: a
    /// hand-made `Invalid(2)` still refuses every action, but it serializes
    /// as `2` and reads back as [`Stage::Pending`].
    Invalid(i64),
}

/// Things a participant or organizer may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SignUp,
    Assign,
    ViewAssignment,
    MessageRecipient,
    MessageSender,
    Reveal,
    Advance,
}

impl Stage {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Stage::Signup,
            2 => Stage::Pending,
            3 => Stage::Shipping,
            4 => Stage::Reveal,
            other => Stage::Invalid(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Stage::Signup => 1,
            Stage::Pending => 2,
            Stage::Shipping => 3,
            Stage::Reveal => 4,
            Stage::Invalid(code) => code,
        }
    }

    pub fn is_valid(self) -> bool {
        !matches!(self, Stage::Invalid(_))
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Signup => Some(Stage::Pending),
            Stage::Pending => Some(Stage::Shipping),
            Stage::Shipping => Some(Stage::Reveal),
            Stage::Reveal | Stage::Invalid(_) => None,
        }
    }

    pub fn permits(self, action: Action) -> bool {
        use Action::*;
        match self {
            Stage::Signup => matches!(action, SignUp | Advance),
            Stage::Pending => matches!(action, Assign | Advance),
            // Assign stays open so a bad draw can be redone before gifts go out.
            Stage::Shipping => matches!(
                action,
                Assign | ViewAssignment | MessageRecipient | MessageSender | Advance
            ),
            Stage::Reveal => matches!(action, ViewAssignment | Reveal),
            Stage::Invalid(_) => false,
        }
    }
}

impl From<i64> for Stage {
    fn from(code: i64) -> Self {
        Stage::from_code(code)
    }
}

impl From<Stage> for i64 {
    fn from(stage: Stage) -> Self {
        stage.code()
    }
}

/// Fails unless `action` is allowed in `stage`.
pub fn require(stage: Stage, action: Action) -> Result<(), ExchangeError> {
    if let Stage::Invalid(code) = stage {
        return Err(ExchangeError::InvalidStage(code));
    }
    if !stage.permits(action) {
        return Err(ExchangeError::WrongStage { stage, action });
    }
    Ok(())
}

/// Moves one stage forward. There is no way back short of overwriting the stage.
pub fn advance(stage: Stage) -> Result<Stage, ExchangeError> {
    require(stage, Action::Advance)?;
    stage.next().ok_or(ExchangeError::WrongStage {
        stage,
        action: Action::Advance,
    })
}
