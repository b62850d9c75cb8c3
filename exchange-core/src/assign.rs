use std::collections::{BTreeMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ExchangeError, Participant, ParticipantId, MIN_PARTICIPANTS};

/// Who ships to whom, keyed by giver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignment {
    links: BTreeMap<ParticipantId, ParticipantId>,
}

impl Assignment {
    pub fn from_links(links: BTreeMap<ParticipantId, ParticipantId>) -> Self {
        Self { links }
    }

    pub fn recipient_of(&self, giver: &str) -> Option<&str> {
        self.links.get(giver).map(String::as_str)
    }

    /// Reverse lookup: who ships to `recipient`.
    pub fn sender_of(&self, recipient: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|(_, to)| to.as_str() == recipient)
            .map(|(from, _)| from.as_str())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.links.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    /// Number of disjoint cycles. A fresh draw always has exactly one.
    pub fn cycle_count(&self) -> usize {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut cycles = 0;
        for start in self.links.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            cycles += 1;
            let mut current = Some(start.as_str());
            while let Some(id) = current {
                if !visited.insert(id) {
                    break;
                }
                current = self.recipient_of(id);
            }
        }
        cycles
    }

    /// Checks that every roster member ships to exactly one other member and
    /// receives from exactly one.
    pub fn validate(&self, roster: &[Participant]) -> Result<(), ExchangeError> {
        let ids = unique_ids(roster)?;
        if ids.len() < MIN_PARTICIPANTS {
            return Err(ExchangeError::InsufficientParticipants { found: ids.len() });
        }
        if self.links.len() != ids.len() {
            return Err(ExchangeError::InvalidAssignment(format!(
                "{} links for {} participants",
                self.links.len(),
                ids.len()
            )));
        }

        let mut received: HashSet<&str> = HashSet::new();
        for (giver, recipient) in &self.links {
            if !ids.contains(giver.as_str()) {
                return Err(ExchangeError::InvalidAssignment(format!(
                    "{giver} is not in the roster"
                )));
            }
            if giver == recipient {
                return Err(ExchangeError::InvalidAssignment(format!(
                    "{giver} ships to themselves"
                )));
            }
            if !ids.contains(recipient.as_str()) {
                return Err(ExchangeError::InvalidAssignment(format!(
                    "{giver} ships to {recipient}, who is not in the roster"
                )));
            }
            if !received.insert(recipient.as_str()) {
                return Err(ExchangeError::InvalidAssignment(format!(
                    "{recipient} receives more than one gift"
                )));
            }
        }
        Ok(())
    }
}

fn unique_ids(roster: &[Participant]) -> Result<HashSet<&str>, ExchangeError> {
    let mut ids = HashSet::with_capacity(roster.len());
    for participant in roster {
        if !ids.insert(participant.id.as_str()) {
            return Err(ExchangeError::DuplicateParticipant(participant.id.clone()));
        }
    }
    Ok(ids)
}

/// Draws a fresh assignment for the whole roster.
///
/// The roster is shuffled uniformly and every participant ships to the one
/// before them in the shuffled order, the first wrapping to the last. That
/// forms a single cycle through everybody, so nobody draws themselves and,
/// with three or more people, nobody ships to their own giver.
///
/// Any `shipping_to` already present on the roster is ignored.
pub fn assign<R>(roster: &[Participant], rng: &mut R) -> Result<Assignment, ExchangeError>
where
    R: Rng + ?Sized,
{
    if roster.len() < MIN_PARTICIPANTS {
        return Err(ExchangeError::InsufficientParticipants {
            found: roster.len(),
        });
    }
    unique_ids(roster)?;

    let mut shuffled: Vec<&ParticipantId> = roster.iter().map(|p| &p.id).collect();
    shuffled.shuffle(rng);

    let n = shuffled.len();
    let links = shuffled
        .iter()
        .enumerate()
        .map(|(i, giver)| ((*giver).clone(), shuffled[(i + n - 1) % n].clone()))
        .collect();

    debug!(participants = n, "drew assignment");
    Ok(Assignment { links })
}
