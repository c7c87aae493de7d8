//! Transition engine - validates requested transitions against a machine's
//! transition table.
//!
//! The engine is pure: it decides, the instance store applies.

use crate::definition::TransitionDef;
use crate::error::CoreError;
use crate::history::NewHistoryEntry;

/// Longest comment accepted on a transition, in characters.
pub const MAX_COMMENT_LEN: usize = 200;

/// A validated transition, ready to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from_state: String,
    pub transition: TransitionDef,
    /// History entry to append alongside the state change.
    pub entry: NewHistoryEntry,
}

impl TransitionPlan {
    pub fn to_state(&self) -> &str {
        &self.transition.to
    }
}

/// Validates transitions and computes their outcome.
#[derive(Debug, Clone)]
pub struct TransitionEngine {
    max_comment_len: usize,
}

impl Default for TransitionEngine {
    fn default() -> Self {
        Self {
            max_comment_len: MAX_COMMENT_LEN,
        }
    }
}

impl TransitionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects comments longer than the limit.
    pub fn check_comment(&self, comment: &str) -> Result<(), CoreError> {
        let len = comment.chars().count();
        if len > self.max_comment_len {
            return Err(CoreError::CommentTooLong {
                len,
                max: self.max_comment_len,
            });
        }
        Ok(())
    }

    /// Picks `requested` out of the transitions legal from `current_state`.
    pub fn plan(
        &self,
        current_state: &str,
        legal: Vec<TransitionDef>,
        requested: &str,
        actor: &str,
        comment: &str,
    ) -> Result<TransitionPlan, CoreError> {
        self.check_comment(comment)?;

        let mut matches: Vec<TransitionDef> = legal
            .into_iter()
            .filter(|t| t.from == current_state && t.name == requested)
            .collect();

        let transition = match matches.len() {
            0 => {
                return Err(CoreError::TransitionNotAllowed {
                    state: current_state.to_string(),
                    transition: requested.to_string(),
                })
            }
            1 => matches.remove(0),
            count => {
                tracing::warn!(
                    state = current_state,
                    transition = requested,
                    count,
                    "transition table has duplicate entries"
                );
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "{} transitions named '{}' leave state '{}'",
                        count, requested, current_state
                    ),
                });
            }
        };

        let entry = NewHistoryEntry::transition(&transition.to, requested, actor, comment);

        Ok(TransitionPlan {
            from_state: current_state.to_string(),
            transition,
            entry,
        })
    }
}
