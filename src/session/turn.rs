use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::epoch::Epoch;

/// One exchange of user speech and agent reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Recognized user speech
    pub user_text: String,

    /// Generated agent reply
    pub agent_text: String,

    /// When the turn was committed
    pub timestamp: DateTime<Utc>,

    /// Request the turn answers
    pub epoch: Epoch,
}

impl ConversationTurn {
    /// Build a turn; `None` when both sides are empty
    pub fn new(user_text: String, agent_text: String, epoch: Epoch) -> Option<Self> {
        if user_text.is_empty() && agent_text.is_empty() {
            return None;
        }

        Some(Self {
            user_text,
            agent_text,
            timestamp: Utc::now(),
            epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_turn_is_not_built() {
        assert!(ConversationTurn::new(String::new(), String::new(), Epoch::ZERO).is_none());
    }

    #[test]
    fn one_side_is_enough() {
        let turn = ConversationTurn::new("hi".into(), String::new(), Epoch::ZERO.next()).unwrap();
        assert_eq!(turn.user_text, "hi");
        assert_eq!(turn.epoch.value(), 1);
    }
}
