//! The ordered exchange with the model.

use serde::Serialize;

use crate::types::{ActionResult, ModelPart, ModelTurn};

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    /// A goal or an operator command, optionally with the page as it looks now.
    User {
        text: String,
        screenshot: Option<Vec<u8>>,
    },
    Model(ModelTurn),
    /// Results for every call of the preceding model turn, in call order.
    ActionResults {
        results: Vec<(String, ActionResult)>,
        url: String,
        screenshot: Vec<u8>,
    },
}

impl Turn {
    pub fn role(&self) -> &'static str {
        match self {
            Turn::User { .. } | Turn::ActionResults { .. } => "user",
            Turn::Model(_) => "model",
        }
    }

    fn texts(&self) -> Vec<String> {
        match self {
            Turn::User { text, .. } => vec![text.clone()],
            Turn::Model(turn) => turn
                .parts
                .iter()
                .filter_map(|p| match p {
                    ModelPart::Text(t) => Some(t.clone()),
                    ModelPart::Call(call) => Some(format!("[call {}]", call.name)),
                    ModelPart::Other(_) => None,
                })
                .collect(),
            Turn::ActionResults { results, .. } => results
                .iter()
                .map(|(name, result)| match result.error_message() {
                    Some(err) => format!("[{name}: error {err}]"),
                    None => format!("[{name}: ok]"),
                })
                .collect(),
        }
    }
}

/// Compact view of one turn for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnPreview {
    pub role: &'static str,
    pub texts: Vec<String>,
}

/// Grows by appending only; [`Conversation::reset`] is the single exception.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn seeded(goal: &str, screenshot: Option<Vec<u8>>) -> Self {
        let mut conversation = Self::default();
        conversation.reset(goal, screenshot);
        conversation
    }

    /// Drop every turn and start over from a single goal turn.
    pub fn reset(&mut self, goal: &str, screenshot: Option<Vec<u8>>) {
        self.turns.clear();
        self.turns.push(Turn::User {
            text: goal.to_string(),
            screenshot,
        });
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn push_command(&mut self, command: &str) {
        self.push(Turn::User {
            text: command.to_string(),
            screenshot: None,
        });
    }

    /// Removes the last turn if it is a model turn.
    pub fn pop_model_turn(&mut self) -> Option<ModelTurn> {
        match self.turns.last() {
            Some(Turn::Model(_)) => match self.turns.pop() {
                Some(Turn::Model(turn)) => Some(turn),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Texts of the last `n` turns, oldest first.
    pub fn preview(&self, n: usize) -> Vec<TurnPreview> {
        let start = self.turns.len().saturating_sub(n);
        self.turns[start..]
            .iter()
            .map(|turn| TurnPreview {
                role: turn.role(),
                texts: turn.texts(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionCall;
    use serde_json::json;

    #[test]
    fn reset_leaves_a_single_goal_turn() {
        let mut c = Conversation::seeded("first", Some(vec![1]));
        c.push(Turn::Model(ModelTurn::text("ok")));
        c.push_command("also this");
        assert_eq!(c.len(), 3);

        c.reset("second", Some(vec![2]));
        assert_eq!(c.len(), 1);
        assert_eq!(
            c.turns()[0],
            Turn::User {
                text: "second".into(),
                screenshot: Some(vec![2])
            }
        );
    }

    #[test]
    fn only_a_trailing_model_turn_is_popped() {
        let mut c = Conversation::seeded("goal", None);
        assert!(c.pop_model_turn().is_none());
        c.push(Turn::Model(ModelTurn::text("x")));
        assert_eq!(c.pop_model_turn(), Some(ModelTurn::text("x")));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn preview_keeps_last_turns_with_roles() {
        let mut c = Conversation::seeded("goal", None);
        c.push(Turn::Model(ModelTurn::calls([ActionCall::new(
            "navigate",
            json!({"url": "a.com"}),
        )])));
        c.push(Turn::ActionResults {
            results: vec![("navigate".into(), ActionResult::error("missing url"))],
            url: "about:blank".into(),
            screenshot: vec![],
        });

        let preview = c.preview(2);
        assert_eq!(preview.len(), 2);
        assert_eq!(preview[0].role, "model");
        assert_eq!(preview[0].texts, vec!["[call navigate]"]);
        assert_eq!(preview[1].role, "user");
        assert_eq!(preview[1].texts, vec!["[navigate: error missing url]"]);
        assert_eq!(c.preview(10).len(), 3);
    }
}
