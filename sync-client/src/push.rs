//! Push rule evaluation.
//!
//! Events that count as unread are passed through a [`PushRules`]
//! implementation to add notify, highlight and sound bits.
//! [`StaticPushRules`] covers the default rule set plus keyword content
//! rules and the master switch from `m.push_rules` account data.

use serde::Deserialize;
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use larch_sync_types::{Event, LazyLoadSummary, UnreadType, UserId};

/// Push rule update errors.
#[derive(Debug, Error)]
pub enum PushRulesError {
    /// The rules document could not be decoded.
    #[error("malformed push rules: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Push rule collaborator.
pub trait PushRules: Send + Sync {
    /// Refine the base classification of an event sent by someone else.
    fn classify(
        &self,
        base: UnreadType,
        event: &Event,
        summary: Option<&LazyLoadSummary>,
    ) -> UnreadType;

    /// Replace the rule set with new `m.push_rules` content.
    fn update_rules(&self, rules: &Value) -> Result<(), PushRulesError>;
}

const MASTER_RULE: &str = ".m.rule.master";

#[derive(Debug, Default, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    global: RuleSets,
}

#[derive(Debug, Default, Deserialize)]
struct RuleSets {
    #[serde(default)]
    #[serde(rename = "override")]
    overrides: Vec<Rule>,
    #[serde(default)]
    content: Vec<Rule>,
}

#[derive(Debug, Deserialize)]
struct Rule {
    rule_id: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    actions: Vec<Value>,
}

impl Rule {
    fn notifies(&self) -> bool {
        self.actions.iter().any(|a| a.as_str() == Some("notify"))
    }

    fn has_sound(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.get("set_tweak").and_then(Value::as_str) == Some("sound"))
    }
}

#[derive(Debug, Default, Clone)]
struct Keyword {
    pattern: String,
    sound: bool,
}

#[derive(Debug, Default)]
struct RuleState {
    muted: bool,
    keywords: Vec<Keyword>,
}

/// Default rules plus keyword content rules.
///
/// - every counted message notifies
/// - one-to-one rooms also play a sound
/// - mentioning our user id, or a keyword, highlights with sound
/// - an enabled master rule silences everything
#[derive(Debug)]
pub struct StaticPushRules {
    own_user: UserId,
    state: RwLock<RuleState>,
}

impl StaticPushRules {
    /// Create the default rule set for `own_user`.
    pub fn new(own_user: UserId) -> Self {
        Self {
            own_user,
            state: RwLock::new(RuleState::default()),
        }
    }

    fn body(event: &Event) -> &str {
        event
            .effective_content()
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

impl PushRules for StaticPushRules {
    fn classify(
        &self,
        base: UnreadType,
        event: &Event,
        summary: Option<&LazyLoadSummary>,
    ) -> UnreadType {
        if base.is_none() {
            return base;
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.muted {
            return base;
        }

        let mut unread_type = base | UnreadType::NOTIFY;
        if summary.is_some_and(|s| s.member_count() == 2) {
            unread_type |= UnreadType::SOUND;
        }

        let body = Self::body(event).to_lowercase();
        if body.contains(&self.own_user.as_str().to_lowercase()) {
            unread_type |= UnreadType::HIGHLIGHT | UnreadType::SOUND;
        }
        for keyword in &state.keywords {
            if body.contains(&keyword.pattern) {
                unread_type |= UnreadType::HIGHLIGHT;
                if keyword.sound {
                    unread_type |= UnreadType::SOUND;
                }
            }
        }
        unread_type
    }

    fn update_rules(&self, rules: &Value) -> Result<(), PushRulesError> {
        let document = RulesDocument::deserialize(rules)?;
        let muted = document
            .global
            .overrides
            .iter()
            .any(|rule| rule.rule_id == MASTER_RULE && rule.enabled);
        let keywords = document
            .global
            .content
            .iter()
            .filter(|rule| rule.enabled && rule.notifies())
            .filter_map(|rule| {
                let pattern = rule.pattern.as_deref()?.trim_matches('*').to_lowercase();
                (!pattern.is_empty()).then(|| Keyword {
                    pattern,
                    sound: rule.has_sound(),
                })
            })
            .collect();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = RuleState { muted, keywords };
        Ok(())
    }
}
