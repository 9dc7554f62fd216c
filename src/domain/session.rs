//! # Conversation Session
//!
//! Per-conversation durable state: free user values, the wizard's form bag and a typed control
//! record (holding counter, remembered command, redirect flag, wizard position).
//! The three are kept apart so user data can never overwrite a control key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::model::FillMode;
use crate::domain::types::{ChatId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum SessionValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

static NULL: SessionValue = SessionValue::Null;

impl SessionValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SessionValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SessionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SessionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SessionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SessionValue::Null => serde_json::Value::Null,
            SessionValue::Bool(b) => serde_json::Value::Bool(*b),
            SessionValue::Int(i) => serde_json::Value::from(*i),
            SessionValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for SessionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionValue::Null => write!(f, "null"),
            SessionValue::Bool(b) => write!(f, "{b}"),
            SessionValue::Int(i) => write!(f, "{i}"),
            SessionValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for SessionValue {
    fn from(value: &str) -> Self {
        SessionValue::Str(value.to_string())
    }
}

impl From<String> for SessionValue {
    fn from(value: String) -> Self {
        SessionValue::Str(value)
    }
}

impl From<i64> for SessionValue {
    fn from(value: i64) -> Self {
        SessionValue::Int(value)
    }
}

impl From<bool> for SessionValue {
    fn from(value: bool) -> Self {
        SessionValue::Bool(value)
    }
}

impl<T: Into<SessionValue>> From<Option<T>> for SessionValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// How many upcoming updates bypass command parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Holding {
    #[default]
    Idle,
    Remaining(u32),
    Forever,
}

impl Holding {
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            Holding::Idle
        } else {
            Holding::Remaining(count)
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Holding::Idle)
    }

    /// Consumes one held update. `Forever` never runs out.
    pub fn decrement(&mut self) {
        if let Holding::Remaining(n) = *self {
            *self = Holding::from_count(n.saturating_sub(1));
        }
    }

    /// Remaining count; `None` for `Forever`.
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Holding::Idle => Some(0),
            Holding::Remaining(n) => Some(*n),
            Holding::Forever => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardState {
    Init,
    PropSet,
    Edit,
    Review,
    Send,
    Cancel,
}

/// Within a state: render the prompt, or consume the user's answer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStage {
    ShowHint,
    EnterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WizardControl {
    /// Model id of the active form.
    pub form: String,
    pub state: WizardState,
    pub stage: WizardStage,
    pub property_index: usize,
    pub fill_mode: FillMode,
    /// Advisory text appended to the next review rendering.
    #[serde(default)]
    pub notice: Option<String>,
}

impl WizardControl {
    pub fn new(form: impl Into<String>) -> Self {
        Self {
            form: form.into(),
            state: WizardState::Init,
            stage: WizardStage::ShowHint,
            property_index: 0,
            fill_mode: FillMode::Auto,
            notice: None,
        }
    }

    pub fn goto(&mut self, state: WizardState, stage: WizardStage) {
        self.state = state;
        self.stage = stage;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ControlState {
    #[serde(default)]
    pub holding: Holding,
    #[serde(default)]
    pub remembered_command: Option<String>,
    /// Set while the chain is re-run because of a redirect.
    #[serde(default)]
    pub redirected: bool,
    #[serde(default)]
    pub wizard: Option<WizardControl>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: ChatId,
    #[serde(default)]
    pub user: Option<UserId>,
    #[serde(default)]
    pub control: ControlState,
    #[serde(default)]
    values: BTreeMap<String, SessionValue>,
    #[serde(default)]
    form: BTreeMap<String, SessionValue>,
}

impl Session {
    pub fn new(id: ChatId, user: Option<UserId>) -> Self {
        Self {
            id,
            user,
            control: ControlState::default(),
            values: BTreeMap::new(),
            form: BTreeMap::new(),
        }
    }

    /// Missing keys read as `Null`.
    pub fn get(&self, key: &str) -> &SessionValue {
        self.values.get(key).unwrap_or(&NULL)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SessionValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<SessionValue> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Drops every value and all control state. The conversation's locale survives.
    pub fn clear(&mut self) {
        let locale = self.control.locale.take();
        self.values.clear();
        self.form.clear();
        self.control = ControlState {
            locale,
            ..ControlState::default()
        };
    }

    pub fn form_value(&self, property: &str) -> &SessionValue {
        self.form.get(property).unwrap_or(&NULL)
    }

    pub fn set_form_value(&mut self, property: impl Into<String>, value: SessionValue) {
        self.form.insert(property.into(), value);
    }

    pub fn form_values(&self) -> &BTreeMap<String, SessionValue> {
        &self.form
    }

    pub fn clear_form(&mut self) {
        self.form.clear();
        self.control.wizard = None;
    }

    pub fn wizard(&self) -> Option<&WizardControl> {
        self.control.wizard.as_ref()
    }

    pub fn wizard_mut(&mut self) -> Option<&mut WizardControl> {
        self.control.wizard.as_mut()
    }

    /// No wizard running and nothing held: the next update starts from scratch.
    pub fn is_idle(&self) -> bool {
        self.control.wizard.is_none() && !self.control.holding.is_active()
    }

    pub fn locale_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.control.locale.as_deref().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut session = Session::new(ChatId(1), None);
        session.set("category", "Clubs");
        session.set("attempts", 3i64);
        assert_eq!(session.get("category").as_str(), Some("Clubs"));
        assert_eq!(session.get("attempts").as_i64(), Some(3));

        assert_eq!(session.remove("category"), Some(SessionValue::from("Clubs")));
        assert!(session.get("category").is_null());
        assert!(session.get("never-set").is_null());
    }

    #[test]
    fn test_keys_exclude_control_and_form() {
        let mut session = Session::new(ChatId(1), None);
        session.set("a", true);
        session.set_form_value("title", SessionValue::from("door"));
        session.control.holding = Holding::Remaining(2);
        session.control.remembered_command = Some("new_request".to_string());

        let keys: Vec<_> = session.keys().collect();
        assert_eq!(keys, ["a"]);
    }

    #[test]
    fn test_clear_keeps_locale() {
        let mut session = Session::new(ChatId(1), Some(UserId(5)));
        session.control.locale = Some("ru".to_string());
        session.control.holding = Holding::Forever;
        session.control.wizard = Some(WizardControl::new("new_request"));
        session.set("x", 1i64);
        session.set_form_value("title", SessionValue::from("door"));

        session.clear();
        assert_eq!(session.keys().count(), 0);
        assert!(session.form_values().is_empty());
        assert!(session.wizard().is_none());
        assert_eq!(session.control.holding, Holding::Idle);
        assert_eq!(session.control.locale.as_deref(), Some("ru"));
        assert_eq!(session.user, Some(UserId(5)));
    }

    #[test]
    fn test_idle_means_no_wizard_and_no_holding() {
        let mut session = Session::new(ChatId(1), None);
        assert!(session.is_idle());
        session.control.holding = Holding::Remaining(1);
        assert!(!session.is_idle());
        session.control.holding = Holding::Idle;
        session.control.wizard = Some(WizardControl::new("request"));
        assert!(!session.is_idle());
        session.clear_form();
        assert!(session.is_idle());
    }

    #[test]
    fn test_holding_decrement() {
        let mut holding = Holding::from_count(2);
        holding.decrement();
        assert_eq!(holding, Holding::Remaining(1));
        holding.decrement();
        assert_eq!(holding, Holding::Idle);
        holding.decrement();
        assert_eq!(holding, Holding::Idle);

        let mut forever = Holding::Forever;
        forever.decrement();
        assert!(forever.is_active());
        assert_eq!(forever.remaining(), None);
    }

    #[test]
    fn test_blob_round_trip() {
        let mut session = Session::new(ChatId(9), Some(UserId(3)));
        session.set("name", "x");
        session.set("maybe", SessionValue::Null);
        session.control.holding = Holding::Remaining(1);
        session.control.wizard = Some(WizardControl::new("new_request"));

        let blob = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&blob).unwrap();
        assert_eq!(restored, session);
    }
}
