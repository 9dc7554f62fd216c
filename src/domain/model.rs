//! # Form Model Definitions
//!
//! Schema of a multi-step form as loaded from `models.yaml`. The form engine consumes it
//! but never owns it; definitions come from the `ResourceProvider` per locale.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[default]
    String,
    Integer,
    Boolean,
    Enumeration,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
            PropertyType::Enumeration => "enumeration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: PropertyType,
    #[serde(default)]
    pub hint: String,
    /// Label used in prompts and the review summary. Falls back to `name`.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub optional: bool,
    /// Inline choices for enumerations.
    #[serde(default)]
    pub choices: Vec<String>,
    /// String-array resource id holding the choices, used when `choices` is empty.
    #[serde(default)]
    pub choices_from: Option<String>,
}

impl PropertyDefinition {
    pub fn label(&self) -> &str {
        self.text.as_deref().unwrap_or(&self.name)
    }
}

fn default_true() -> bool {
    true
}

/// Raw shape of a model entry; properties are split into required/optional on load.
#[derive(Debug, Clone, Deserialize)]
struct RawModelDefinition {
    entry_command: String,
    #[serde(default = "default_true")]
    confirm_send: bool,
    #[serde(default = "default_true")]
    confirm_cancel: bool,
    #[serde(default)]
    fill_mode: FillMode,
    #[serde(default)]
    properties: Vec<PropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawModelDefinition")]
pub struct ModelDefinition {
    pub entry_command: String,
    pub confirm_send: bool,
    pub confirm_cancel: bool,
    pub fill_mode: FillMode,
    pub required: Vec<PropertyDefinition>,
    pub optional: Vec<PropertyDefinition>,
}

impl From<RawModelDefinition> for ModelDefinition {
    fn from(raw: RawModelDefinition) -> Self {
        let (optional, required): (Vec<_>, Vec<_>) =
            raw.properties.into_iter().partition(|p| p.optional);
        Self {
            entry_command: raw.entry_command,
            confirm_send: raw.confirm_send,
            confirm_cancel: raw.confirm_cancel,
            fill_mode: raw.fill_mode,
            required,
            optional,
        }
    }
}

impl ModelDefinition {
    /// Required properties first, then optional ones. Property indexes refer to this order.
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.required.iter().chain(self.optional.iter())
    }

    pub fn property_count(&self) -> usize {
        self.required.len() + self.optional.len()
    }

    pub fn property_at(&self, index: usize) -> Option<&PropertyDefinition> {
        self.properties().nth(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.properties().position(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
entry_command: new_request
confirm_cancel: false
properties:
  - name: title
    hint: Enter a title
  - name: notify
    type: boolean
    optional: true
  - name: category
    type: enumeration
    choices: [Clubs, Events]
"#;

    #[test]
    fn test_properties_split_on_load() {
        let model: ModelDefinition = serde_yaml::from_str(MODEL).unwrap();
        assert_eq!(model.entry_command, "new_request");
        assert!(model.confirm_send);
        assert!(!model.confirm_cancel);
        assert_eq!(model.fill_mode, FillMode::Auto);

        let required: Vec<_> = model.required.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(required, ["title", "category"]);
        assert_eq!(model.optional[0].kind, PropertyType::Boolean);

        // Optional properties index after every required one
        assert_eq!(model.index_of("notify"), Some(2));
        assert_eq!(model.property_at(1).map(|p| p.name.as_str()), Some("category"));
        assert_eq!(model.property_count(), 3);
    }

    #[test]
    fn test_label_falls_back_to_name() {
        let model: ModelDefinition = serde_yaml::from_str(MODEL).unwrap();
        assert_eq!(model.required[0].label(), "title");
    }
}
