//! # Resource Catalog
//!
//! YAML-backed `ResourceProvider`. A resources directory holds:
//! - `strings.yaml` / `strings-<locale>.yaml`: id -> string or list of strings
//! - `models.yaml` / `models-<locale>.yaml`: model id -> form definition
//!
//! Unsuffixed files form the base table; a locale file overlays it entry by entry.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::domain::errors::ResourceError;
use crate::domain::model::ModelDefinition;
use crate::domain::traits::ResourceProvider;

const STRINGS_STEM: &str = "strings";
const MODELS_STEM: &str = "models";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Entry {
    Single(String),
    Array(Vec<String>),
}

/// Base table plus per-locale overlays.
#[derive(Debug)]
struct Layered<T> {
    base: HashMap<String, T>,
    locales: HashMap<String, HashMap<String, T>>,
}

impl<T> Default for Layered<T> {
    fn default() -> Self {
        Self {
            base: HashMap::new(),
            locales: HashMap::new(),
        }
    }
}

impl<T> Layered<T> {
    fn extend(&mut self, locale: Option<&str>, entries: HashMap<String, T>) {
        let table = match locale {
            Some(locale) => self.locales.entry(locale.to_string()).or_default(),
            None => &mut self.base,
        };
        table.extend(entries);
    }

    fn lookup(&self, locale: &str, id: &str) -> Result<&T, ResourceError> {
        self.locales
            .get(locale)
            .and_then(|table| table.get(id))
            .or_else(|| self.base.get(id))
            .ok_or_else(|| ResourceError::NotFound {
                id: id.to_string(),
                locale: locale.to_string(),
            })
    }
}

#[derive(Debug, Default)]
pub struct ResourceCatalog {
    strings: Layered<Entry>,
    models: Layered<ModelDefinition>,
}

fn source_name(stem: &str, locale: Option<&str>) -> String {
    match locale {
        Some(locale) => format!("{stem}-{locale}.yaml"),
        None => format!("{stem}.yaml"),
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    stem: &str,
    locale: Option<&str>,
    text: &str,
) -> Result<HashMap<String, T>, ResourceError> {
    // An empty file is an empty table
    if text.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_yaml::from_str(text).map_err(|e| ResourceError::Malformed {
        file: source_name(stem, locale),
        reason: e.to_string(),
    })
}

impl ResourceCatalog {
    pub fn add_strings_yaml(&mut self, locale: Option<&str>, text: &str) -> Result<(), ResourceError> {
        let entries = parse(STRINGS_STEM, locale, text)?;
        self.strings.extend(locale, entries);
        Ok(())
    }

    pub fn add_models_yaml(&mut self, locale: Option<&str>, text: &str) -> Result<(), ResourceError> {
        let entries = parse(MODELS_STEM, locale, text)?;
        self.models.extend(locale, entries);
        Ok(())
    }

    /// Loads every `strings*.yaml` and `models*.yaml` file in `dir`.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut catalog = Self::default();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read resources directory {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".yaml"))
            else {
                continue;
            };
            let (kind, locale) = match stem.split_once('-') {
                Some((kind, locale)) => (kind, Some(locale)),
                None => (stem, None),
            };
            if kind != STRINGS_STEM && kind != MODELS_STEM {
                debug!("Ignoring {}", path.display());
                continue;
            }

            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if kind == STRINGS_STEM {
                catalog.add_strings_yaml(locale, &text)?;
            } else {
                catalog.add_models_yaml(locale, &text)?;
            }
            info!("Loaded resources from {}", path.display());
        }
        Ok(catalog)
    }

    pub fn locales(&self) -> impl Iterator<Item = &str> {
        self.strings
            .locales
            .keys()
            .chain(self.models.locales.keys())
            .map(String::as_str)
    }
}

impl ResourceProvider for ResourceCatalog {
    fn get_string(&self, locale: &str, id: &str) -> Result<String, ResourceError> {
        match self.strings.lookup(locale, id)? {
            Entry::Single(text) => Ok(text.clone()),
            Entry::Array(_) => Err(ResourceError::Malformed {
                file: source_name(STRINGS_STEM, Some(locale)),
                reason: format!("`{id}` is a list, expected a string"),
            }),
        }
    }

    fn get_string_array(&self, locale: &str, id: &str) -> Result<Vec<String>, ResourceError> {
        match self.strings.lookup(locale, id)? {
            Entry::Array(items) => Ok(items.clone()),
            Entry::Single(text) => Ok(vec![text.clone()]),
        }
    }

    fn get_model(&self, locale: &str, id: &str) -> Result<ModelDefinition, ResourceError> {
        self.models.lookup(locale, id).cloned()
    }
}
