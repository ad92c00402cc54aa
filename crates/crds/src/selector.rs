//! Label selectors
//!
//! A self-contained rendition of the Kubernetes label selector with pure
//! in-process evaluation, used both for lease → exporter matching and for
//! access-policy rule evaluation.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A label selector combining exact matches and set-based requirements.
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact key/value requirements
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A single set-based requirement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key the requirement applies to
    pub key: String,

    /// Relation between the key and the values
    pub operator: LabelSelectorOperator,

    /// Values for `In`/`NotIn`; must be empty for `Exists`/`DoesNotExist`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Set-based selector operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    /// Selector with a single exact label requirement.
    pub fn from_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = BTreeMap::new();
        match_labels.insert(key.into(), value.into());
        Self {
            match_labels,
            match_expressions: Vec::new(),
        }
    }

    /// Whether this selector places no constraints at all.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Evaluate the selector against a label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }

        for requirement in &self.match_expressions {
            let found = labels.get(&requirement.key);
            let satisfied = match requirement.operator {
                LabelSelectorOperator::In => {
                    found.is_some_and(|v| requirement.values.iter().any(|w| w == v))
                }
                LabelSelectorOperator::NotIn => {
                    !found.is_some_and(|v| requirement.values.iter().any(|w| w == v))
                }
                LabelSelectorOperator::Exists => found.is_some(),
                LabelSelectorOperator::DoesNotExist => found.is_none(),
            };
            if !satisfied {
                return false;
            }
        }

        true
    }
}
