//! Meta verification against a [`Specification`].
//!
//! Field errors are collected, never raised: a single pass reports every
//! missing or mistyped key. Only a structurally impossible comparison fails
//! with a [`SpecificationError`].

use serde::Serialize;
use serde_json::Value;

use super::{Meta, MetaType, SpecField, Specification};
use crate::error::SpecificationError;

/// One violated specification key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaFieldError {
    pub required_key: String,
    pub required_types: Vec<MetaType>,

    /// `None` when the key was missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presented_type: Option<MetaType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presented_value: Option<Value>,
}

impl MetaFieldError {
    pub fn missing(key: impl Into<String>, required_types: Vec<MetaType>) -> Self {
        Self {
            required_key: key.into(),
            required_types,
            presented_type: None,
            presented_value: None,
        }
    }

    pub fn mismatch(key: impl Into<String>, required_types: Vec<MetaType>, value: &Value) -> Self {
        Self {
            required_key: key.into(),
            required_types,
            presented_type: Some(MetaType::of(value)),
            presented_value: Some(value.clone()),
        }
    }

    pub fn is_missing(&self) -> bool {
        self.presented_type.is_none()
    }
}

/// An entry of a [`MetaVerification`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VerificationEntry {
    Field(MetaFieldError),
    /// Errors found inside the map stored under `key`. Kept as a sub-tree.
    Nested {
        key: String,
        verification: MetaVerification,
    },
}

/// Result of verifying meta against a specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetaVerification {
    errors: Vec<VerificationEntry>,
}

impl MetaVerification {
    pub fn new(errors: Vec<VerificationEntry>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[VerificationEntry] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `true` when nothing was reported, checked recursively: a nested entry
    /// only counts as a failure if it holds errors itself.
    pub fn checked_success(&self) -> bool {
        self.errors.iter().all(|entry| match entry {
            VerificationEntry::Field(_) => false,
            VerificationEntry::Nested { verification, .. } => verification.checked_success(),
        })
    }

    /// Every field error in the tree, with its dotted key path.
    pub fn flatten(&self) -> Vec<(String, &MetaFieldError)> {
        let mut out = Vec::new();
        self.collect_into("", &mut out);
        out
    }

    fn collect_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a MetaFieldError)>) {
        for entry in &self.errors {
            match entry {
                VerificationEntry::Field(err) => {
                    out.push((format!("{prefix}{}", err.required_key), err));
                }
                VerificationEntry::Nested { key, verification } => {
                    verification.collect_into(&format!("{prefix}{key}."), out);
                }
            }
        }
    }

    /// Verify `meta` against `specification`.
    ///
    /// Only keys named by the specification are inspected; extra meta keys are
    /// ignored. The specification is validated as a whole first, whatever the
    /// meta holds.
    pub fn verify(meta: &Meta, specification: &Specification) -> Result<Self, SpecificationError> {
        specification.validate()?;
        verify_value(meta.as_value(), specification)
    }
}

fn verify_value(meta: &Value, specification: &Specification) -> Result<MetaVerification, SpecificationError> {
    let Some(map) = meta.as_object() else {
        return Err(SpecificationError::NotIndexable {
            found: MetaType::of(meta),
        });
    };

    let mut errors = Vec::new();
    for (key, field) in specification.fields() {
        let Some(value) = map.get(key) else {
            errors.push(VerificationEntry::Field(MetaFieldError::missing(
                key,
                field.required_types(),
            )));
            continue;
        };

        match field {
            SpecField::Type(ty) => {
                if !ty.matches(value) {
                    errors.push(VerificationEntry::Field(MetaFieldError::mismatch(
                        key,
                        vec![*ty],
                        value,
                    )));
                }
            }
            SpecField::OneOf(types) => {
                if !types.iter().any(|ty| ty.matches(value)) {
                    errors.push(VerificationEntry::Field(MetaFieldError::mismatch(
                        key,
                        types.clone(),
                        value,
                    )));
                }
            }
            SpecField::Nested(nested) => {
                // a scalar where a map is expected is bad input, not a bad spec
                if !value.is_object() {
                    errors.push(VerificationEntry::Field(MetaFieldError::mismatch(
                        key,
                        vec![MetaType::Object],
                        value,
                    )));
                    continue;
                }
                let verification = verify_value(value, nested)?;
                if !verification.is_empty() {
                    errors.push(VerificationEntry::Nested {
                        key: key.to_string(),
                        verification,
                    });
                }
            }
        }
    }

    Ok(MetaVerification::new(errors))
}
