//! Specifications: the shape a task expects its meta to have.
//!
//! A specification mirrors a meta tree, but its leaves are type constraints.
//! Fields keep their declaration order, which is also the order errors are
//! reported in.

use serde_json::Value;

use super::MetaType;
use crate::error::SpecificationError;

/// Constraint attached to one specification key.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecField {
    /// Exactly one acceptable type.
    Type(MetaType),
    /// Any of several acceptable types.
    OneOf(Vec<MetaType>),
    /// The value must itself be a map satisfying a nested specification.
    Nested(Specification),
}

impl SpecField {
    /// Types reported in a field error for this constraint.
    pub fn required_types(&self) -> Vec<MetaType> {
        match self {
            SpecField::Type(ty) => vec![*ty],
            SpecField::OneOf(types) => types.clone(),
            SpecField::Nested(_) => vec![MetaType::Object],
        }
    }
}

impl From<MetaType> for SpecField {
    fn from(ty: MetaType) -> Self {
        SpecField::Type(ty)
    }
}

impl From<Specification> for SpecField {
    fn from(spec: Specification) -> Self {
        SpecField::Nested(spec)
    }
}

/// Ordered list of `(key, constraint)` pairs.
///
/// # 使用例
/// ```ignore
/// let spec = Specification::new()
///     .field("x", MetaType::Integer)
///     .one_of("label", [MetaType::String, MetaType::Null])
///     .nested("db", Specification::new().field("host", MetaType::String));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Specification {
    fields: Vec<(String, SpecField)>,
}

impl Specification {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Adds (or replaces) the constraint for `key`.
    pub fn field(mut self, key: impl Into<String>, field: impl Into<SpecField>) -> Self {
        let key = key.into();
        let field = field.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = field,
            None => self.fields.push((key, field)),
        }
        self
    }

    pub fn one_of(self, key: impl Into<String>, types: impl IntoIterator<Item = MetaType>) -> Self {
        self.field(key, SpecField::OneOf(types.into_iter().collect()))
    }

    pub fn nested(self, key: impl Into<String>, spec: Specification) -> Self {
        self.field(key, SpecField::Nested(spec))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &SpecField)> {
        self.fields.iter().map(|(k, f)| (k.as_str(), f))
    }

    pub fn get(&self, key: &str) -> Option<&SpecField> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks the whole tree for constraints no value can satisfy.
    ///
    /// Runs independently of any meta, so a malformed branch is reported even
    /// when the meta never reaches it.
    pub fn validate(&self) -> Result<(), SpecificationError> {
        for (key, field) in self.fields() {
            match field {
                SpecField::OneOf(types) if types.is_empty() => {
                    return Err(SpecificationError::EmptyTypeSet { key: key.to_string() });
                }
                SpecField::Nested(nested) => nested.validate()?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Parses the JSON form of a specification.
    ///
    /// - `"integer"`: a single type name
    /// - `["integer", "string"]`: any of several types
    /// - `{ ... }`: a nested specification
    pub fn from_value(value: &Value) -> Result<Self, SpecificationError> {
        let Some(map) = value.as_object() else {
            return Err(SpecificationError::NotAMap {
                found: MetaType::of(value),
            });
        };

        let mut spec = Specification::new();
        for (key, entry) in map {
            let field = match entry {
                Value::String(_) => SpecField::Type(parse_type(key, entry)?),
                Value::Array(items) => {
                    if items.is_empty() {
                        return Err(SpecificationError::EmptyTypeSet { key: key.clone() });
                    }
                    let types = items
                        .iter()
                        .map(|item| parse_type(key, item))
                        .collect::<Result<Vec<_>, _>>()?;
                    SpecField::OneOf(types)
                }
                Value::Object(_) => SpecField::Nested(Specification::from_value(entry)?),
                other => {
                    return Err(SpecificationError::MalformedField {
                        key: key.clone(),
                        reason: format!("expected a type name, a list or a map, found {}", MetaType::of(other)),
                    });
                }
            };
            spec = spec.field(key.clone(), field);
        }
        Ok(spec)
    }
}

fn parse_type(key: &str, value: &Value) -> Result<MetaType, SpecificationError> {
    serde_json::from_value(value.clone()).map_err(|_| SpecificationError::MalformedField {
        key: key.to_string(),
        reason: format!("unknown type {value}"),
    })
}
