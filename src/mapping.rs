//! Per-destination field mappings for the bulk-load path.
//!
//! During a full load each destination evaluates one expression per field
//! against a scanned source record to produce the destination identity and
//! payload. A primary-key field that evaluates to empty skips the record for
//! that destination — a data condition, not an error.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::{Attributes, Identity};

/// Expression producing one destination field value from a source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldExpr {
    /// First value of a source attribute.
    Attribute(String),
    /// A literal value.
    Constant(String),
    /// Concatenation of sub-expressions; empty if any part is empty.
    Concat(Vec<FieldExpr>),
}

impl FieldExpr {
    /// Evaluate against a source record's attributes.
    ///
    /// Returns `None` when a referenced attribute is absent or blank.
    pub fn evaluate(&self, attributes: &Attributes) -> Option<String> {
        match self {
            FieldExpr::Attribute(name) => attributes
                .get_value(name)
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.to_string()),
            FieldExpr::Constant(value) => Some(value.clone()),
            FieldExpr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&part.evaluate(attributes)?);
                }
                Some(out)
            }
        }
    }
}

/// One destination field and the expression that fills it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub name: String,
    /// Primary-key fields form the destination identity.
    #[serde(default)]
    pub primary: bool,
    pub expr: FieldExpr,
}

impl FieldMapping {
    pub fn new(name: impl Into<String>, primary: bool, expr: FieldExpr) -> Self {
        Self {
            name: name.into(),
            primary,
            expr,
        }
    }

    /// Shorthand for a field copied 1:1 from a source attribute.
    pub fn copied(name: impl Into<String>, primary: bool) -> Self {
        let name = name.into();
        let expr = FieldExpr::Attribute(name.clone());
        Self {
            name,
            primary,
            expr,
        }
    }
}

/// The ordered field list of one destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationMapping {
    pub fields: Vec<FieldMapping>,
}

impl DestinationMapping {
    pub fn new(fields: Vec<FieldMapping>) -> Self {
        Self { fields }
    }

    /// Fields forming the destination identity, in declaration order.
    pub fn primary_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|f| f.primary)
    }

    /// Project a source record into (identity, attributes) for this destination.
    ///
    /// Returns `None` — skip this record for this destination — when any
    /// primary-key field evaluates empty. Non-primary fields that evaluate
    /// empty are simply left out of the payload.
    pub fn project(&self, attributes: &Attributes) -> Option<(Identity, Attributes)> {
        let mut key = Vec::new();
        let mut out = Attributes::new();

        for field in &self.fields {
            match field.expr.evaluate(attributes) {
                Some(value) => {
                    if field.primary {
                        key.push((field.name.clone(), value.clone()));
                    }
                    out.set(field.name.clone(), value);
                }
                None if field.primary => {
                    debug!(field = %field.name, "Primary-key field empty, skipping record");
                    return None;
                }
                None => {}
            }
        }

        if key.is_empty() {
            debug!("Mapping has no primary-key fields, skipping record");
            return None;
        }

        Some((Identity::new(key), out))
    }
}
