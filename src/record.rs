// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The normalized change record and its supporting data model.
//!
//! Every feed strategy reduces its raw rows to [`ChangeRecord`]s before the
//! replay loop sees them, so the engine never knows whether a change came
//! from an LDAP changelog, a JDBC change table, or an incremental-replication
//! control.
//!
//! # Positions
//!
//! A [`Position`] is the durable "last processed" marker for one
//! (source, destination) pair. Numbered changelogs use
//! [`Position::Number`]; incremental-replication sources hand back an opaque
//! resumption cookie ([`Position::Cookie`]). Positions of different kinds are
//! not comparable — `partial_cmp` returns `None` across kinds, and the
//! tracker's monotonic guard only applies to numbered positions.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-processed marker for a change feed.
///
/// Opaque to the engine apart from ordering; scoped to one
/// (source, destination) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    /// A changelog change number.
    Number(u64),
    /// An opaque resumption cookie issued by the source.
    Cookie(Vec<u8>),
}

impl Position {
    /// The numeric change number, if this is a numbered position.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Position::Number(n) => Some(*n),
            Position::Cookie(_) => None,
        }
    }
}

impl PartialOrd for Position {
    /// Positions of different kinds are not comparable.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Position::Number(a), Position::Number(b)) => Some(a.cmp(b)),
            (Position::Cookie(a), Position::Cookie(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Number(n) => write!(f, "{}", n),
            Position::Cookie(bytes) => write!(f, "cookie({} bytes)", bytes.len()),
        }
    }
}

/// Structured key uniquely addressing one destination record.
///
/// An ordered list of primary-key field values, rendered and parsed in the
/// directory-style `field=value,field=value` form. Ordering is significant:
/// `uid=a,ou=people` and `ou=people,uid=a` are different identities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(Vec<(String, String)>);

impl Identity {
    /// Build an identity from ordered (field, value) pairs.
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Identity(pairs)
    }

    /// Convenience constructor for a single-field key.
    pub fn single(field: impl Into<String>, value: impl Into<String>) -> Self {
        Identity(vec![(field.into(), value.into())])
    }

    /// Parse the `field=value,field=value` form.
    ///
    /// Returns `None` for empty input or a component without `=`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let mut pairs = Vec::new();
        for component in s.split(',') {
            let (field, value) = component.split_once('=')?;
            pairs.push((field.trim().to_string(), value.trim().to_string()));
        }
        Some(Identity(pairs))
    }

    /// The ordered (field, value) pairs.
    pub fn fields(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this identity is `base` itself or sits below it.
    ///
    /// Suffix match on the ordered pairs, mirroring directory subtree scope:
    /// `uid=a,ou=people` is under `ou=people`.
    pub fn is_under(&self, base: &Identity) -> bool {
        if base.0.is_empty() {
            return true;
        }
        if base.0.len() > self.0.len() {
            return false;
        }
        let offset = self.0.len() - base.0.len();
        self.0[offset..] == base.0[..]
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        Ok(())
    }
}

/// Multi-valued attribute set, ordered by attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, Vec<String>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), vec![value.into()]);
    }

    /// Append a value to `name`, creating the attribute if absent.
    pub fn add_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.entry(name.into()).or_default().push(value.into());
    }

    /// All values of `name`.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    /// The first value of `name`, if any.
    pub fn get_value(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(|v| v.first()).map(|s| s.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.values.remove(name)
    }

    /// Attribute names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, String)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut attrs = Attributes::new();
        for (name, value) in iter {
            attrs.add_value(name, value);
        }
        attrs
    }
}

/// A single attribute modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub op: ModifyOp,
    pub attribute: String,
    pub values: Vec<String>,
}

impl Modification {
    pub fn new(op: ModifyOp, attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op,
            attribute: attribute.into(),
            values,
        }
    }

    /// Full replacement of one attribute.
    pub fn replace(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(ModifyOp::Replace, attribute, values)
    }
}

/// Modification operation, matching the LDAP changetype vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifyOp {
    Add,
    Replace,
    Delete,
}

impl ModifyOp {
    /// Parse the LDIF operation keyword (`add`, `replace`, `delete`).
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "add" => Some(ModifyOp::Add),
            "replace" => Some(ModifyOp::Replace),
            "delete" => Some(ModifyOp::Delete),
            _ => None,
        }
    }
}

/// Change action tag carried by the feed.
///
/// Tags are case-sensitive: the changelog writes `ADD`, `MODIFY`, `MODRDN`,
/// `DELETE` and nothing else. An absent or unknown tag drops the row (with a
/// debug log) rather than failing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    Add,
    Modify,
    ModRdn,
    Delete,
}

impl ChangeAction {
    /// Parse the case-sensitive changelog tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ADD" => Some(ChangeAction::Add),
            "MODIFY" => Some(ChangeAction::Modify),
            "MODRDN" => Some(ChangeAction::ModRdn),
            "DELETE" => Some(ChangeAction::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Add => "ADD",
            ChangeAction::Modify => "MODIFY",
            ChangeAction::ModRdn => "MODRDN",
            ChangeAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action-specific payload of a change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Full attribute set (ADD, and full-replace feeds).
    Attributes(Attributes),
    /// Modification list (MODIFY).
    Modifications(Vec<Modification>),
    /// The new identity (MODRDN).
    NewIdentity(Identity),
    /// No payload (DELETE).
    None,
}

/// Normalized unit of change, the replay loop's only input.
///
/// `sequence` is monotonically non-decreasing within one feed batch;
/// `identity` uniquely addresses one destination record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: Position,
    pub timestamp: DateTime<Utc>,
    /// The principal that originated the change in the source repository.
    /// Compared against the configured local user for self-change skipping.
    pub actor: String,
    pub action: ChangeAction,
    pub identity: Identity,
    pub payload: Payload,
}

impl ChangeRecord {
    pub fn new(
        sequence: Position,
        timestamp: DateTime<Utc>,
        actor: impl Into<String>,
        action: ChangeAction,
        identity: Identity,
        payload: Payload,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            actor: actor.into(),
            action,
            identity,
            payload,
        }
    }
}

/// Compute the modifications that turn `current` into `desired`.
///
/// Attributes named in `ignored` are excluded from the diff on both sides.
/// Attributes present only in `current` are deleted, attributes present only
/// in `desired` are added, and for common attributes the individual removed
/// and added values become delete/add modifications. An empty return value
/// means the two sets already agree.
pub fn diff_attributes(
    current: &Attributes,
    desired: &Attributes,
    ignored: &std::collections::HashSet<String>,
) -> Vec<Modification> {
    let mut modifications = Vec::new();

    for (name, values) in current.iter() {
        if ignored.contains(name) {
            continue;
        }
        if desired.get(name).is_none() {
            modifications.push(Modification::new(ModifyOp::Delete, name, values.to_vec()));
        }
    }

    for (name, values) in desired.iter() {
        if ignored.contains(name) {
            continue;
        }
        if current.get(name).is_none() {
            modifications.push(Modification::new(ModifyOp::Add, name, values.to_vec()));
        }
    }

    for (name, old_values) in current.iter() {
        if ignored.contains(name) {
            continue;
        }
        let Some(new_values) = desired.get(name) else {
            continue;
        };

        let removed: Vec<String> = old_values
            .iter()
            .filter(|v| !new_values.contains(v))
            .cloned()
            .collect();
        if !removed.is_empty() {
            modifications.push(Modification::new(ModifyOp::Delete, name, removed));
        }

        let added: Vec<String> = new_values
            .iter()
            .filter(|v| !old_values.contains(v))
            .cloned()
            .collect();
        if !added.is_empty() {
            modifications.push(Modification::new(ModifyOp::Add, name, added));
        }
    }

    modifications
}
