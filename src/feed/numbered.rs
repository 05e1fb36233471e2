// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Numbered changelog feed.
//!
//! Reads an append-only, monotonically-numbered changelog (LDAP
//! `cn=changelog`, or a JDBC change table of the same shape) and maps each
//! row into a [`ChangeRecord`].
//!
//! # Row Format
//!
//! | Attribute | Meaning |
//! |-----------|---------|
//! | `changeNumber` | ascending sequence number |
//! | `changeTime` | when the change was written (epoch seconds or RFC 3339) |
//! | `changeUser` | principal that originated the change |
//! | `changeAction` | `ADD` / `MODIFY` / `MODRDN` / `DELETE`, case-sensitive |
//! | `targetKey` | identity of the affected record |
//! | `changes` | LDIF-shaped payload (ADD attributes / MODIFY modifications) |
//! | `newKey` | new identity (MODRDN only) |
//!
//! Rows with an absent or unknown `changeAction`, an unparsable
//! `changeNumber`, or an empty `targetKey` are dropped with a debug log —
//! they are data conditions in the changelog, not run failures. A dropped
//! row keeps reappearing in the window until a later applied change moves
//! the tracker past it; the re-drop is idempotent and bounded by the window.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeed, FeedBatch};
use crate::filter::Filter;
use crate::record::{
    Attributes, ChangeAction, ChangeRecord, Identity, Modification, ModifyOp, Payload, Position,
};
use crate::source::{AdminSession, RawRecord, SearchRequest, Source};

pub(crate) const CHANGE_NUMBER: &str = "changeNumber";
pub(crate) const CHANGE_TIME: &str = "changeTime";
pub(crate) const CHANGE_USER: &str = "changeUser";
pub(crate) const CHANGE_ACTION: &str = "changeAction";
pub(crate) const TARGET_KEY: &str = "targetKey";
pub(crate) const CHANGES: &str = "changes";
pub(crate) const NEW_KEY: &str = "newKey";

/// Feed over a numbered changelog source.
pub struct NumberedLogFeed {
    changelog: Arc<dyn Source>,
    /// Use the `(>= X) AND NOT (= X)` window form for backends that return
    /// boundary duplicates on `>` scans. Selects the same records either way.
    boundary_compat: bool,
}

impl NumberedLogFeed {
    pub fn new(changelog: Arc<dyn Source>) -> Self {
        Self {
            changelog,
            boundary_compat: false,
        }
    }

    /// Switch to the compatibility window form.
    pub fn with_boundary_compat(mut self, boundary_compat: bool) -> Self {
        self.boundary_compat = boundary_compat;
        self
    }

    fn window_filter(&self, position: Option<&Position>) -> Result<Option<Filter>> {
        let Some(position) = position else {
            // Absent position: replay the whole changelog.
            return Ok(None);
        };
        let number = position.as_number().ok_or_else(|| {
            SyncError::feed(
                self.changelog.name(),
                format!("numbered feed resumed with non-numeric position {}", position),
            )
        })?;
        let filter = if self.boundary_compat {
            Filter::changes_after_compat(CHANGE_NUMBER, number)
        } else {
            Filter::changes_after(CHANGE_NUMBER, number)
        };
        Ok(Some(filter))
    }

    fn map_row(&self, raw: &RawRecord) -> Option<ChangeRecord> {
        let attributes = &raw.attributes;

        let sequence = match attributes.get_value(CHANGE_NUMBER).map(str::parse::<u64>) {
            Some(Ok(n)) => n,
            _ => {
                debug!(row = %raw.identity, "Changelog row without usable changeNumber, dropping");
                return None;
            }
        };

        let action = match attributes.get_value(CHANGE_ACTION).map(ChangeAction::from_tag) {
            Some(Some(action)) => action,
            _ => {
                debug!(
                    sequence,
                    tag = attributes.get_value(CHANGE_ACTION).unwrap_or(""),
                    "Changelog row with unknown changeAction, dropping"
                );
                return None;
            }
        };

        let identity = match attributes.get_value(TARGET_KEY).and_then(Identity::parse) {
            Some(identity) => identity,
            None => {
                debug!(sequence, "Changelog row with empty targetKey, dropping");
                return None;
            }
        };

        let changes = attributes.get_value(CHANGES).unwrap_or("");
        let payload = match action {
            ChangeAction::Add => Payload::Attributes(parse_attributes(changes)),
            ChangeAction::Modify => Payload::Modifications(parse_modifications(changes)),
            ChangeAction::ModRdn => {
                match attributes.get_value(NEW_KEY).and_then(Identity::parse) {
                    Some(new_identity) => Payload::NewIdentity(new_identity),
                    None => {
                        debug!(sequence, "MODRDN row with empty newKey, dropping");
                        return None;
                    }
                }
            }
            ChangeAction::Delete => Payload::None,
        };

        Some(ChangeRecord {
            sequence: Position::Number(sequence),
            timestamp: parse_change_time(attributes.get_value(CHANGE_TIME)),
            actor: attributes.get_value(CHANGE_USER).unwrap_or("").to_string(),
            action,
            identity,
            payload,
        })
    }
}

#[async_trait]
impl ChangeFeed for NumberedLogFeed {
    fn source_name(&self) -> &str {
        self.changelog.name()
    }

    async fn pull(
        &self,
        session: &dyn AdminSession,
        position: Option<&Position>,
    ) -> Result<FeedBatch> {
        let mut request = SearchRequest::all().with_attributes(vec![
            CHANGE_NUMBER.to_string(),
            CHANGE_TIME.to_string(),
            CHANGE_USER.to_string(),
            CHANGE_ACTION.to_string(),
            TARGET_KEY.to_string(),
            CHANGES.to_string(),
            NEW_KEY.to_string(),
        ]);
        if let Some(filter) = self.window_filter(position)? {
            debug!(filter = %filter, "Querying changelog");
            request = request.with_filter(filter);
        }

        let reply = self
            .changelog
            .search(session, &request)
            .await
            .map_err(|e| SyncError::feed(self.changelog.name(), e.to_string()))?;

        let mut records: Vec<ChangeRecord> = reply
            .records
            .iter()
            .filter_map(|raw| self.map_row(raw))
            .collect();

        // Replay requires ascending sequence; changelog order is not trusted.
        records.sort_by_key(|r| r.sequence.as_number().unwrap_or(u64::MAX));

        let new_position = records.last().map(|r| r.sequence.clone());
        Ok(FeedBatch {
            records,
            new_position,
        })
    }

    async fn current_position(&self, session: &dyn AdminSession) -> Result<Option<Position>> {
        let request = SearchRequest::all().with_attributes(vec![CHANGE_NUMBER.to_string()]);
        let reply = self
            .changelog
            .search(session, &request)
            .await
            .map_err(|e| SyncError::feed(self.changelog.name(), e.to_string()))?;

        let max = reply
            .records
            .iter()
            .filter_map(|raw| raw.attributes.get_value(CHANGE_NUMBER))
            .filter_map(|v| v.parse::<u64>().ok())
            .max();

        Ok(max.map(Position::Number))
    }
}

fn parse_change_time(value: Option<&str>) -> DateTime<Utc> {
    let Some(value) = value else {
        return DateTime::UNIX_EPOCH;
    };
    if let Ok(secs) = value.parse::<i64>() {
        if let Some(ts) = DateTime::from_timestamp(secs, 0) {
            return ts;
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return ts.with_timezone(&Utc);
    }
    debug!(value, "Unparsable changeTime");
    DateTime::UNIX_EPOCH
}

/// Split one LDIF line into (name, value), handling the `::` binary marker.
///
/// Binary values are carried as their raw base64 text; decoding is the
/// destination's concern.
fn split_ldif_line(line: &str) -> Option<(&str, &str)> {
    let (name, rest) = line.split_once(':')?;
    let value = match rest.strip_prefix(':') {
        Some(binary) => binary,
        None => rest,
    };
    Some((name, value.strip_prefix(' ').unwrap_or(value)))
}

/// Parse an LDIF-shaped attribute block (ADD payload).
///
/// Lines starting with a space continue the previous value; repeated
/// attribute names accumulate multiple values.
pub(crate) fn parse_attributes(changes: &str) -> Attributes {
    let mut attributes = Attributes::new();
    let mut current: Option<(String, String)> = None;

    for line in changes.lines() {
        if let Some(rest) = line.strip_prefix(' ') {
            if let Some((_, buffer)) = current.as_mut() {
                buffer.push_str(rest);
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        if let Some((name, buffer)) = current.take() {
            attributes.add_value(name, buffer.trim().to_string());
        }

        match split_ldif_line(line) {
            Some((name, value)) => current = Some((name.to_string(), value.to_string())),
            None => debug!(line, "Skipping malformed LDIF line"),
        }
    }

    if let Some((name, buffer)) = current.take() {
        attributes.add_value(name, buffer.trim().to_string());
    }

    attributes
}

/// Parse an LDIF-shaped modification block (MODIFY payload).
///
/// Blocks look like:
///
/// ```text
/// replace: mail
/// mail: alice@example.com
/// -
/// delete: description
/// -
/// ```
///
/// The trailing `-` after the final block is optional.
pub(crate) fn parse_modifications(changes: &str) -> Vec<Modification> {
    let mut modifications = Vec::new();
    let mut op: Option<(ModifyOp, String)> = None;
    let mut values: Vec<String> = Vec::new();
    let mut buffer: Option<String> = None;

    let mut flush_value = |values: &mut Vec<String>, buffer: &mut Option<String>| {
        if let Some(b) = buffer.take() {
            values.push(b.trim().to_string());
        }
    };

    for line in changes.lines() {
        if let Some(rest) = line.strip_prefix(' ') {
            if let Some(b) = buffer.as_mut() {
                b.push_str(rest);
            }
            continue;
        }
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if line == "-" {
            flush_value(&mut values, &mut buffer);
            if let Some((parsed_op, attribute)) = op.take() {
                modifications.push(Modification::new(
                    parsed_op,
                    attribute,
                    std::mem::take(&mut values),
                ));
            }
            continue;
        }

        let Some((name, value)) = split_ldif_line(line) else {
            debug!(line, "Skipping malformed LDIF line");
            continue;
        };

        if op.is_none() {
            match ModifyOp::from_keyword(name) {
                Some(parsed_op) => op = Some((parsed_op, value.trim().to_string())),
                None => debug!(keyword = name, "Unknown modification keyword, skipping block"),
            }
        } else {
            flush_value(&mut values, &mut buffer);
            buffer = Some(value.to_string());
        }
    }

    flush_value(&mut values, &mut buffer);
    if let Some((parsed_op, attribute)) = op.take() {
        modifications.push(Modification::new(parsed_op, attribute, values));
    }

    modifications
}
