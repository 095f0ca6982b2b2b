//! Decoding of stream-command replies.
//!
//! Entry lists are read as raw [`Value`] trees because an entry that was
//! deleted while still pending comes back with nil fields, which the typed
//! conversions reject.  Nil replies decode to empty results; anything else
//! that does not match the documented shape is an error.

use anyhow::{anyhow, bail, Result};
use fred::types::{FromValue, Value};

use super::store::{PendingSummary, StreamEntry};

fn expect_array(value: Value, what: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => bail!("unexpected {what} reply: {other:?}"),
    }
}

fn expect_string(value: &Value, what: &str) -> Result<String> {
    value
        .as_string()
        .ok_or_else(|| anyhow!("unexpected {what} reply: {value:?}"))
}

/// Decode a flat `[field, value, field, value, ...]` array.  A nil reply
/// marks an entry that was deleted while still pending.
pub fn parse_fields(value: Value) -> Result<Option<Vec<(String, String)>>> {
    if value.is_null() {
        return Ok(None);
    }
    let items = expect_array(value, "entry fields")?;
    if items.len() % 2 != 0 {
        bail!("entry fields reply has odd length {}", items.len());
    }
    let mut fields = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        fields.push((
            expect_string(&pair[0], "field name")?,
            expect_string(&pair[1], "field value")?,
        ));
    }
    Ok(Some(fields))
}

/// Decode a single `[id, fields]` entry.
pub fn parse_entry(value: Value) -> Result<StreamEntry> {
    let mut items = expect_array(value, "stream entry")?.into_iter();
    let id = match items.next() {
        Some(id) => expect_string(&id, "entry id")?,
        None => bail!("stream entry reply is empty"),
    };
    let fields = parse_fields(items.next().unwrap_or(Value::Null))?;
    Ok(StreamEntry { id, fields })
}

/// Decode an `XRANGE` reply.
pub fn parse_entries(value: Value) -> Result<Vec<StreamEntry>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    expect_array(value, "entry list")?
        .into_iter()
        .map(parse_entry)
        .collect()
}

/// Decode an `XREADGROUP` reply, keeping only the entries for `key`.
///
/// The reply is `[[key, [entry, ...]], ...]`, or nil when a blocking read
/// timed out.
pub fn parse_read_group(value: Value, key: &str) -> Result<Vec<StreamEntry>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    for stream in expect_array(value, "XREADGROUP")? {
        let mut parts = expect_array(stream, "XREADGROUP stream")?.into_iter();
        let name = match parts.next() {
            Some(name) => expect_string(&name, "stream name")?,
            None => continue,
        };
        if name == key {
            return parse_entries(parts.next().unwrap_or(Value::Null));
        }
    }
    Ok(Vec::new())
}

/// The summary form of `XPENDING`:
/// `[count, lowest, highest, [[consumer, count], ...]]`.
impl FromValue for PendingSummary {
    fn from_value(value: Value) -> Result<Self, fred::error::Error> {
        let (count, lowest, highest, consumers): (u64, Option<String>, Option<String>, Vec<(String, u64)>) =
            value.convert()?;
        Ok(Self {
            count,
            lowest,
            highest,
            consumers,
        })
    }
}
