// dash_share - Shareable view-state links for weather dashboards
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error;
use std::fmt;

/// Version written into every new record.
pub const RECORD_VERSION: u32 = 1;

/// Captured UI selection state: station, date range, selected tab, variables, etc.
///
/// The contents are opaque here. A snapshot is always a JSON object and is persisted
/// and returned verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct StateSnapshot(Map<String, Value>);

#[derive(Debug)]
pub enum RecordError {
    Malformed(serde_json::Error),
    UnsupportedVersion(u64),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed record: {}", e),
            Self::UnsupportedVersion(v) => write!(f, "unsupported record version {}", v),
        }
    }
}

impl error::Error for RecordError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct RecordRef<'a> {
    version: u32,
    state: &'a StateSnapshot,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Versioned {
        version: u64,
        state: StateSnapshot,
    },
    // Records written before the envelope existed are the bare snapshot.
    Legacy(StateSnapshot),
}

// A legacy snapshot may use "version" or "state" as ordinary keys, so only an
// exact two-field object with a numeric version is read as an envelope.
fn is_envelope(fields: &Map<String, Value>) -> bool {
    fields.len() == 2 && fields.get("version").map_or(false, Value::is_u64) && fields.contains_key("state")
}

/// Serialize a snapshot into the versioned record format.
pub fn encode_record(snapshot: &StateSnapshot) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&RecordRef {
        version: RECORD_VERSION,
        state: snapshot,
    })
}

/// Parse a persisted record, accepting both versioned and legacy bare records.
pub fn decode_record(bytes: &[u8]) -> Result<StateSnapshot, RecordError> {
    let fields: Map<String, Value> = serde_json::from_slice(bytes).map_err(RecordError::Malformed)?;
    if !is_envelope(&fields) {
        return Ok(StateSnapshot(fields));
    }

    match serde_json::from_value(Value::Object(fields)).map_err(RecordError::Malformed)? {
        StoredRecord::Versioned { version, .. } if version > u64::from(RECORD_VERSION) => Err(RecordError::UnsupportedVersion(version)),
        StoredRecord::Versioned { state, .. } => Ok(state),
        StoredRecord::Legacy(state) => Ok(state),
    }
}
