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

use serde::{Serialize, Serializer};
use std::error;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reason a string was rejected as a share token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidToken {
    Empty,
    TooLong(usize),
    BadCharacter(char),
}

impl fmt::Display for InvalidToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty share token"),
            Self::TooLong(len) => write!(f, "share token of {} bytes exceeds {}", len, ShareToken::MAX_LEN),
            Self::BadCharacter(c) => write!(f, "share token contains disallowed character {:?}", c),
        }
    }
}

impl error::Error for InvalidToken {}

/// Opaque identifier naming a persisted snapshot.
///
/// A `ShareToken` can only be built by generating a new one or by validating a string
/// against the allow-list `[A-Za-z0-9-]{1,64}`. Storage backends are addressed with
/// `ShareToken` values only, so strings from user-editable URLs can never be used to
/// build a path or key without passing through [`ShareToken::parse`] first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShareToken(String);

impl ShareToken {
    pub const MAX_LEN: usize = 64;

    /// Generate a new random token (a hyphenated UUIDv4).
    pub fn generate() -> Self {
        ShareToken(Uuid::new_v4().hyphenated().to_string())
    }

    /// Validate an untrusted string as a token.
    pub fn parse(raw: &str) -> Result<Self, InvalidToken> {
        if raw.is_empty() {
            return Err(InvalidToken::Empty);
        }

        if let Some(c) = raw.chars().find(|c| !Self::allowed(*c)) {
            return Err(InvalidToken::BadCharacter(c));
        }

        if raw.len() > Self::MAX_LEN {
            return Err(InvalidToken::TooLong(raw.len()));
        }

        Ok(ShareToken(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn allowed(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-'
    }
}

impl FromStr for ShareToken {
    type Err = InvalidToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for ShareToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ShareToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
