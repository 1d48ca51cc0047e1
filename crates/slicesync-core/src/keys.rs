//! Slice keys and session identities
//!
//! Both are validated string newtypes. They become segments of cache keys
//! (`cache:{session}:{slice}`) and of remote document addresses, so they may
//! not be empty, may not contain the `:` separator and may not carry
//! surrounding whitespace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cache namespace used when no session is present
pub const GUEST_NAMESPACE: &str = "guest";

/// Separator between cache key segments
pub const KEY_SEPARATOR: char = ':';

/// Errors that can occur when validating a key
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} '{value}' contains the reserved separator ':'")]
    ReservedSeparator { kind: &'static str, value: String },

    #[error("{kind} '{value}' has leading or trailing whitespace")]
    Whitespace { kind: &'static str, value: String },

    #[error("{kind} '{value}' is reserved")]
    Reserved { kind: &'static str, value: String },
}

fn validate(kind: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty { kind });
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(KeyError::ReservedSeparator {
            kind,
            value: value.to_string(),
        });
    }
    if value.trim() != value {
        return Err(KeyError::Whitespace {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Stable identifier of one logical slice of state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SliceKey(String);

impl SliceKey {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        validate("slice key", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque identifier of the authenticated principal
///
/// Guest mode is represented by `Option::<SessionId>::None`, never by a
/// `SessionId` value, so the guest namespace name is rejected here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        validate("session id", &value)?;
        if value == GUEST_NAMESPACE {
            return Err(KeyError::Reserved {
                kind: "session id",
                value,
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cache namespace for an optional session
pub fn namespace(session: Option<&SessionId>) -> &str {
    session.map(SessionId::as_str).unwrap_or(GUEST_NAMESPACE)
}

macro_rules! string_newtype_impls {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = KeyError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype_impls!(SliceKey);
string_newtype_impls!(SessionId);
