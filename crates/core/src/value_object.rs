//! Value objects: equality by value, not identity.
//!
//! Event names and routing keys are plain strings on the wire, but they are
//! validated once at the edge so the store and the broker never see an empty or
//! whitespace-laden key.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two routing keys
/// with the same text are the same routing key.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Longest name accepted for an event type or routing key.
pub const MAX_NAME_LEN: usize = 255;

fn validate_name(kind: &str, value: &str) -> DomainResult<()> {
    if value.is_empty() {
        return Err(DomainError::validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(DomainError::validation(format!(
            "{kind} exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DomainError::validation(format!(
            "{kind} must not contain whitespace: {value:?}"
        )));
    }
    Ok(())
}

/// Logical event name (e.g. `document.approved`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        validate_name("event type", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Broker routing key; defaults to the event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        validate_name("routing key", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&EventType> for RoutingKey {
    fn from(value: &EventType) -> Self {
        // Same validation rules, so no re-check is needed.
        Self(value.0.clone())
    }
}

macro_rules! impl_name_traits {
    ($t:ty) => {
        impl ValueObject for $t {}

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_name_traits!(EventType);
impl_name_traits!(RoutingKey);
