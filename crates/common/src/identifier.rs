//! Validated identifiers for remote services and their operations.
//!
//! Service and operation names travel on every bus envelope. Validating
//! them when a saga is defined catches typos long before dispatch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted identifier, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Error returned when an identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The identifier was empty.
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    /// The identifier exceeded [`MAX_IDENTIFIER_LEN`].
    #[error("{kind} '{value}' is longer than {MAX_IDENTIFIER_LEN} bytes")]
    TooLong { kind: &'static str, value: String },

    /// The identifier contained a disallowed character.
    #[error("{kind} '{value}' contains invalid character '{invalid}'")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        invalid: char,
    },
}

fn validate(kind: &'static str, value: &str) -> Result<(), IdentifierError> {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err(IdentifierError::Empty { kind });
    };
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierError::TooLong {
            kind,
            value: value.to_string(),
        });
    }
    if !first.is_ascii_alphanumeric() {
        return Err(IdentifierError::InvalidCharacter {
            kind,
            value: value.to_string(),
            invalid: first,
        });
    }
    if let Some(invalid) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdentifierError::InvalidCharacter {
            kind,
            value: value.to_string(),
            invalid,
        });
    }
    Ok(())
}

/// Name of a remote service reachable through the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Creates a validated service name.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentifierError> {
        let value = value.into();
        validate("service name", &value)?;
        Ok(Self(value))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Name of an operation exposed by a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationName(String);

impl OperationName {
    /// Creates a validated operation name.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentifierError> {
        let value = value.into();
        validate("operation name", &value)?;
        Ok(Self(value))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for OperationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ServiceName {
    type Error = IdentifierError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

impl TryFrom<String> for OperationName {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for OperationName {
    type Error = IdentifierError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OperationName> for String {
    fn from(name: OperationName) -> Self {
        name.0
    }
}
