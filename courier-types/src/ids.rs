//! Identity types for Courier.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A user identifier.
///
/// Non-empty and free of `:`, which is reserved as the identity separator.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Create a UserId, rejecting empty strings and strings containing `:`.
    pub fn new(s: impl Into<String>) -> Result<Self, WireError> {
        let s = s.into();
        if s.is_empty() {
            return Err(WireError::InvalidIdentity("empty user_id".into()));
        }
        if s.contains(':') {
            return Err(WireError::InvalidIdentity(format!(
                "user_id may not contain ':': {s}"
            )));
        }
        Ok(Self(s))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = WireError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// A device identifier, unique within a user.
///
/// Non-empty; any other characters are allowed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a DeviceId, rejecting empty strings.
    pub fn new(s: impl Into<String>) -> Result<Self, WireError> {
        let s = s.into();
        if s.is_empty() {
            return Err(WireError::InvalidIdentity("empty device_id".into()));
        }
        Ok(Self(s))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = WireError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

/// The composite key addressing one logical client session.
///
/// Canonical string form is `user_id:device_id`, which is also the wire
/// representation in [`Frame::to`](crate::Frame) / `from` and the durable
/// queue key. An identity addresses at most one live connection at a time,
/// but may register, deregister, and re-register repeatedly.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// The user this session belongs to.
    pub user_id: UserId,
    /// The device within that user.
    pub device_id: DeviceId,
}

impl Identity {
    /// Build an identity from raw strings, validating both parts.
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Result<Self, WireError> {
        Ok(Self {
            user_id: UserId::new(user_id)?,
            device_id: DeviceId::new(device_id)?,
        })
    }

    /// The canonical `user_id:device_id` key.
    pub fn as_key(&self) -> String {
        format!("{}:{}", self.user_id, self.device_id)
    }
}

impl FromStr for Identity {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, device) = s
            .split_once(':')
            .ok_or_else(|| WireError::InvalidIdentity(format!("missing ':' in {s:?}")))?;
        Self::new(user, device)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.device_id)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}:{})", self.user_id, self.device_id)
    }
}
