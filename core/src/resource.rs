//! Resource identification.
//!
//! A [`ResourceKey`] names one watchable value in the external service,
//! for example a document path such as `"counters/shared"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `ResourceKey` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid resource key: {0}")]
pub struct ParseResourceKeyError(String);

/// Opaque identifier of one external watchable value.
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty or blank keys)
/// - `From::from()` and `new()`: No validation (for application-controlled keys)
///
/// # Examples
///
/// ```
/// use composable_epics_core::ResourceKey;
///
/// let key = ResourceKey::new("counters/shared");
/// assert_eq!(key.as_str(), "counters/shared");
///
/// let parsed: ResourceKey = "counters/other".parse().unwrap();
/// assert_eq!(parsed, ResourceKey::new("counters/other"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Create a new `ResourceKey` from a string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the key into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceKey {
    type Err = ParseResourceKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseResourceKeyError(
                "Resource key cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for ResourceKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
