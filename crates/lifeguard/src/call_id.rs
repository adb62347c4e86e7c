// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt::{self, Display};

/// Stable name of a logical dependency call site, such as `"baggage.get_by_passenger"`.
///
/// The call identifier keys both the policy lookup and the circuit breaker state.
/// One breaker is kept per identifier for the lifetime of the process, so identifiers
/// should be low-cardinality. Never embed request-specific data such as user ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(Cow<'static, str>);

impl CallId {
    /// Creates a call identifier from a static name.
    #[must_use]
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn to_cow(&self) -> Cow<'static, str> {
        self.0.clone()
    }
}

impl Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CallId {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for CallId {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl AsRef<str> for CallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
