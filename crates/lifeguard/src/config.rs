// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loading policies from configuration.
//!
//! Policies can be set per call site without recompiling the code that makes the calls.
//! A configuration document has a `default` section and a `calls` section keyed by
//! call identifier. Every field is optional. A call inherits anything it leaves out
//! from `default`, and `default` inherits anything it leaves out from
//! [`PolicySpec::default`].
//!
//! Durations accept both the friendly (`"250ms"`, `"1m 30s"`) and the ISO 8601
//! (`"PT5S"`) notation.
//!
//! ```json
//! {
//!     "default": { "timeout": "1s", "max_retries": 3 },
//!     "calls": {
//!         "baggage.get": {
//!             "timeout": "250ms",
//!             "max_retries": 4,
//!             "retry_delay": "500ms",
//!             "backoff": "exponential",
//!             "failure_ratio": 0.75
//!         }
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jiff::SignedDuration;
use serde::{Deserialize, Serialize};

use crate::{Backoff, CallId, PolicyError, PolicySpec};

/// Error returned when a policy configuration cannot be loaded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read policy configuration from '{}'", .path.display())]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid JSON or does not have the expected shape.
    #[error("failed to parse policy configuration")]
    Parse(#[from] serde_json::Error),

    /// A duration is negative.
    #[error("'{field}' of '{call_id}' must not be negative")]
    InvalidDuration {
        /// Call whose policy is affected, or `default`.
        call_id: String,
        /// Name of the offending field.
        field: &'static str,
    },

    /// The resulting policy failed validation.
    #[error("policy for '{call_id}' is invalid")]
    Invalid {
        /// Call whose policy is affected, or `default`.
        call_id: String,
        /// Why the policy was rejected.
        #[source]
        reason: PolicyError,
    },
}

/// Serialized form of a [`PolicySpec`]. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct PolicyConfig {
    /// See [`PolicySpec::with_timeout`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<SignedDuration>,
    /// See [`PolicySpec::with_max_retries`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// See [`PolicySpec::with_retry_delay`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<SignedDuration>,
    /// See [`PolicySpec::with_backoff`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// See [`PolicySpec::with_max_delay`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<SignedDuration>,
    /// See [`PolicySpec::with_jitter`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    /// See [`PolicySpec::with_request_volume_threshold`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_volume_threshold: Option<u32>,
    /// See [`PolicySpec::with_failure_ratio`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_ratio: Option<f64>,
    /// See [`PolicySpec::with_open_duration`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_duration: Option<SignedDuration>,
    /// See [`PolicySpec::with_success_threshold`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    /// See [`PolicySpec::with_rolling_window`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_window: Option<u32>,
}

impl PolicyConfig {
    /// Applies the fields present in this configuration on top of `base`.
    ///
    /// `name` identifies the policy in errors.
    ///
    /// # Errors
    ///
    /// Returns an error if a duration is negative or the resulting policy is invalid.
    pub fn apply(&self, name: &str, base: PolicySpec) -> Result<PolicySpec, ConfigError> {
        let duration = |value: SignedDuration, field: &'static str| {
            Duration::try_from(value).map_err(|_negative| ConfigError::InvalidDuration {
                call_id: name.to_owned(),
                field,
            })
        };

        let mut spec = base;

        if let Some(value) = self.timeout {
            spec = spec.with_timeout(duration(value, "timeout")?);
        }
        if let Some(value) = self.max_retries {
            spec = spec.with_max_retries(value);
        }
        if let Some(value) = self.retry_delay {
            spec = spec.with_retry_delay(duration(value, "retry_delay")?);
        }
        if let Some(value) = self.backoff {
            spec = spec.with_backoff(value);
        }
        if let Some(value) = self.max_delay {
            spec = spec.with_max_delay(duration(value, "max_delay")?);
        }
        if let Some(value) = self.jitter {
            spec = spec.with_jitter(value);
        }
        if let Some(value) = self.request_volume_threshold {
            spec = spec.with_request_volume_threshold(value);
        }
        if let Some(value) = self.failure_ratio {
            spec = spec.with_failure_ratio(value);
        }
        if let Some(value) = self.open_duration {
            spec = spec.with_open_duration(duration(value, "open_duration")?);
        }
        if let Some(value) = self.success_threshold {
            spec = spec.with_success_threshold(value);
        }
        if let Some(value) = self.rolling_window {
            spec = spec.with_rolling_window(value);
        }

        spec.validate().map_err(|reason| ConfigError::Invalid {
            call_id: name.to_owned(),
            reason,
        })?;

        Ok(spec)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RegistryConfig {
    default: PolicyConfig,
    calls: HashMap<String, PolicyConfig>,
}

/// Resolves the [`PolicySpec`] for each call site.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lifeguard::{CallId, PolicyRegistry};
///
/// let registry = PolicyRegistry::from_json_str(
///     r#"{ "calls": { "baggage.get": { "timeout": "250ms", "max_retries": 4 } } }"#,
/// )
/// .unwrap();
///
/// let spec = registry.policy(&CallId::from("baggage.get"));
/// assert_eq!(spec.timeout(), Duration::from_millis(250));
///
/// let fallback = registry.policy(&CallId::from("passenger.get"));
/// assert_eq!(fallback.timeout(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    default: PolicySpec,
    overrides: HashMap<CallId, PolicySpec>,
}

impl PolicyRegistry {
    /// Creates a registry in which every call uses `default`.
    #[must_use]
    pub fn new(default: PolicySpec) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Sets the policy for a single call site.
    #[must_use]
    pub fn insert(mut self, call_id: impl Into<CallId>, spec: PolicySpec) -> Self {
        self.overrides.insert(call_id.into(), spec);
        self
    }

    /// The policy used by calls without an override.
    #[must_use]
    pub const fn default_policy(&self) -> &PolicySpec {
        &self.default
    }

    /// Returns the policy for `call_id`, or the default policy if it has no override.
    #[must_use]
    pub fn policy(&self, call_id: &CallId) -> PolicySpec {
        self.overrides.get(call_id).copied().unwrap_or(self.default)
    }

    /// Parses a registry from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or describes an invalid policy.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        Self::from_config(&config)
    }

    /// Reads and parses a registry from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, cannot be parsed, or describes an
    /// invalid policy.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::event!(
            name: "lifeguard.config.loaded",
            tracing::Level::DEBUG,
            config.path = %path.display(),
        );

        Self::from_json_str(&json)
    }

    fn from_config(config: &RegistryConfig) -> Result<Self, ConfigError> {
        let default = config.default.apply("default", PolicySpec::default())?;
        let mut registry = Self::new(default);

        for (call_id, call) in &config.calls {
            let spec = call.apply(call_id, default)?;
            registry.overrides.insert(CallId::from(call_id.clone()), spec);
        }

        Ok(registry)
    }
}
