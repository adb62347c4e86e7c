// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Display};
use std::num::{NonZeroU64, NonZeroU128};
use std::str::FromStr;

/// Error returned when a trace or span identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ParseIdError {
    /// The identifier does not have the expected number of hex digits.
    #[error("expected {expected} hex digits, found {actual}")]
    InvalidLength {
        /// Number of hex digits the identifier must have.
        expected: usize,
        /// Number of characters that were supplied.
        actual: usize,
    },

    /// The identifier contains a character that is not a hex digit.
    #[error("identifier contains a non-hex character")]
    InvalidDigit,

    /// The identifier is all zeros, which is reserved as "no identifier".
    #[error("identifier must not be all zeros")]
    Zero,
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty, $nonzero:ty, $digits:literal, $random:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($nonzero);

        impl $name {
            /// Number of lowercase hex digits in the textual form.
            pub const HEX_LEN: usize = $digits;

            /// Creates a new random identifier.
            ///
            /// The all-zero value is never returned.
            #[must_use]
            pub fn random() -> Self {
                loop {
                    if let Some(value) = <$nonzero>::new($random(..)) {
                        return Self(value);
                    }
                }
            }

            /// Creates an identifier from its numeric value, or `None` for zero.
            #[must_use]
            pub const fn from_value(value: $repr) -> Option<Self> {
                match <$nonzero>::new(value) {
                    Some(value) => Some(Self(value)),
                    None => None,
                }
            }

            /// Returns the numeric value of the identifier.
            #[must_use]
            pub const fn value(self) -> $repr {
                self.0.get()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:0width$x}", self.0.get(), width = $digits)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != $digits {
                    return Err(ParseIdError::InvalidLength {
                        expected: $digits,
                        actual: s.len(),
                    });
                }

                // `from_str_radix` tolerates a leading sign, the wire format does not.
                if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(ParseIdError::InvalidDigit);
                }

                let value = <$repr>::from_str_radix(s, 16).map_err(|_parse| ParseIdError::InvalidDigit)?;
                Self::from_value(value).ok_or(ParseIdError::Zero)
            }
        }
    };
}

define_id!(
    /// Identifies one causal chain of spans across every service it touches.
    ///
    /// Rendered as 32 lowercase hex digits.
    TraceId,
    u128,
    NonZeroU128,
    32,
    fastrand::u128
);

define_id!(
    /// Identifies a single timed operation within a trace.
    ///
    /// Rendered as 16 lowercase hex digits.
    SpanId,
    u64,
    NonZeroU64,
    16,
    fastrand::u64
);

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(TraceId::random(), TraceId::random());
        assert_ne!(SpanId::random(), SpanId::random());
    }

    #[test]
    fn display_is_zero_padded_lowercase() {
        let trace = TraceId::from_value(0xAB).unwrap();
        assert_eq!(trace.to_string(), "000000000000000000000000000000ab");

        let span = SpanId::from_value(0x1F).unwrap();
        assert_eq!(span.to_string(), "000000000000001f");
    }

    #[test]
    fn parse_accepts_display_output() {
        let span = SpanId::random();
        assert_eq!(span.to_string().parse::<SpanId>().unwrap(), span);

        let trace = TraceId::random();
        assert_eq!(trace.to_string().parse::<TraceId>().unwrap(), trace);
    }

    #[test]
    fn parse_accepts_uppercase() {
        let span: SpanId = "00000000000000FF".parse().unwrap();
        assert_eq!(span.value(), 0xff);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(
            "abc".parse::<SpanId>(),
            Err(ParseIdError::InvalidLength { expected: 16, actual: 3 })
        );
    }

    #[test]
    fn parse_rejects_sign_and_garbage() {
        assert_eq!("+000000000000001".parse::<SpanId>(), Err(ParseIdError::InvalidDigit));
        assert_eq!("zz00000000000001".parse::<SpanId>(), Err(ParseIdError::InvalidDigit));
    }

    #[test]
    fn parse_rejects_zero() {
        assert_eq!("0000000000000000".parse::<SpanId>(), Err(ParseIdError::Zero));
        assert_eq!(TraceId::from_value(0), None);
    }
}
