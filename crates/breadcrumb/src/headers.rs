// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire format for carrying a [`TraceContext`] across a call boundary.
//!
//! The context travels as plain headers:
//!
//! | header           | value                                  | required |
//! |------------------|----------------------------------------|----------|
//! | `trace-id`       | 32 lowercase hex digits                | yes      |
//! | `span-id`        | 16 lowercase hex digits                | yes      |
//! | `parent-span-id` | 16 lowercase hex digits                | no       |
//! | `baggage`        | `key=value` pairs separated by commas  | no       |
//!
//! Baggage keys and values are percent-encoded: `%`, `,`, `=` and any byte outside
//! visible ASCII become `%XX`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use http::{HeaderMap, HeaderValue};

use crate::{ParseIdError, SpanId, TraceContext, TraceId};

/// Header carrying the trace id.
pub const TRACE_ID: &str = "trace-id";

/// Header carrying the span id of the calling span.
pub const SPAN_ID: &str = "span-id";

/// Header carrying the parent of the calling span.
pub const PARENT_SPAN_ID: &str = "parent-span-id";

/// Header carrying baggage items.
pub const BAGGAGE: &str = "baggage";

/// Error returned by [`extract`] when headers do not hold a valid trace context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ExtractError {
    /// A required header is absent.
    #[error("missing required header '{0}'")]
    Missing(&'static str),

    /// A header holds a malformed identifier.
    #[error("header '{header}' holds an invalid identifier")]
    InvalidId {
        /// Name of the offending header.
        header: &'static str,
        /// Why the identifier was rejected.
        #[source]
        source: ParseIdError,
    },

    /// A baggage entry is not a well-formed `key=value` pair.
    #[error("invalid baggage entry '{0}'")]
    InvalidBaggage(String),

    /// A header value is not valid UTF-8.
    #[error("header '{0}' is not valid UTF-8")]
    NotUtf8(&'static str),
}

/// Writes `context` into `headers`, replacing any previous trace headers.
///
/// An absent parent span or empty baggage removes the corresponding header.
pub fn inject(context: &TraceContext, headers: &mut HeaderMap) {
    headers.insert(TRACE_ID, hex_value(&context.trace_id().to_string()));
    headers.insert(SPAN_ID, hex_value(&context.span_id().to_string()));

    match context.parent_span_id() {
        Some(parent) => {
            headers.insert(PARENT_SPAN_ID, hex_value(&parent.to_string()));
        }
        None => {
            headers.remove(PARENT_SPAN_ID);
        }
    }

    if context.baggage().is_empty() {
        headers.remove(BAGGAGE);
    } else {
        let encoded = encode_baggage(context.baggage());
        let value = HeaderValue::try_from(encoded).expect("percent-encoded baggage is visible ASCII");
        headers.insert(BAGGAGE, value);
    }
}

/// Reads a trace context from `headers`.
///
/// The returned context describes the remote caller's span. Derive a child from it
/// before doing any work of your own.
///
/// # Errors
///
/// Returns an error if `trace-id` or `span-id` is missing, if any identifier is
/// malformed, or if the baggage header cannot be decoded.
pub fn extract(headers: &HeaderMap) -> Result<TraceContext, ExtractError> {
    let trace_id: TraceId = required(headers, TRACE_ID)?;
    let span_id: SpanId = required(headers, SPAN_ID)?;

    let parent_span_id = match header_str(headers, PARENT_SPAN_ID)? {
        Some(value) => Some(parse_id(PARENT_SPAN_ID, value)?),
        None => None,
    };

    let baggage = match header_str(headers, BAGGAGE)? {
        Some(value) => decode_baggage(value)?,
        None => BTreeMap::new(),
    };

    Ok(TraceContext::from_parts(trace_id, span_id, parent_span_id, baggage))
}

fn hex_value(hex: &str) -> HeaderValue {
    HeaderValue::from_str(hex).expect("hex digits are valid header characters")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, ExtractError> {
    headers
        .get(name)
        .map(|value| value.to_str().map_err(|_err| ExtractError::NotUtf8(name)))
        .transpose()
}

fn required<T>(headers: &HeaderMap, name: &'static str) -> Result<T, ExtractError>
where
    T: std::str::FromStr<Err = ParseIdError>,
{
    let value = header_str(headers, name)?.ok_or(ExtractError::Missing(name))?;
    parse_id(name, value)
}

fn parse_id<T>(header: &'static str, value: &str) -> Result<T, ExtractError>
where
    T: std::str::FromStr<Err = ParseIdError>,
{
    value.trim().parse().map_err(|source| ExtractError::InvalidId { header, source })
}

fn encode_baggage(baggage: &BTreeMap<String, String>) -> String {
    let mut out = String::new();

    for (key, value) in baggage {
        if !out.is_empty() {
            out.push(',');
        }
        percent_encode(key, &mut out);
        out.push('=');
        percent_encode(value, &mut out);
    }

    out
}

fn percent_encode(input: &str, out: &mut String) {
    for byte in input.bytes() {
        match byte {
            b'%' | b',' | b'=' => write_escaped(byte, out),
            0x21..=0x7e => out.push(char::from(byte)),
            _ => write_escaped(byte, out),
        }
    }
}

fn write_escaped(byte: u8, out: &mut String) {
    // Writing to a String cannot fail.
    let _ = write!(out, "%{byte:02X}");
}

fn decode_baggage(header: &str) -> Result<BTreeMap<String, String>, ExtractError> {
    let mut baggage = BTreeMap::new();

    for entry in header.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let invalid = || ExtractError::InvalidBaggage(entry.to_owned());

        let (key, value) = entry.split_once('=').ok_or_else(invalid)?;
        let key = percent_decode(key.trim()).ok_or_else(invalid)?;
        let value = percent_decode(value.trim()).ok_or_else(invalid)?;

        if key.is_empty() {
            return Err(invalid());
        }

        baggage.insert(key, value);
    }

    Ok(baggage)
}

fn percent_decode(input: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(input.len());
    let mut iter = input.bytes();

    while let Some(byte) = iter.next() {
        if byte == b'%' {
            let high = hex_digit(iter.next()?)?;
            let low = hex_digit(iter.next()?)?;
            bytes.push((high << 4) | low);
        } else {
            bytes.push(byte);
        }
    }

    String::from_utf8(bytes).ok()
}

const fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
