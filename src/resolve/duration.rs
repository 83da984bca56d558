//! Go-style duration strings (`5m`, `1h30m`, `1.5s`, `250ms`).

use std::time::Duration;

use thiserror::Error;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SECOND: u128 = 1_000_000_000;
const NANOS_PER_MINUTE: u128 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: u128 = 60 * NANOS_PER_MINUTE;

// Fraction digits beyond this add nothing at nanosecond precision.
const MAX_FRACTION_DIGITS: usize = 18;

/// Errors raised while parsing a duration string.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DurationError {
    /// The string is not a duration at all.
    #[error("invalid duration \"{0}\"")]
    Invalid(String),
    /// A number is not followed by a unit.
    #[error("missing unit in duration \"{0}\"")]
    MissingUnit(String),
    /// A number is followed by an unrecognised unit.
    #[error("unknown unit \"{unit}\" in duration \"{input}\"")]
    UnknownUnit {
        /// Unit text as written.
        unit: String,
        /// Full input string.
        input: String,
    },
    /// The duration is below zero.
    #[error("negative duration \"{0}\" is not allowed")]
    Negative(String),
    /// The duration does not fit in a signed 64-bit nanosecond count.
    #[error("duration \"{0}\" is out of range")]
    Overflow(String),
}

/// Parses a duration using Go's `time.ParseDuration` syntax.
///
/// # Errors
///
/// Returns [`DurationError`] when the input is empty, malformed, uses an
/// unknown unit, is negative, or exceeds the representable range.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use kiln::resolve::parse_duration;
/// assert_eq!(parse_duration("1h30m").ok(), Some(Duration::from_secs(5400)));
/// assert_eq!(parse_duration("1.5s").ok(), Some(Duration::from_millis(1500)));
/// assert!(parse_duration("10").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let (negative, unsigned) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.strip_prefix('+').unwrap_or(input)),
    };

    if unsigned == "0" {
        return Ok(Duration::ZERO);
    }
    if unsigned.is_empty() {
        return Err(DurationError::Invalid(input.to_owned()));
    }

    let mut total: u128 = 0;
    let mut rest = unsigned;
    while !rest.is_empty() {
        let (nanos, remaining) = parse_component(rest, input)?;
        total = total
            .checked_add(nanos)
            .ok_or_else(|| DurationError::Overflow(input.to_owned()))?;
        rest = remaining;
    }

    let nanos = u64::try_from(total)
        .ok()
        .filter(|value| i64::try_from(*value).is_ok())
        .ok_or_else(|| DurationError::Overflow(input.to_owned()))?;
    if negative && nanos != 0 {
        return Err(DurationError::Negative(input.to_owned()));
    }
    Ok(Duration::from_nanos(nanos))
}

/// Parses one `<int>[.<fraction>]<unit>` component, returning its length in
/// nanoseconds and the unparsed remainder.
fn parse_component<'a>(text: &'a str, input: &str) -> Result<(u128, &'a str), DurationError> {
    let (whole_digits, after_whole) = split_digits(text);
    let (fraction_digits, after_number) = match after_whole.strip_prefix('.') {
        Some(after_dot) => split_digits(after_dot),
        None => ("", after_whole),
    };
    if whole_digits.is_empty() && fraction_digits.is_empty() {
        return Err(DurationError::Invalid(input.to_owned()));
    }

    let unit_len = after_number
        .find(|ch: char| ch == '.' || ch.is_ascii_digit())
        .unwrap_or(after_number.len());
    let (unit, remaining) = after_number.split_at(unit_len);
    if unit.is_empty() {
        return Err(DurationError::MissingUnit(input.to_owned()));
    }
    let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
        unit: unit.to_owned(),
        input: input.to_owned(),
    })?;

    let overflow = || DurationError::Overflow(input.to_owned());
    let whole = if whole_digits.is_empty() {
        0
    } else {
        whole_digits.parse::<u128>().map_err(|_| overflow())?
    };
    let mut nanos = whole.checked_mul(scale).ok_or_else(overflow)?;

    let fraction = fraction_digits
        .get(..MAX_FRACTION_DIGITS)
        .unwrap_or(fraction_digits);
    if !fraction.is_empty() {
        let numerator = fraction.parse::<u128>().map_err(|_| overflow())?;
        let exponent = u32::try_from(fraction.len()).map_err(|_| overflow())?;
        let denominator = 10_u128.checked_pow(exponent).ok_or_else(overflow)?;
        let partial = numerator
            .checked_mul(scale)
            .and_then(|value| value.checked_div(denominator))
            .ok_or_else(overflow)?;
        nanos = nanos.checked_add(partial).ok_or_else(overflow)?;
    }

    Ok((nanos, remaining))
}

fn split_digits(text: &str) -> (&str, &str) {
    let len = text.bytes().take_while(u8::is_ascii_digit).count();
    text.split_at(len)
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "\u{b5}s" | "\u{3bc}s" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(NANOS_PER_MINUTE),
        "h" => Some(NANOS_PER_HOUR),
        _ => None,
    }
}
