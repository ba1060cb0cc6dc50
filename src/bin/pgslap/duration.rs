use std::time::Duration;

use anyhow::{Context, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parses durations written the way Go prints them: one or more
/// `<number><unit>` components such as `10s`, `1m30s`, `1.5h` or `250ms`.
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `0`
/// is accepted too.
///
/// Negative durations are rejected. Fractions finer than a nanosecond
/// are truncated.
pub fn parse_duration(input: &str) -> Result<Duration> {
    anyhow::ensure!(
        !input.starts_with('-'),
        "Negative durations are not supported: {input:?}"
    );
    let s = input.strip_prefix('+').unwrap_or(input);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    anyhow::ensure!(!s.is_empty(), "Invalid duration: {input:?}");

    let mut nanos = 0u128;
    let mut rest = s;
    while !rest.is_empty() {
        let (component, tail) =
            split_component(rest).with_context(|| format!("Invalid duration: {input:?}"))?;
        nanos = nanos
            .checked_add(component)
            .context("Duration out of representable range")?;
        rest = tail;
    }

    let secs = u64::try_from(nanos / NANOS_PER_SEC).context("Duration out of representable range")?;
    Ok(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
}

// Splits the leading component off, e.g. `1.5h` off `1.5h30m`, and
// returns its length in nanoseconds
fn split_component(s: &str) -> Result<(u128, &str)> {
    let (whole, s) = split_digits(s);
    let (fraction, s) = match s.strip_prefix('.') {
        Some(s) => split_digits(s),
        None => ("", s),
    };
    anyhow::ensure!(
        !whole.is_empty() || !fraction.is_empty(),
        "Expected a number at {s:?}"
    );

    let unit_end = s
        .find(|c: char| c.is_ascii_digit() || c == '.')
        .unwrap_or(s.len());
    let (unit, rest) = s.split_at(unit_end);
    let unit = unit_nanos(unit)?;

    let whole: u128 = match whole {
        "" => 0,
        digits => digits.parse().context("Number too large")?,
    };
    let mut nanos = whole
        .checked_mul(unit)
        .context("Duration out of representable range")?;

    let mut scale = unit;
    for digit in fraction.bytes() {
        scale /= 10;
        if scale == 0 {
            break;
        }
        nanos += u128::from(digit - b'0') * scale;
    }

    Ok((nanos, rest))
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn unit_nanos(unit: &str) -> Result<u128> {
    let nanos = match unit {
        "ns" => 1,
        // U+00B5 is the micro sign, U+03BC the Greek letter mu
        "us" | "\u{00B5}s" | "\u{03BC}s" => 1_000,
        "ms" => 1_000_000,
        "s" => NANOS_PER_SEC,
        "m" => 60 * NANOS_PER_SEC,
        "h" => 3600 * NANOS_PER_SEC,
        "" => anyhow::bail!("Missing unit"),
        other => anyhow::bail!("Unknown unit {other:?}"),
    };
    Ok(nanos)
}
