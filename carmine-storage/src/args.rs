//! Argument parsing and range helpers shared by command handlers.

/// Converts argument bytes into the string key form used by the dicts.
#[must_use]
pub fn key_of(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Parses a signed integer argument.
pub fn parse_int(raw: &[u8]) -> Result<i64, ()> {
    std::str::from_utf8(raw).map_err(|_| ())?.parse().map_err(|_| ())
}

/// Parses a float argument, rejecting NaN.
pub fn parse_float(raw: &[u8]) -> Result<f64, ()> {
    let value: f64 = std::str::from_utf8(raw)
        .map_err(|_| ())?
        .parse()
        .map_err(|_| ())?;
    if value.is_nan() { Err(()) } else { Ok(value) }
}

/// Formats a score the way the reference server prints it: integral
/// values without a decimal point, infinities as `inf`/`-inf`.
#[must_use]
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        return "inf".to_owned();
    }
    if score == f64::NEG_INFINITY {
        return "-inf".to_owned();
    }
    if score.fract() == 0.0 && score.abs() < 1e17 {
        #[allow(clippy::cast_possible_truncation)]
        return format!("{}", score as i64);
    }
    format!("{score}")
}

/// Normalises a closed `[start, stop]` index pair with negative-offset
/// semantics into a half-open `[start, stop)` range over `size` elements.
///
/// Returns `None` when the range selects nothing.
#[must_use]
pub fn normalize_range(size: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if size == 0 {
        return None;
    }
    let size_i = i64::try_from(size).unwrap_or(i64::MAX);

    let begin = if start < -size_i {
        0
    } else if start < 0 {
        size_i + start
    } else if start >= size_i {
        return None;
    } else {
        start
    };

    let end = if stop < -size_i {
        0
    } else if stop < 0 {
        size_i + stop + 1
    } else if stop < size_i {
        stop + 1
    } else {
        size_i
    };

    if end <= begin {
        return None;
    }
    #[allow(clippy::cast_sign_loss)]
    Some((begin as usize, end as usize))
}

#[cfg(test)]
mod tests {
    use super::{format_score, normalize_range, parse_float, parse_int};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(5, 0, -1, Some((0, 5)))]
    #[case(5, 1, 3, Some((1, 4)))]
    #[case(5, -2, -1, Some((3, 5)))]
    #[case(5, -100, 100, Some((0, 5)))]
    #[case(5, 3, 1, None)]
    #[case(5, 5, 9, None)]
    #[case(0, 0, -1, None)]
    fn range_normalisation_matches_reference_rules(
        #[case] size: usize,
        #[case] start: i64,
        #[case] stop: i64,
        #[case] expected: Option<(usize, usize)>,
    ) {
        assert_that!(normalize_range(size, start, stop), eq(expected));
    }

    #[rstest]
    fn integer_parsing_rejects_garbage() {
        assert_that!(parse_int(b"42"), ok(eq(42_i64)));
        assert_that!(parse_int(b"abc").is_err(), eq(true));
        assert_that!(parse_int(b"4.2").is_err(), eq(true));
    }

    #[rstest]
    fn float_parsing_rejects_nan() {
        assert_that!(parse_float(b"2.5"), ok(eq(2.5_f64)));
        assert_that!(parse_float(b"nan").is_err(), eq(true));
    }

    #[rstest]
    #[case(3.0, "3")]
    #[case(2.5, "2.5")]
    #[case(f64::INFINITY, "inf")]
    #[case(f64::NEG_INFINITY, "-inf")]
    fn score_formatting(#[case] score: f64, #[case] expected: &str) {
        assert_that!(format_score(score).as_str(), eq(expected));
    }
}
