//! Assertion engine: expected-vs-actual checks that fail loudly.
//!
//! Every check returns `HarnessResult<()>` and a failure always carries
//! the expected value, the actual value, and caller-supplied context,
//! never a bare boolean. Result-set comparison comes in two deliberate
//! flavors: order-sensitive for queries with an explicit sort, and
//! multiset (order-insensitive) for everything else, because sharded and
//! multi-engine execution legitimately reorder matching rows. The harness
//! does not pick a canonical ordering; the scenario chooses the comparator
//! that encodes the contract under test.

use crate::errors::{HarnessError, HarnessResult};
use serde_json::Value;

/// Build an assertion failure carrying full context.
pub fn fail(
    context: impl Into<String>,
    expected: impl std::fmt::Display,
    actual: impl std::fmt::Display,
) -> HarnessError {
    HarnessError::AssertionFailed {
        context: context.into(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

/// Deep structural equality of two documents with numeric coercion:
/// `1` and `1.0` compare equal, field order inside objects is ignored
/// (objects are key-addressed), array order is significant.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Assert deep document equality.
pub fn check_doc_eq(context: &str, expected: &Value, actual: &Value) -> HarnessResult<()> {
    if values_equal(expected, actual) {
        Ok(())
    } else {
        Err(fail(context, render(expected), render(actual)))
    }
}

/// Assert two result sets are equal in the same order.
pub fn check_results_eq(context: &str, expected: &[Value], actual: &[Value]) -> HarnessResult<()> {
    if expected.len() == actual.len()
        && expected.iter().zip(actual).all(|(e, a)| values_equal(e, a))
    {
        Ok(())
    } else {
        Err(fail(context, render_slice(expected), render_slice(actual)))
    }
}

/// Assert two result sets contain the same documents, ignoring order
/// (multiset semantics: duplicates must match in count).
pub fn check_results_eq_unordered(
    context: &str,
    expected: &[Value],
    actual: &[Value],
) -> HarnessResult<()> {
    if multiset_equal(expected, actual) {
        Ok(())
    } else {
        Err(fail(
            format!("{context} (order-insensitive)"),
            render_slice(expected),
            render_slice(actual),
        ))
    }
}

fn multiset_equal(expected: &[Value], actual: &[Value]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    // Quadratic pairwise matching; result sets under comparison are test
    // sized, and Value has no total order to sort by without implying one.
    let mut used = vec![false; actual.len()];
    for e in expected {
        let found = actual
            .iter()
            .enumerate()
            .find(|(i, a)| !used[*i] && values_equal(e, a));
        match found {
            Some((i, _)) => used[i] = true,
            None => return false,
        }
    }
    true
}

/// Assert `actual >= bound`.
pub fn check_gte(context: &str, actual: f64, bound: f64) -> HarnessResult<()> {
    if actual >= bound {
        Ok(())
    } else {
        Err(fail(context, format!(">= {bound}"), actual))
    }
}

/// Assert `actual <= bound`.
pub fn check_lte(context: &str, actual: f64, bound: f64) -> HarnessResult<()> {
    if actual <= bound {
        Ok(())
    } else {
        Err(fail(context, format!("<= {bound}"), actual))
    }
}

/// Assert `min <= actual <= max`, for statistical convergence checks.
pub fn check_between(context: &str, actual: f64, min: f64, max: f64) -> HarnessResult<()> {
    if actual >= min && actual <= max {
        Ok(())
    } else {
        Err(fail(context, format!("in [{min}, {max}]"), actual))
    }
}

/// Assert `actual` is within `tolerance` of `expected`.
pub fn check_approx(context: &str, actual: f64, expected: f64, tolerance: f64) -> HarnessResult<()> {
    if (actual - expected).abs() <= tolerance {
        Ok(())
    } else {
        Err(fail(context, format!("{expected} ± {tolerance}"), actual))
    }
}

/// Assert an error carries the given numeric server code.
pub fn check_error_code(context: &str, err: &HarnessError, code: i32) -> HarnessResult<()> {
    match err.server_code() {
        Some(actual) if actual == code => Ok(()),
        Some(actual) => Err(fail(context, format!("server code {code}"), actual)),
        None => Err(fail(
            context,
            format!("server code {code}"),
            format!("non-command error: {err}"),
        )),
    }
}

/// Assert an error carries the given code and its message contains the
/// given substring.
pub fn check_error_matches(
    context: &str,
    err: &HarnessError,
    code: i32,
    message_substring: &str,
) -> HarnessResult<()> {
    check_error_code(context, err, code)?;
    let message: &str = match err {
        HarnessError::CommandFailed { message, .. } => message,
        HarnessError::WrongErrorCode { message, .. } => message,
        _ => "",
    };
    if message.contains(message_substring) {
        Ok(())
    } else {
        Err(fail(
            context,
            format!("message containing {message_substring:?}"),
            message,
        ))
    }
}

/// Assert an event occurred at least `min` times.
pub fn check_count_at_least(context: &str, actual: usize, min: usize) -> HarnessResult<()> {
    if actual >= min {
        Ok(())
    } else {
        Err(fail(context, format!("at least {min} occurrences"), actual))
    }
}

/// Assert an event occurred exactly `n` times.
pub fn check_count_exact(context: &str, actual: usize, n: usize) -> HarnessResult<()> {
    if actual == n {
        Ok(())
    } else {
        Err(fail(context, format!("exactly {n} occurrences"), actual))
    }
}

fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}

fn render_slice(values: &[Value]) -> String {
    render(&Value::Array(values.to_vec()))
}
