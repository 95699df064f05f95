// crates/core/src/stats.rs
//! Small statistics helpers for effectiveness measurement.

/// Chi-squared critical value at p < 0.05 with one degree of freedom.
pub const CHI2_CRITICAL_P05: f64 = 3.841;

/// 2×2 chi-squared statistic for occurrence counts before/after a change.
///
/// Cells: (occurred, not-occurred) × (before, after), with totals taken from
/// the session counts. Returns 0 when any marginal is zero, so degenerate
/// tables are never significant.
pub fn chi_squared_2x2(
    occurred_before: i64,
    sessions_before: i64,
    occurred_after: i64,
    sessions_after: i64,
) -> f64 {
    let a = occurred_before as f64;
    let b = (sessions_before - occurred_before).max(0) as f64;
    let c = occurred_after as f64;
    let d = (sessions_after - occurred_after).max(0) as f64;

    let n = a + b + c + d;
    let row1 = a + b;
    let row2 = c + d;
    let col1 = a + c;
    let col2 = b + d;
    if n == 0.0 || row1 == 0.0 || row2 == 0.0 || col1 == 0.0 || col2 == 0.0 {
        return 0.0;
    }

    let numerator = (a * d - b * c).powi(2) * n;
    numerator / (row1 * row2 * col1 * col2)
}

/// Whether the 2×2 table is significant at p < 0.05.
pub fn is_significant(
    occurred_before: i64,
    sessions_before: i64,
    occurred_after: i64,
    sessions_after: i64,
) -> bool {
    chi_squared_2x2(occurred_before, sessions_before, occurred_after, sessions_after)
        > CHI2_CRITICAL_P05
}

/// Percentage improvement between two occurrence rates.
///
/// `(before − after) / before × 100`; 0 when the before rate is 0 so the
/// result is never NaN or infinite.
pub fn improvement_pct(before_rate: f64, after_rate: f64) -> f64 {
    if before_rate == 0.0 {
        return 0.0;
    }
    (before_rate - after_rate) / before_rate * 100.0
}
