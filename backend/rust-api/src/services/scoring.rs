//! Scoring engine: pure functions over question weights and per-question scores.

use crate::models::{AttemptStatus, Question};
use crate::utils::time::round2;

pub const FULL_SCORE: f64 = 100.0;

/// Σ(score × weight) / Σ(weight) over the entries that carry a score.
///
/// Ungraded entries contribute to neither sum, so a partially graded attempt
/// is scored on its graded subset. Returns 0 when nothing is graded. The
/// result is not rounded; callers round once with [`round2`] where the value
/// is persisted or returned.
pub fn weighted_score<I>(entries: I) -> f64
where
    I: IntoIterator<Item = (f64, Option<f64>)>,
{
    let (numerator, denominator) = entries
        .into_iter()
        .filter_map(|(weight, score)| score.map(|s| (weight, s)))
        .fold((0.0, 0.0), |(num, den), (weight, score)| {
            (num + score * weight, den + weight)
        });

    if denominator <= 0.0 {
        return 0.0;
    }
    (numerator / denominator).clamp(0.0, FULL_SCORE)
}

/// Exact-match grading for objective questions: trimmed, case-insensitive
/// comparison against the trimmed answer key. Blank responses and questions
/// without a key always score 0.
pub fn grade_objective(question: &Question, response: Option<&str>) -> f64 {
    let response = match response.map(str::trim) {
        Some(r) if !r.is_empty() => r,
        _ => return 0.0,
    };
    let key = match question.correct_answer.as_deref().map(str::trim) {
        Some(k) if !k.is_empty() => k,
        _ => return 0.0,
    };

    if response.to_lowercase() == key.to_lowercase() {
        FULL_SCORE
    } else {
        0.0
    }
}

/// Final verdict for a fully graded score. The score is compared after the
/// same two-decimal rounding it is persisted with.
pub fn verdict(score: f64, pass_threshold: f64) -> AttemptStatus {
    if round2(score) >= pass_threshold {
        AttemptStatus::Passed
    } else {
        AttemptStatus::Failed
    }
}
