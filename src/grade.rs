//! Grade banding for recorded marks.
//!
//! | percentage | label | weight |
//! |------------|-------|--------|
//! | >= 80      | E     | 4      |
//! | >= 70      | M     | 3      |
//! | >= 50      | A     | 2      |
//! | otherwise  | B     | 1      |
//!
//! Invalid input (missing, non-finite, negative score, non-positive max)
//! falls back to the lowest band rather than failing.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grade {
    Exceeding,
    Meeting,
    Approaching,
    Below,
}

impl Grade {
    pub fn label(self) -> &'static str {
        match self {
            Grade::Exceeding => "E",
            Grade::Meeting => "M",
            Grade::Approaching => "A",
            Grade::Below => "B",
        }
    }

    pub fn weight(self) -> i64 {
        match self {
            Grade::Exceeding => 4,
            Grade::Meeting => 3,
            Grade::Approaching => 2,
            Grade::Below => 1,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "E" => Some(Grade::Exceeding),
            "M" => Some(Grade::Meeting),
            "A" => Some(Grade::Approaching),
            "B" => Some(Grade::Below),
            _ => None,
        }
    }

    pub fn band(self) -> GradeBand {
        GradeBand {
            label: self.label(),
            weight: self.weight(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GradeBand {
    pub label: &'static str,
    pub weight: i64,
}

pub const LOWEST_BAND: GradeBand = GradeBand {
    label: "B",
    weight: 1,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GradeInputError {
    #[error("score is missing or not a number")]
    MissingScore,
    #[error("outOf is missing or not a number")]
    MissingMaxScore,
    #[error("score must not be negative")]
    NegativeScore,
    #[error("outOf must be positive")]
    NonPositiveMaxScore,
}

/// `score / max_score` as a percentage, or `None` when the inputs are outside
/// the domain banding is defined on. Dividing first keeps huge finite inputs
/// from overflowing to infinity.
pub fn percentage(score: f64, max_score: f64) -> Option<f64> {
    if !score.is_finite() || !max_score.is_finite() || score < 0.0 || max_score <= 0.0 {
        return None;
    }
    Some(score / max_score * 100.0)
}

pub fn classify(score: f64, max_score: f64) -> Grade {
    match percentage(score, max_score) {
        Some(p) if p >= 80.0 => Grade::Exceeding,
        Some(p) if p >= 70.0 => Grade::Meeting,
        Some(p) if p >= 50.0 => Grade::Approaching,
        _ => Grade::Below,
    }
}

pub fn compute_grade(score: f64, max_score: f64) -> GradeBand {
    classify(score, max_score).band()
}

pub fn compute_grade_opt(score: Option<f64>, max_score: Option<f64>) -> GradeBand {
    match (score, max_score) {
        (Some(s), Some(m)) => compute_grade(s, m),
        _ => LOWEST_BAND,
    }
}

/// Numbers pass through; strings count when they trim to a finite number.
pub fn numeric_input(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

pub fn check_grade_input(
    score: Option<f64>,
    max_score: Option<f64>,
) -> Result<(f64, f64), GradeInputError> {
    let score = score
        .filter(|s| s.is_finite())
        .ok_or(GradeInputError::MissingScore)?;
    let max_score = max_score
        .filter(|m| m.is_finite())
        .ok_or(GradeInputError::MissingMaxScore)?;
    if score < 0.0 {
        return Err(GradeInputError::NegativeScore);
    }
    if max_score <= 0.0 {
        return Err(GradeInputError::NonPositiveMaxScore);
    }
    Ok((score, max_score))
}

pub fn is_consistent(
    label: &str,
    weight: i64,
    score: Option<f64>,
    max_score: Option<f64>,
) -> bool {
    let expected = compute_grade_opt(score, max_score);
    expected.label == label && expected.weight == weight
}
