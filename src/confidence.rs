//! Risk scoring for planned changes.
//!
//! Every file's change set gets a score in `[0, 1]` built from named
//! factors. The dispatcher uses the score to gate auto-apply; a broken
//! syntax check blocks auto-apply outright, whatever the score says.

use serde::{Deserialize, Serialize};
use std::path::Path;

const BASE_SCORE: f64 = 0.5;
const MANY_TARGETS_THRESHOLD: usize = 10;

/// Coarse bands derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            ConfidenceLevel::High
        } else if score >= 0.6 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// One named contribution to the score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub impact: f64,
    pub reason: String,
}

/// The scored confidence for one file's change set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confidence {
    pub score: f64,
    pub level: ConfidenceLevel,
    pub factors: Vec<Factor>,
}

impl Confidence {
    /// Builds a confidence from its factors.
    pub fn from_factors(factors: Vec<Factor>) -> Self {
        let total: f64 = factors.iter().map(|f| f.impact).sum();
        let score = (BASE_SCORE + total).clamp(0.0, 1.0);
        Self {
            score,
            level: ConfidenceLevel::from_score(score),
            factors,
        }
    }

    /// True when a factor forbids auto-apply regardless of the score.
    pub fn blocks_auto_apply(&self) -> bool {
        self.factors.iter().any(|f| f.name == "syntax_broken_after")
    }

    /// The most conservative confidence across a batch: the minimum score
    /// decides, and blockers from any file survive into the aggregate.
    pub fn aggregate<'a, I>(per_file: I) -> Option<Confidence>
    where
        I: IntoIterator<Item = &'a Confidence>,
    {
        let mut worst: Option<&Confidence> = None;
        let mut blocked = false;
        for confidence in per_file {
            blocked |= confidence.blocks_auto_apply();
            match worst {
                Some(current) if current.score <= confidence.score => {}
                _ => worst = Some(confidence),
            }
        }
        worst.map(|w| {
            let mut factors = w.factors.clone();
            if blocked && !factors.iter().any(|f| f.name == "syntax_broken_after") {
                factors.push(Factor {
                    name: "syntax_broken_after".to_string(),
                    impact: -0.3,
                    reason: "another file in the batch failed validation".to_string(),
                });
            }
            Confidence::from_factors(factors)
        })
    }
}

/// Everything the scorer looks at for one file.
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub path: &'a Path,
    pub match_count: usize,
    pub any_exported: bool,
    pub all_nested: bool,
    /// Total bytes of the replaced spans.
    pub original_bytes: usize,
    /// Total bytes of the replacement text.
    pub replacement_bytes: usize,
    /// Outcome of the post-edit syntax check, when one ran.
    pub syntax_check: Option<bool>,
}

/// Scores one file's planned change set.
pub fn score(input: &ScoreInput) -> Confidence {
    let mut factors = Vec::new();

    if input.match_count == 1 {
        factors.push(Factor {
            name: "single_target".to_string(),
            impact: 0.2,
            reason: "exactly one match in file".to_string(),
        });
    } else if input.match_count > MANY_TARGETS_THRESHOLD {
        factors.push(Factor {
            name: "many_targets".to_string(),
            impact: -0.2,
            reason: format!("{} matches in one file", input.match_count),
        });
    }

    if input.any_exported {
        factors.push(Factor {
            name: "exported_api".to_string(),
            impact: -0.1,
            reason: "touches exported symbols".to_string(),
        });
    }

    if is_test_path(input.path) {
        factors.push(Factor {
            name: "test_file".to_string(),
            impact: 0.1,
            reason: "path looks like a test file".to_string(),
        });
    }

    let original = input.original_bytes.max(1);
    if input.replacement_bytes <= original * 2 {
        factors.push(Factor {
            name: "small_edit".to_string(),
            impact: 0.1,
            reason: "replacement stays close to original size".to_string(),
        });
    } else if input.replacement_bytes > original * 10 {
        factors.push(Factor {
            name: "large_edit".to_string(),
            impact: -0.2,
            reason: "replacement grows content more than tenfold".to_string(),
        });
    }

    if input.all_nested && input.match_count > 0 {
        factors.push(Factor {
            name: "nested_scope".to_string(),
            impact: 0.05,
            reason: "all targets sit inside enclosing declarations".to_string(),
        });
    }

    match input.syntax_check {
        Some(true) => factors.push(Factor {
            name: "syntax_valid_after".to_string(),
            impact: 0.15,
            reason: "modified content parses cleanly".to_string(),
        }),
        Some(false) => factors.push(Factor {
            name: "syntax_broken_after".to_string(),
            impact: -0.3,
            reason: "modified content fails the syntax check".to_string(),
        }),
        None => {}
    }

    Confidence::from_factors(factors)
}

fn is_test_path(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.contains("_test.") || name.contains(".test.") || name.starts_with("test_") {
        return true;
    }
    path.components().any(|c| {
        let part = c.as_os_str().to_string_lossy();
        part == "tests" || part == "test" || part == "__tests__"
    })
}
