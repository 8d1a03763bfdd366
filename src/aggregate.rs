//! Combines per-side predictions into one vehicle-level verdict.
//!
//! Every supplied view counts equally: the overall probability on each axis is
//! the plain mean over the views that produced a prediction, thresholded with
//! [`DECISION_THRESHOLD`](crate::config::DECISION_THRESHOLD). Views that failed
//! stay in the breakdown so callers can see what was left out.

use crate::config::exceeds_threshold;
use crate::error::{CarStateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Front,
    Rear,
    Left,
    Right,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::Front, Side::Rear, Side::Left, Side::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Front => "front",
            Side::Rear => "rear",
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cleanliness {
    Clean,
    Dirty,
}

impl Cleanliness {
    pub fn from_probability(probability: f32) -> Self {
        if exceeds_threshold(probability) {
            Cleanliness::Dirty
        } else {
            Cleanliness::Clean
        }
    }
}

impl fmt::Display for Cleanliness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cleanliness::Clean => "clean",
            Cleanliness::Dirty => "dirty",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integrity {
    Intact,
    Damaged,
}

impl Integrity {
    pub fn from_probability(probability: f32) -> Self {
        if exceeds_threshold(probability) {
            Integrity::Damaged
        } else {
            Integrity::Intact
        }
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Integrity::Intact => "intact",
            Integrity::Damaged => "damaged",
        })
    }
}

/// Result of running the model on one photograph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewPrediction {
    pub cleanliness: Cleanliness,
    pub integrity: Integrity,
    pub cleanliness_prob: f32,
    pub integrity_prob: f32,
}

impl ViewPrediction {
    pub fn from_probabilities(cleanliness_prob: f32, integrity_prob: f32) -> Self {
        Self {
            cleanliness: Cleanliness::from_probability(cleanliness_prob),
            integrity: Integrity::from_probability(integrity_prob),
            cleanliness_prob,
            integrity_prob,
        }
    }
}

/// Up to one photograph per side; absent sides are simply `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleViews {
    pub front: Option<PathBuf>,
    pub rear: Option<PathBuf>,
    pub left: Option<PathBuf>,
    pub right: Option<PathBuf>,
}

impl VehicleViews {
    pub fn get(&self, side: Side) -> Option<&Path> {
        match side {
            Side::Front => self.front.as_deref(),
            Side::Rear => self.rear.as_deref(),
            Side::Left => self.left.as_deref(),
            Side::Right => self.right.as_deref(),
        }
    }

    /// Supplied views in front, rear, left, right order.
    pub fn supplied(&self) -> Vec<(Side, &Path)> {
        Side::ALL
            .into_iter()
            .filter_map(|side| self.get(side).map(|path| (side, path)))
            .collect()
    }
}

#[derive(Debug)]
pub struct ViewOutcome {
    pub side: Side,
    pub result: Result<ViewPrediction>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewDetail {
    Predicted { side: Side, prediction: ViewPrediction },
    Failed { side: Side, error: String },
}

impl ViewDetail {
    pub fn side(&self) -> Side {
        match self {
            ViewDetail::Predicted { side, .. } | ViewDetail::Failed { side, .. } => *side,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub cleanliness: Cleanliness,
    pub integrity: Integrity,
    pub avg_cleanliness_prob: f32,
    pub avg_integrity_prob: f32,
    pub views: Vec<ViewDetail>,
}

impl AggregateReport {
    pub fn predicted_views(&self) -> usize {
        self.views
            .iter()
            .filter(|v| matches!(v, ViewDetail::Predicted { .. }))
            .count()
    }

    /// Structured form: probabilities as percentages rounded to one decimal.
    pub fn to_json(&self) -> serde_json::Value {
        let details: Vec<DetailJson> = self
            .views
            .iter()
            .map(|view| match view {
                ViewDetail::Predicted { side, prediction } => DetailJson::Predicted {
                    side: *side,
                    cleanliness: prediction.cleanliness,
                    cleanliness_probability: as_percent(prediction.cleanliness_prob),
                    integrity: prediction.integrity,
                    integrity_probability: as_percent(prediction.integrity_prob),
                },
                ViewDetail::Failed { side, error } => DetailJson::Failed {
                    side: *side,
                    error: error.clone(),
                },
            })
            .collect();

        serde_json::json!({
            "overall": VerdictJson::new(
                self.cleanliness,
                self.avg_cleanliness_prob,
                self.integrity,
                self.avg_integrity_prob,
            ),
            "details": details,
        })
    }
}

impl fmt::Display for AggregateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Overall cleanliness: {} (dirt probability: {:.1}%)",
            self.cleanliness,
            self.avg_cleanliness_prob * 100.0
        )?;
        writeln!(
            f,
            "Overall integrity: {} (damage probability: {:.1}%)",
            self.integrity,
            self.avg_integrity_prob * 100.0
        )?;
        writeln!(f)?;
        writeln!(f, "Per side:")?;
        for view in &self.views {
            match view {
                ViewDetail::Predicted { side, prediction } => writeln!(
                    f,
                    "{}: cleanliness - {} ({:.1}%), integrity - {} ({:.1}%)",
                    side,
                    prediction.cleanliness,
                    prediction.cleanliness_prob * 100.0,
                    prediction.integrity,
                    prediction.integrity_prob * 100.0
                )?,
                ViewDetail::Failed { side, error } => writeln!(f, "{}: failed - {}", side, error)?,
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct VerdictJson {
    cleanliness: Cleanliness,
    cleanliness_probability: f64,
    integrity: Integrity,
    integrity_probability: f64,
}

impl VerdictJson {
    fn new(cleanliness: Cleanliness, clean_prob: f32, integrity: Integrity, integ_prob: f32) -> Self {
        Self {
            cleanliness,
            cleanliness_probability: as_percent(clean_prob),
            integrity,
            integrity_probability: as_percent(integ_prob),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum DetailJson {
    Predicted {
        side: Side,
        cleanliness: Cleanliness,
        cleanliness_probability: f64,
        integrity: Integrity,
        integrity_probability: f64,
    },
    Failed {
        side: Side,
        error: String,
    },
}

fn as_percent(probability: f32) -> f64 {
    (probability as f64 * 1000.0).round() / 10.0
}

/// Averages the successful views; fails with [`CarStateError::NoInput`] when none succeeded.
pub fn aggregate(outcomes: Vec<ViewOutcome>) -> Result<AggregateReport> {
    let mut views = Vec::with_capacity(outcomes.len());
    let mut clean_sum = 0.0f32;
    let mut integ_sum = 0.0f32;
    let mut count = 0usize;

    for outcome in outcomes {
        match outcome.result {
            Ok(prediction) => {
                clean_sum += prediction.cleanliness_prob;
                integ_sum += prediction.integrity_prob;
                count += 1;
                views.push(ViewDetail::Predicted {
                    side: outcome.side,
                    prediction,
                });
            }
            Err(e) => views.push(ViewDetail::Failed {
                side: outcome.side,
                error: e.to_string(),
            }),
        }
    }

    if count == 0 {
        return Err(CarStateError::NoInput);
    }

    let avg_cleanliness_prob = clean_sum / count as f32;
    let avg_integrity_prob = integ_sum / count as f32;

    Ok(AggregateReport {
        cleanliness: Cleanliness::from_probability(avg_cleanliness_prob),
        integrity: Integrity::from_probability(avg_integrity_prob),
        avg_cleanliness_prob,
        avg_integrity_prob,
        views,
    })
}
