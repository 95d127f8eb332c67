use serde::{Deserialize, Serialize};

use crate::user::User;

/// An index into a flag's ordered list of variation values.
///
/// The index, not the value, is the stable identifier reported to analytics.
pub type VariationIndex = usize;

pub(crate) type VariationWeight = f32;

/// The outcome of resolving a [VariationOrRollout] for a user.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketResult {
    /// The variation index the user was assigned.
    pub variation_index: VariationIndex,
    /// True when the assignment came from an experiment bucket that is part
    /// of the experiment's analysis.
    pub in_experiment: bool,
}

/// Either a fixed variation or a percentage rollout.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VariationOrRollout {
    /// A fixed variation index.
    Variation(VariationIndex),
    /// A deterministic percentage rollout.
    Rollout(Rollout),
}

/// Distinguishes plain rollouts from experiments.
///
/// Experiment assignments are flagged in the evaluation reason so analytics
/// can attribute them, except for buckets marked untracked.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    Rollout,
    Experiment,
}

impl Default for RolloutKind {
    fn default() -> Self {
        RolloutKind::Rollout
    }
}

/// A probabilistic assignment of users to variations by consistent hashing.
///
/// Weights are expressed in hundred-thousandths and are expected to sum to
/// 100000 across the variation list.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub(crate) kind: RolloutKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) bucket_by: Option<String>,
    pub(crate) variations: Vec<WeightedVariation>,
}

/// One slice of a rollout: a variation index and the weight of its bucket.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    pub weight: VariationWeight,
    /// Experiment buckets marked untracked do not count as being in the
    /// experiment.
    #[serde(default, skip_serializing_if = "crate::util::is_false")]
    pub untracked: bool,
}

impl WeightedVariation {
    fn as_result(&self, kind: RolloutKind) -> BucketResult {
        BucketResult {
            variation_index: self.variation,
            in_experiment: kind == RolloutKind::Experiment && !self.untracked,
        }
    }
}

impl VariationOrRollout {
    /// Resolves to a concrete variation for the user, bucketing by the
    /// rollout's attribute (default `key`) under the given hash key and salt.
    ///
    /// Returns None for a rollout whose weights do not cover the user's
    /// bucket, which callers treat as a malformed flag.
    pub(crate) fn variation(
        &self,
        bucketing_key: &str,
        user: &User,
        salt: &str,
    ) -> Option<BucketResult> {
        match self {
            VariationOrRollout::Variation(index) => Some(BucketResult {
                variation_index: *index,
                in_experiment: false,
            }),
            VariationOrRollout::Rollout(rollout) => {
                let bucket = user.bucket(bucketing_key, rollout.bucket_by.as_deref(), salt);
                let mut sum = 0.0;
                for weighted_variation in &rollout.variations {
                    sum += weighted_variation.weight / 100_000.0;
                    if bucket < sum {
                        return Some(weighted_variation.as_result(rollout.kind));
                    }
                }
                None
            }
        }
    }
}

/// Wrapper that defers malformed variation-or-rollout shapes to evaluation
/// time instead of failing the whole flag at parse time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub(crate) enum VariationOrRolloutOrMalformed {
    VariationOrRollout(VariationOrRollout),
    Malformed(serde_json::Value),
}

impl VariationOrRolloutOrMalformed {
    pub(crate) fn get(&self) -> Result<&VariationOrRollout, String> {
        match self {
            VariationOrRolloutOrMalformed::VariationOrRollout(v) => Ok(v),
            VariationOrRolloutOrMalformed::Malformed(v) => {
                Err(format!("malformed variation or rollout: {}", v))
            }
        }
    }
}

impl From<VariationOrRollout> for VariationOrRolloutOrMalformed {
    fn from(vor: VariationOrRollout) -> VariationOrRolloutOrMalformed {
        VariationOrRolloutOrMalformed::VariationOrRollout(vor)
    }
}
