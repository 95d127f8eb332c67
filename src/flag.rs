use serde::{Deserialize, Serialize};

use log::warn;

use crate::eval::{self, Detail, Reason};
use crate::flag_value::FlagValue;
use crate::rule::FlagRule;
use crate::user::User;
use crate::variation::{BucketResult, VariationIndex, VariationOrRolloutOrMalformed};

/// A named, versioned decision unit producing one of several pre-declared
/// variation values.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    pub(crate) on: bool,

    #[serde(default)]
    pub(crate) targets: Vec<Target>,
    #[serde(default)]
    pub(crate) rules: Vec<FlagRule>,
    #[serde(default)]
    pub(crate) prerequisites: Vec<Prereq>,

    pub(crate) fallthrough: VariationOrRolloutOrMalformed,
    pub(crate) off_variation: Option<VariationIndex>,
    variations: Vec<FlagValue>,

    /// Whether the flag may be served to client-side SDKs.
    #[serde(default)]
    pub client_side: bool,

    salt: String,

    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
    #[serde(default, skip_serializing_if = "crate::util::is_false")]
    pub deleted: bool,
}

/// A dependency edge: this flag requires another flag to evaluate to a
/// specific variation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Prereq {
    pub(crate) key: String,
    pub(crate) variation: VariationIndex,
}

/// A set of user keys pinned to a specific variation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub(crate) struct Target {
    pub(crate) values: Vec<String>,
    pub(crate) variation: VariationIndex,
}

impl Flag {
    /// The detail for serving the given variation index, or a malformed-flag
    /// error if the index is out of range.
    pub(crate) fn variation(&self, index: VariationIndex, reason: Reason) -> Detail<&FlagValue> {
        Detail {
            value: self.variations.get(index),
            variation_index: Some(index),
            reason,
        }
        .should_have_value(eval::Error::MalformedFlag)
    }

    /// The detail for serving the flag's off variation, which may be absent.
    pub(crate) fn off_value(&self, reason: Reason) -> Detail<&FlagValue> {
        match self.off_variation {
            Some(index) => self.variation(index, reason),
            None => Detail::empty(reason),
        }
    }

    pub(crate) fn any_target_match_variation(&self, user: &User) -> Option<VariationIndex> {
        for target in &self.targets {
            for value in &target.values {
                if value == user.key() {
                    return Some(target.variation);
                }
            }
        }
        None
    }

    pub(crate) fn resolve_variation_or_rollout(
        &self,
        vr: &VariationOrRolloutOrMalformed,
        user: &User,
    ) -> Result<BucketResult, eval::Error> {
        let vr = vr.get().map_err(|e| {
            warn!("{} in flag {}", e, self.key);
            eval::Error::MalformedFlag
        })?;
        vr.variation(&self.key, user, &self.salt)
            .ok_or(eval::Error::MalformedFlag)
    }

    /// Whether an evaluation with the given reason requires full event
    /// tracking because of experimentation settings on the flag.
    pub fn is_experimentation_enabled(&self, reason: &Reason) -> bool {
        match reason {
            _ if reason.is_in_experiment() => true,
            Reason::Fallthrough { .. } => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .map(|rule| rule.track_events)
                .unwrap_or(false),
            _ => false,
        }
    }

}
