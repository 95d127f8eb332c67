use std::collections::HashSet;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::store::Store;
use crate::user::User;
use crate::variation::VariationIndex;

/// The result of evaluating a prerequisite flag while evaluating its
/// dependent.
pub struct PrerequisiteEvent {
    /// Key of the flag whose evaluation required the prerequisite.
    pub target_flag_key: String,
    /// The user the evaluation was performed against.
    pub user: User,
    /// The prerequisite flag that was evaluated.
    pub prerequisite_flag: Flag,
    /// The prerequisite's own evaluation result.
    pub prerequisite_result: Detail<FlagValue>,
}

/// Receives the result of every prerequisite evaluation performed during
/// [evaluate].
///
/// The evaluator knows nothing about analytics; a caller that emits events
/// supplies a recorder and turns these into whatever its pipeline needs.
/// Prerequisite events are recorded bottom-up: each prerequisite's event
/// arrives before the flag that depended on it produces a result.
pub trait PrerequisiteEventRecorder {
    /// Record the result of a prerequisite flag evaluation.
    fn record(&self, event: PrerequisiteEvent);
}

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;
const PREALLOCATED_SEGMENT_CHAIN_SIZE: usize = 20;

// Shared traversal state: the set of flags and segments currently being
// visited, used to break prerequisite and segment reference cycles.
pub(crate) struct EvaluationStack {
    pub(crate) prerequisite_flag_chain: HashSet<String>,
    pub(crate) segment_chain: HashSet<String>,
}

impl Default for EvaluationStack {
    fn default() -> Self {
        // Preallocate so typical nesting depths never reallocate mid-walk.
        Self {
            prerequisite_flag_chain: HashSet::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
            segment_chain: HashSet::with_capacity(PREALLOCATED_SEGMENT_CHAIN_SIZE),
        }
    }
}

/// Evaluates a feature flag for a user against the given read view.
///
/// Evaluation is pure: it performs no I/O beyond reading flags and segments
/// from the store view, and identical inputs always produce identical
/// results. The optional recorder is notified of any prerequisite
/// evaluations that were performed along the way, including failed ones.
pub fn evaluate<'a>(
    store: &dyn Store,
    flag: &'a Flag,
    user: &User,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
) -> Detail<&'a FlagValue> {
    if user.key().is_empty() {
        return Detail::err(Error::UserNotSpecified);
    }

    let mut evaluation_stack = EvaluationStack::default();
    evaluate_internal(
        store,
        flag,
        user,
        prerequisite_event_recorder,
        &mut evaluation_stack,
    )
}

fn evaluate_internal<'a>(
    store: &dyn Store,
    flag: &'a Flag,
    user: &User,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
    evaluation_stack: &mut EvaluationStack,
) -> Detail<&'a FlagValue> {
    if !flag.on {
        return flag.off_value(Reason::Off);
    }

    if evaluation_stack.prerequisite_flag_chain.contains(&flag.key) {
        warn!(
            "prerequisite relationship to {} caused a circular reference; \
             this is probably a temporary condition due to an incomplete update",
            flag.key
        );
        return Detail::err(Error::MalformedFlag);
    }

    evaluation_stack
        .prerequisite_flag_chain
        .insert(flag.key.clone());

    for prereq in &flag.prerequisites {
        let prereq_flag = match store.flag(&prereq.key) {
            Some(f) => f,
            None => {
                return flag.off_value(Reason::PrerequisiteFailed {
                    prerequisite_key: prereq.key.clone(),
                })
            }
        };

        if evaluation_stack
            .prerequisite_flag_chain
            .contains(&prereq_flag.key)
        {
            return Detail::err(Error::MalformedFlag);
        }

        let prereq_result = evaluate_internal(
            store,
            &prereq_flag,
            user,
            prerequisite_event_recorder,
            evaluation_stack,
        );

        // An error in the prerequisite chain is the dependent's error too.
        if let Reason::Error { error } = &prereq_result.reason {
            return Detail::err(*error);
        }

        let prereq_variation_index = prereq_result.variation_index;

        if let Some(recorder) = prerequisite_event_recorder {
            recorder.record(PrerequisiteEvent {
                target_flag_key: flag.key.clone(),
                user: user.clone(),
                prerequisite_flag: prereq_flag.clone(),
                prerequisite_result: prereq_result.map(|v| v.clone()),
            });
        }

        if !prereq_flag.on || prereq_variation_index != Some(prereq.variation) {
            return flag.off_value(Reason::PrerequisiteFailed {
                prerequisite_key: prereq.key.clone(),
            });
        }
    }

    evaluation_stack.prerequisite_flag_chain.remove(&flag.key);

    if let Some(variation_index) = flag.any_target_match_variation(user) {
        return flag.variation(variation_index, Reason::TargetMatch);
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        if rule.matches(user, store, evaluation_stack) {
            return match flag.resolve_variation_or_rollout(&rule.variation_or_rollout, user) {
                Ok(bucket_result) => flag.variation(
                    bucket_result.variation_index,
                    Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment: bucket_result.in_experiment,
                    },
                ),
                Err(e) => Detail::err(e),
            };
        }
    }

    match flag.resolve_variation_or_rollout(&flag.fallthrough, user) {
        Ok(bucket_result) => flag.variation(
            bucket_result.variation_index,
            Reason::Fallthrough {
                in_experiment: bucket_result.in_experiment,
            },
        ),
        Err(e) => Detail::err(e),
    }
}

/// An evaluation result: the value, its variation index, and an explanation
/// of how it was chosen.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// One of the flag's variation values, or None when no appropriate
    /// fallback value was configured.
    pub value: Option<T>,

    /// The index of the returned value within the flag's variation list.
    /// None when the result did not come from a variation, e.g. on error.
    pub variation_index: Option<VariationIndex>,

    /// Why the evaluation produced this value.
    pub reason: Reason,
}

impl<T> Detail<T> {
    /// A detail with no value or variation index, only a reason.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
        }
    }

    /// A detail carrying an error reason and no value.
    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// A detail carrying an error reason and a caller-supplied default
    /// value, with no variation index.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            variation_index: None,
            reason: Reason::Error { error },
        }
    }

    /// Applies `f` to the value, if present.
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Replaces the reason with the given error if the detail has no value.
    pub fn should_have_value(mut self, e: Error) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
        }
        self
    }

    /// Fills in `default` (clearing the variation index) if the detail has
    /// no value. The reason is left untouched.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
        }
        self
    }

    /// Like [Detail::or], but computes the default lazily.
    pub fn or_else<F>(mut self, default: F) -> Detail<T>
    where
        F: Fn() -> T,
    {
        if self.value.is_none() {
            self.value = Some(default());
            self.variation_index = None;
        }
        self
    }
}

/// Why a flag evaluation produced its value.
///
/// The serialized form of each variant is a stable identifier consumed by
/// downstream analytics; it never changes shape.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag was off, so its configured off variation was returned.
    Off,
    /// The user's key was specifically targeted by the flag.
    TargetMatch,
    /// The user matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the matched rule.
        rule_index: usize,
        /// The matched rule's id, if it has one.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        rule_id: String,
        /// True when the variation came from a tracked experiment bucket.
        #[serde(default, skip_serializing_if = "crate::util::is_false")]
        in_experiment: bool,
    },
    /// A prerequisite flag was off or served the wrong variation, so this
    /// flag returned its off variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// Key of the prerequisite that failed.
        prerequisite_key: String,
    },
    /// The flag was on but the user matched no target or rule.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        /// True when the variation came from a tracked experiment bucket.
        #[serde(default, skip_serializing_if = "crate::util::is_false")]
        in_experiment: bool,
    },
    /// The flag could not be evaluated; the caller's default value applies.
    Error {
        /// What kind of failure prevented evaluation.
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    /// Whether this reason represents an assignment inside an ongoing
    /// experiment.
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            Reason::Fallthrough { in_experiment } => *in_experiment,
            _ => false,
        }
    }
}

/// The kinds of failure that prevent a flag from being evaluated.
///
/// These surface through [Reason::Error]; the evaluator never panics or
/// returns a Rust error for them.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// Evaluation was attempted before the client received its first full
    /// ruleset.
    ClientNotReady,
    /// The requested flag key does not exist.
    FlagNotFound,
    /// The user was missing or had an empty key.
    UserNotSpecified,
    /// The flag data was internally inconsistent, e.g. a rule named a
    /// nonexistent variation.
    MalformedFlag,
    /// The value was requested as a type the flag does not serve.
    WrongType,
    /// An unexpected internal failure stopped evaluation.
    Exception,
}
