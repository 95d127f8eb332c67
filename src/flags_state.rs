use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::eval::{evaluate, Reason};
use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::store::{DataItem, DataKind, DataStore, StoreView};
use crate::user::User;
use crate::variation::VariationIndex;

/// Options for [all_flags_state].
#[derive(Clone, Copy, Debug, Default)]
pub struct FlagsStateOptions {
    /// Include only flags marked as visible to client-side SDKs.
    pub client_side_only: bool,
    /// Include the evaluation reason for every flag, not just tracked ones.
    pub with_reasons: bool,
    /// Omit version and reason metadata for flags that do not currently
    /// require event tracking, shrinking the payload.
    pub details_only_for_tracked_flags: bool,
}

/// Per-flag metadata inside a [FlagsState] envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<VariationIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "crate::util::is_false")]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "crate::util::is_false")]
    pub track_reason: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

/// A point-in-time evaluation of every flag for one user, in the envelope
/// shape client-side SDKs bootstrap from: flag values at the top level, with
/// `$flagsState` metadata and a `$valid` marker alongside.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlagsState {
    #[serde(flatten)]
    evaluations: HashMap<String, Option<FlagValue>>,
    #[serde(rename = "$flagsState")]
    flags_state: HashMap<String, FlagMetadata>,
    #[serde(rename = "$valid")]
    valid: bool,
}

impl FlagsState {
    fn invalid() -> Self {
        Self {
            evaluations: HashMap::new(),
            flags_state: HashMap::new(),
            valid: false,
        }
    }

    /// False when the snapshot could not be produced at all, e.g. before
    /// the client is initialized.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The evaluated value for a flag key, if the flag was in the snapshot
    /// and produced a value.
    pub fn value(&self, key: &str) -> Option<&FlagValue> {
        self.evaluations.get(key).and_then(|v| v.as_ref())
    }

    /// The metadata recorded for a flag key.
    pub fn metadata(&self, key: &str) -> Option<&FlagMetadata> {
        self.flags_state.get(key)
    }

    /// Number of flags in the snapshot.
    pub fn len(&self) -> usize {
        self.evaluations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluations.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Evaluates every live flag in the store against the user.
///
/// Individual flags that fail (a failed prerequisite, malformed data) land
/// in the snapshot with their error reason; they never abort the rest. A
/// snapshot taken before the store is initialized, or for a user with an
/// empty key, is marked invalid and empty.
pub fn all_flags_state(
    store: &dyn DataStore,
    user: &User,
    options: FlagsStateOptions,
) -> FlagsState {
    if user.key().is_empty() || !store.initialized() {
        return FlagsState::invalid();
    }

    let all_flags = match store.get_all(DataKind::Flag) {
        Ok(all) => all,
        Err(_) => return FlagsState::invalid(),
    };

    let view = StoreView(store);
    let mut evaluations = HashMap::with_capacity(all_flags.len());
    let mut flags_state = HashMap::with_capacity(all_flags.len());

    for (key, item) in all_flags {
        let flag = match item {
            DataItem::Flag(flag) => flag,
            _ => continue,
        };
        if options.client_side_only && !flag.client_side {
            continue;
        }

        let detail = evaluate(&view, &flag, user, None);
        let metadata = flag_metadata(&flag, detail.variation_index, &detail.reason, &options);

        evaluations.insert(key.clone(), detail.value.cloned());
        flags_state.insert(key, metadata);
    }

    FlagsState {
        evaluations,
        flags_state,
        valid: true,
    }
}

fn flag_metadata(
    flag: &Flag,
    variation: Option<VariationIndex>,
    reason: &Reason,
    options: &FlagsStateOptions,
) -> FlagMetadata {
    let requires_experiment_data = flag.is_experimentation_enabled(reason);
    let track_events = flag.track_events || requires_experiment_data;
    let currently_debugging = flag
        .debug_events_until_date
        .map(|until| until > now_millis())
        .unwrap_or(false);

    let omit_details = options.details_only_for_tracked_flags
        && !(track_events || requires_experiment_data || currently_debugging);

    let reason = if (options.with_reasons || requires_experiment_data) && !omit_details {
        Some(reason.clone())
    } else {
        None
    };

    FlagMetadata {
        variation,
        version: if omit_details {
            None
        } else {
            Some(flag.version)
        },
        reason,
        track_events,
        track_reason: requires_experiment_data,
        debug_events_until_date: flag.debug_events_until_date,
    }
}
