use std::collections::{HashMap, HashSet};

use crate::flag::Flag;
use crate::store::{AllData, DataItem, DataKind};

/// Orders a full ruleset so that a consumer writing items one at a time
/// always sees dependencies before dependents: segments first (flags may
/// reference them), then flags with every prerequisite ahead of the flags
/// that require it.
///
/// Prerequisite cycles should not exist in real data, but initialization
/// must never hang on malformed input: a back-edge to a flag already on the
/// visit path is simply dropped.
pub(crate) fn sort_all_data(data: AllData) -> Vec<(DataKind, Vec<(String, DataItem)>)> {
    let segments = data
        .segments
        .into_iter()
        .map(|(key, segment)| (key, DataItem::from(segment)))
        .collect();

    let mut keys: Vec<&String> = data.flags.keys().collect();
    keys.sort();

    let mut ordered: Vec<(String, DataItem)> = Vec::with_capacity(data.flags.len());
    let mut visited: HashSet<String> = HashSet::with_capacity(data.flags.len());
    let mut in_progress: HashSet<String> = HashSet::new();

    for key in keys {
        visit(key, &data.flags, &mut visited, &mut in_progress, &mut ordered);
    }

    vec![(DataKind::Segment, segments), (DataKind::Flag, ordered)]
}

fn visit(
    key: &str,
    flags: &HashMap<String, Flag>,
    visited: &mut HashSet<String>,
    in_progress: &mut HashSet<String>,
    ordered: &mut Vec<(String, DataItem)>,
) {
    if visited.contains(key) || in_progress.contains(key) {
        return;
    }
    let flag = match flags.get(key) {
        Some(flag) => flag,
        // prerequisites naming absent flags are an evaluation-time concern
        None => return,
    };

    in_progress.insert(key.to_string());
    for prereq in &flag.prerequisites {
        visit(&prereq.key, flags, visited, in_progress, ordered);
    }
    in_progress.remove(key);

    visited.insert(key.to_string());
    ordered.push((key.to_string(), DataItem::from(flag.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn flag_with_prereqs(key: &str, prereqs: &[&str]) -> Flag {
        let prerequisites: Vec<serde_json::Value> = prereqs
            .iter()
            .map(|p| serde_json::json!({"key": p, "variation": 0}))
            .collect();
        serde_json::from_value(serde_json::json!({
            "key": key,
            "version": 1,
            "on": true,
            "prerequisites": prerequisites,
            "fallthrough": {"variation": 0},
            "variations": [true, false],
            "salt": "salty"
        }))
        .unwrap()
    }

    fn position(ordered: &[(String, DataItem)], key: &str) -> usize {
        ordered
            .iter()
            .position(|(k, _)| k == key)
            .unwrap_or_else(|| panic!("{} missing from ordering", key))
    }

    fn sorted_flags(data: AllData) -> Vec<(String, DataItem)> {
        let mut result = sort_all_data(data);
        assert_eq!(result[0].0, DataKind::Segment);
        assert_eq!(result[1].0, DataKind::Flag);
        result.remove(1).1
    }

    #[test]
    fn prerequisites_come_first() {
        let data = AllData {
            flags: hashmap! {
                "a".into() => flag_with_prereqs("a", &["b", "c"]),
                "b".into() => flag_with_prereqs("b", &["c", "e"]),
                "c".into() => flag_with_prereqs("c", &[]),
                "d".into() => flag_with_prereqs("d", &[]),
                "e".into() => flag_with_prereqs("e", &[]),
            },
            segments: hashmap! {},
        };
        let ordered = sorted_flags(data);

        assert_eq!(ordered.len(), 5);
        assert!(position(&ordered, "b") < position(&ordered, "a"));
        assert!(position(&ordered, "c") < position(&ordered, "a"));
        assert!(position(&ordered, "c") < position(&ordered, "b"));
        assert!(position(&ordered, "e") < position(&ordered, "b"));
    }

    #[test]
    fn cycles_do_not_hang_and_keep_every_flag() {
        let data = AllData {
            flags: hashmap! {
                "a".into() => flag_with_prereqs("a", &["b"]),
                "b".into() => flag_with_prereqs("b", &["a"]),
                "c".into() => flag_with_prereqs("c", &["c"]),
            },
            segments: hashmap! {},
        };
        let ordered = sorted_flags(data);
        assert_eq!(ordered.len(), 3);
    }

    #[test]
    fn missing_prerequisite_targets_are_skipped() {
        let data = AllData {
            flags: hashmap! {
                "a".into() => flag_with_prereqs("a", &["ghost"]),
            },
            segments: hashmap! {},
        };
        let ordered = sorted_flags(data);
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn segments_precede_flags() {
        let data = AllData {
            flags: hashmap! {"a".into() => flag_with_prereqs("a", &[])},
            segments: hashmap! {
                "s".into() => crate::Segment {
                    key: "s".into(),
                    version: 1,
                    ..crate::Segment::default()
                },
            },
        };
        let result = sort_all_data(data);
        assert_eq!(result[0].0, DataKind::Segment);
        assert_eq!(result[0].1.len(), 1);
        assert_eq!(result[1].0, DataKind::Flag);
    }
}
