use log::warn;
use serde::{Deserialize, Serialize};

use crate::eval::EvaluationStack;
use crate::rule::Clause;
use crate::store::Store;
use crate::user::User;
use crate::variation::VariationWeight;

/// A named, versioned collection defining user-set membership by inclusion
/// lists, exclusion lists, and rules.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub(crate) rules: Vec<SegmentRule>,
    #[serde(default)]
    pub(crate) salt: String,

    #[serde(default, skip_serializing_if = "crate::util::is_false")]
    pub deleted: bool,
}

/// A membership rule: clauses that must all match, with an optional weight
/// that admits only a deterministic fraction of the matching users.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SegmentRule {
    pub(crate) clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) weight: Option<VariationWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) bucket_by: Option<String>,
}

impl Segment {
    /// Tests whether the user belongs to this segment.
    ///
    /// Inclusion lists win over exclusion lists, which win over rules. Rules
    /// may themselves reference other segments through `segmentMatch`
    /// clauses; a reference back into a segment currently being tested is a
    /// cycle and counts as a non-match.
    pub(crate) fn contains(
        &self,
        user: &User,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> bool {
        if evaluation_stack.segment_chain.contains(&self.key) {
            warn!(
                "segment rule referencing segment {} caused a circular reference; \
                 this is probably a temporary condition due to an incomplete update",
                self.key
            );
            return false;
        }

        let user_key = user.key().to_string();

        if self.included.contains(&user_key) {
            return true;
        }
        if self.excluded.contains(&user_key) {
            return false;
        }

        evaluation_stack.segment_chain.insert(self.key.clone());
        let matched = self
            .rules
            .iter()
            .any(|rule| rule.matches(user, &self.key, &self.salt, store, evaluation_stack));
        evaluation_stack.segment_chain.remove(&self.key);

        matched
    }
}

impl SegmentRule {
    pub(crate) fn matches(
        &self,
        user: &User,
        segment_key: &str,
        salt: &str,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> bool {
        for clause in &self.clauses {
            if !clause.matches(user, store, evaluation_stack) {
                return false;
            }
        }

        // An absent weight admits every matching user; a present weight is a
        // secondary bucket filter keyed by the segment itself.
        match self.weight {
            Some(weight) if weight >= 0.0 => {
                let bucket = user.bucket(segment_key, self.bucket_by.as_deref(), salt);
                bucket < weight / 100_000.0
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::AttributeValue;

    // A store holding exactly one segment, for driving membership directly.
    struct SingleSegmentStore(Segment);

    impl Store for SingleSegmentStore {
        fn flag(&self, _flag_key: &str) -> Option<crate::Flag> {
            None
        }
        fn segment(&self, segment_key: &str) -> Option<Segment> {
            if self.0.key == segment_key {
                Some(self.0.clone())
            } else {
                None
            }
        }
    }

    fn assert_segment_match(segment: &Segment, user: &User, expected: bool) {
        let store = SingleSegmentStore(segment.clone());
        let mut stack = EvaluationStack::default();
        assert_eq!(segment.contains(user, &store, &mut stack), expected);
        assert!(stack.segment_chain.is_empty());
    }

    fn new_segment() -> Segment {
        Segment {
            key: "segkey".to_string(),
            version: 1,
            included: vec![],
            excluded: vec![],
            rules: vec![],
            salt: "salty".to_string(),
            deleted: false,
        }
    }

    fn jane_rule(weight: Option<f32>, bucket_by: Option<String>) -> SegmentRule {
        SegmentRule {
            clauses: vec![Clause::new_match(
                "name",
                AttributeValue::String("Jane".to_string()),
            )],
            weight,
            bucket_by,
        }
    }

    fn thirty_percent_rule(bucket_by: Option<String>) -> SegmentRule {
        SegmentRule {
            clauses: vec![Clause::new_match(
                "key",
                AttributeValue::String(".".to_string()),
            )],
            weight: Some(30_000.0),
            bucket_by,
        }
    }

    #[test]
    fn segment_rule_parse() {
        let rule: SegmentRule =
            serde_json::from_str(r#"{"clauses": [], "weight": null, "bucketBy": null}"#)
                .expect("should parse");
        assert_eq!(
            rule,
            SegmentRule {
                clauses: vec![],
                weight: None,
                bucket_by: None,
            }
        );

        let rule: SegmentRule = serde_json::from_str(
            r#"{
                "clauses":[{
                    "attribute": "name",
                    "negate": false,
                    "op": "matches",
                    "values": ["xyz"]
                }],
                "weight": 10000,
                "bucketBy": "country"
            }"#,
        )
        .expect("should parse");
        assert_eq!(rule.weight, Some(10_000.0));
        assert_eq!(rule.bucket_by, Some("country".to_string()));
    }

    #[test]
    fn user_is_explicitly_included() {
        let mut segment = new_segment();
        segment.included.push("foo".to_string());
        segment.included.push("bar".to_string());
        let user = User::with_key("bar").build();
        assert_segment_match(&segment, &user, true);
    }

    #[test]
    fn user_is_matched_by_rule() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        let jane = User::with_key("foo").name("Jane").build();
        let joan = User::with_key("foo").name("Joan").build();
        assert_segment_match(&segment, &jane, true);
        assert_segment_match(&segment, &joan, false);
    }

    #[test]
    fn exclusion_beats_rules() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        segment.excluded.push("foo".to_string());
        let jane = User::with_key("foo").name("Jane").build();
        assert_segment_match(&segment, &jane, false);
    }

    #[test]
    fn inclusion_beats_exclusion() {
        let mut segment = new_segment();
        segment.included.push("bar".to_string());
        segment.excluded.push("foo".to_string());
        segment.excluded.push("bar".to_string());
        let user = User::with_key("bar").build();
        assert_segment_match(&segment, &user, true);
    }

    #[test]
    fn no_lists_no_rules_no_match() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        segment.included.push("key".to_string());
        let user = User::with_key("other-key").name("Bob").build();
        assert_segment_match(&segment, &user, false);
    }

    #[test]
    fn weighted_rule_admits_nearly_everyone_at_full_weight() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(Some(99_999.0), None));
        let user = User::with_key("key").name("Jane").build();
        assert_segment_match(&segment, &user, true);
    }

    #[test]
    fn weighted_rule_rejects_nearly_everyone_at_minimal_weight() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(Some(1.0), None));
        let user = User::with_key("key").name("Jane").build();
        assert_segment_match(&segment, &user, false);
    }

    #[test]
    fn weighted_rule_buckets_by_key() {
        let mut segment = new_segment();
        segment.rules.push(thirty_percent_rule(None));

        let user_a = User::with_key("userKeyA").build(); // bucket 0.14574753
        let user_z = User::with_key("userKeyZ").build(); // bucket 0.45679215
        assert_segment_match(&segment, &user_a, true);
        assert_segment_match(&segment, &user_z, false);
    }

    #[test]
    fn weighted_rule_buckets_by_any_attribute() {
        let mut segment = new_segment();
        segment
            .rules
            .push(thirty_percent_rule(Some("name".to_string())));
        let user_a = User::with_key("x").name("userKeyA").build(); // bucket 0.14574753
        let user_z = User::with_key("x").name("userKeyZ").build(); // bucket 0.45679215
        assert_segment_match(&segment, &user_a, true);
        assert_segment_match(&segment, &user_z, false);
    }

    #[test]
    fn self_referential_segment_is_a_non_match() {
        let segment: Segment = serde_json::from_str(
            r#"{
                "key": "segkey",
                "version": 1,
                "included": [],
                "excluded": [],
                "salt": "salty",
                "rules": [{
                    "clauses": [{
                        "attribute": "key",
                        "negate": false,
                        "op": "segmentMatch",
                        "values": ["segkey"]
                    }]
                }]
            }"#,
        )
        .unwrap();
        let user = User::with_key("anyone").build();
        assert_segment_match(&segment, &user, false);
    }

    #[test]
    fn segment_round_trips_through_json() {
        let mut segment = new_segment();
        segment.included.push("alice".into());
        segment.rules.push(jane_rule(Some(10_000.0), None));
        let json = serde_json::to_string(&segment).unwrap();
        let back: Segment = serde_json::from_str(&json).unwrap();
        assert_eq!(segment, back);
    }
}
