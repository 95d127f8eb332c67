use chrono::{self, Utc};
use log::{error, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::eval::EvaluationStack;
use crate::store::Store;
use crate::user::{AttributeValue, User};
use crate::variation::VariationOrRolloutOrMalformed;

/// A single condition within a rule: an attribute, an operator, and the
/// values to compare against.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Clause {
    pub attribute: String,
    #[serde(default)]
    pub negate: bool,
    pub op: Op,
    pub values: Vec<AttributeValue>,
}

/// A flag targeting rule: a set of clauses that must all match, and the
/// variation or rollout served when they do.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub(crate) variation_or_rollout: VariationOrRolloutOrMalformed,
    #[serde(default)]
    pub track_events: bool,
}

/// The closed set of clause operators.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerGreaterThan,
    SemVerLessThan,
}

impl Clause {
    pub(crate) fn matches(
        &self,
        user: &User,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> bool {
        if let Op::SegmentMatch = self.op {
            self.matches_segment(user, store, evaluation_stack)
        } else {
            self.matches_non_segment(user)
        }
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    // Each clause value names a segment; membership in any of them matches.
    pub(crate) fn matches_segment(
        &self,
        user: &User,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> bool {
        let any_match = self.values.iter().any(|value| {
            value
                .as_str()
                .and_then(|segment_key| store.segment(segment_key))
                .map(|segment| segment.contains(user, store, evaluation_stack))
                .unwrap_or(false)
        });
        self.maybe_negate(any_match)
    }

    pub(crate) fn matches_non_segment(&self, user: &User) -> bool {
        let user_value = match user.value_of(&self.attribute) {
            Some(v) => v,
            None => return false,
        };

        // A multi-valued attribute matches if any of its elements matches
        // any of the clause values; negation applies to the overall result.
        let any_match = user_value
            .find(|user_value_single| {
                self.values
                    .iter()
                    .any(|clause_value| self.op.matches(user_value_single, clause_value))
            })
            .is_some();

        self.maybe_negate(any_match)
    }

    #[cfg(test)]
    pub(crate) fn new_match(attribute: &str, value: AttributeValue) -> Self {
        Self {
            attribute: attribute.to_string(),
            negate: false,
            op: Op::Matches,
            values: vec![value],
        }
    }
}

impl FlagRule {
    // Rules match only if every clause does.
    pub(crate) fn matches(
        &self,
        user: &User,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.matches(user, store, evaluation_stack))
    }
}

impl Op {
    // Type-mismatched operands are a non-match, never an error.
    fn matches(&self, lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
        match self {
            Op::In => lhs == rhs,

            Op::StartsWith => string_op(lhs, rhs, |l, r| l.starts_with(r)),
            Op::EndsWith => string_op(lhs, rhs, |l, r| l.ends_with(r)),
            Op::Contains => string_op(lhs, rhs, |l, r| l.contains(r)),
            Op::Matches => string_op(lhs, rhs, |l, r| match Regex::new(r) {
                Ok(re) => re.is_match(l),
                Err(e) => {
                    warn!("invalid regex for 'matches' operator ({}): {}", e, r);
                    false
                }
            }),

            Op::LessThan => numeric_op(lhs, rhs, |l, r| l < r),
            Op::LessThanOrEqual => numeric_op(lhs, rhs, |l, r| l <= r),
            Op::GreaterThan => numeric_op(lhs, rhs, |l, r| l > r),
            Op::GreaterThanOrEqual => numeric_op(lhs, rhs, |l, r| l >= r),

            Op::Before => time_op(lhs, rhs, |l, r| l < r),
            Op::After => time_op(lhs, rhs, |l, r| l > r),

            Op::SegmentMatch => {
                error!("segmentMatch operator must be dispatched before operand matching");
                false
            }

            Op::SemVerEqual => semver_op(lhs, rhs, |l, r| l == r),
            Op::SemVerLessThan => semver_op(lhs, rhs, |l, r| l < r),
            Op::SemVerGreaterThan => semver_op(lhs, rhs, |l, r| l > r),
        }
    }
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.as_str(), rhs.as_str()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn numeric_op<F: Fn(f64, f64) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_f64(), rhs.to_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn time_op<F: Fn(chrono::DateTime<Utc>, chrono::DateTime<Utc>) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.to_datetime(), rhs.to_datetime()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn semver_op<F: Fn(semver::Version, semver::Version) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.as_semver(), rhs.as_semver()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use test_case::test_case;

    struct EmptyStore;

    impl Store for EmptyStore {
        fn flag(&self, _flag_key: &str) -> Option<crate::Flag> {
            None
        }
        fn segment(&self, _segment_key: &str) -> Option<crate::Segment> {
            None
        }
    }

    fn clause(attribute: &str, op: Op, values: Vec<AttributeValue>) -> Clause {
        Clause {
            attribute: attribute.into(),
            negate: false,
            op,
            values,
        }
    }

    fn assert_clause_match(clause: &Clause, user: &User, expected: bool) {
        let mut stack = EvaluationStack::default();
        assert_eq!(
            clause.matches(user, &EmptyStore, &mut stack),
            expected,
            "clause {:?} on {:?}",
            clause,
            user
        );
    }

    #[test]
    fn in_op_is_structural_equality() {
        let user = User::with_key("u").name("Jane").build();
        assert_clause_match(&clause("name", Op::In, vec!["Jane".into()]), &user, true);
        assert_clause_match(&clause("name", Op::In, vec!["Joan".into()]), &user, false);
        assert_clause_match(
            &clause("name", Op::In, vec!["Joan".into(), "Jane".into()]),
            &user,
            true,
        );
    }

    #[test_case(Op::StartsWith, "user@acme.com", "user@", true)]
    #[test_case(Op::StartsWith, "user@acme.com", "acme", false)]
    #[test_case(Op::EndsWith, "user@acme.com", "@acme.com", true)]
    #[test_case(Op::EndsWith, "user@acme.com", "@other.com", false)]
    #[test_case(Op::Contains, "user@acme.com", "acme", true)]
    #[test_case(Op::Contains, "user@acme.com", "umbrella", false)]
    #[test_case(Op::Matches, "user@acme.com", r"^[a-z]+@acme\.com$", true)]
    #[test_case(Op::Matches, "user@acme.com", r"^\d+$", false)]
    #[test_case(Op::Matches, "user@acme.com", r"(unclosed", false)]
    fn string_operators(op: Op, attribute_value: &str, clause_value: &str, expected: bool) {
        let user = User::with_key("u").email(attribute_value).build();
        assert_clause_match(&clause("email", op, vec![clause_value.into()]), &user, expected);
    }

    #[test_case(Op::LessThan, 3, 5, true)]
    #[test_case(Op::LessThan, 5, 5, false)]
    #[test_case(Op::LessThanOrEqual, 5, 5, true)]
    #[test_case(Op::GreaterThan, 6, 5, true)]
    #[test_case(Op::GreaterThan, 5, 5, false)]
    #[test_case(Op::GreaterThanOrEqual, 5, 5, true)]
    fn numeric_operators(op: Op, attribute_value: i64, clause_value: i64, expected: bool) {
        let user = User::with_key("u")
            .custom(hashmap! {"count".into() => attribute_value.into()})
            .build();
        assert_clause_match(
            &clause("count", op, vec![clause_value.into()]),
            &user,
            expected,
        );
    }

    #[test]
    fn numeric_operators_mix_ints_and_floats() {
        let user = User::with_key("u")
            .custom(hashmap! {"count".into() => 4.5.into()})
            .build();
        assert_clause_match(&clause("count", Op::LessThan, vec![5.into()]), &user, true);
        assert_clause_match(&clause("count", Op::GreaterThan, vec![5.into()]), &user, false);
    }

    #[test_case(Op::Before, "1970-01-01T00:00:01Z", 2_000, true)]
    #[test_case(Op::After, "1970-01-01T00:00:03Z", 2_000, true)]
    #[test_case(Op::Before, "1970-01-01T00:00:03Z", 2_000, false)]
    fn time_operators_mix_rfc3339_and_millis(
        op: Op,
        attribute_value: &str,
        clause_millis: i64,
        expected: bool,
    ) {
        let user = User::with_key("u")
            .custom(hashmap! {"signup".into() => attribute_value.into()})
            .build();
        assert_clause_match(
            &clause("signup", op, vec![clause_millis.into()]),
            &user,
            expected,
        );
    }

    #[test]
    fn time_operator_rejects_unparseable_values() {
        let user = User::with_key("u")
            .custom(hashmap! {"signup".into() => "yesterday".into()})
            .build();
        assert_clause_match(&clause("signup", Op::Before, vec![2_000.into()]), &user, false);
    }

    #[test_case(Op::SemVerEqual, "2.0.0", "2.0", true)]
    #[test_case(Op::SemVerEqual, "2.0.1", "2.0.0", false)]
    #[test_case(Op::SemVerLessThan, "2.0.0-rc.1", "2.0.0", true)]
    #[test_case(Op::SemVerGreaterThan, "2.1", "2.0.9", true)]
    #[test_case(Op::SemVerGreaterThan, "nope", "2.0.9", false)]
    fn semver_operators(op: Op, attribute_value: &str, clause_value: &str, expected: bool) {
        let user = User::with_key("u")
            .custom(hashmap! {"appVersion".into() => attribute_value.into()})
            .build();
        assert_clause_match(
            &clause("appVersion", op, vec![clause_value.into()]),
            &user,
            expected,
        );
    }

    #[test]
    fn array_attribute_matches_any_element() {
        let user = User::with_key("u")
            .custom(hashmap! {"groups".into() => vec!["alpha", "beta"].into()})
            .build();
        assert_clause_match(&clause("groups", Op::In, vec!["beta".into()]), &user, true);
        assert_clause_match(&clause("groups", Op::In, vec!["gamma".into()]), &user, false);
    }

    #[test]
    fn negation_inverts_the_result_but_not_missing_attributes() {
        let user = User::with_key("u").name("Jane").build();

        let mut negated = clause("name", Op::In, vec!["Jane".into()]);
        negated.negate = true;
        assert_clause_match(&negated, &user, false);

        // A missing attribute is a non-match even under negation.
        let mut negated_missing = clause("nickname", Op::In, vec!["Jane".into()]);
        negated_missing.negate = true;
        assert_clause_match(&negated_missing, &user, false);
    }

    #[test]
    fn type_mismatches_are_non_matches() {
        let user = User::with_key("u")
            .custom(hashmap! {"count".into() => 5.into()})
            .build();
        assert_clause_match(&clause("count", Op::StartsWith, vec!["5".into()]), &user, false);
        assert_clause_match(&clause("count", Op::In, vec!["5".into()]), &user, false);
    }

    #[test]
    fn rule_requires_every_clause() {
        let rule: FlagRule = serde_json::from_str(
            r#"{
                "id": "both",
                "clauses": [
                    {"attribute": "name", "op": "in", "values": ["Jane"], "negate": false},
                    {"attribute": "country", "op": "in", "values": ["us"], "negate": false}
                ],
                "variation": 1
            }"#,
        )
        .unwrap();

        let matching = User::with_key("u").name("Jane").country("us").build();
        let half_matching = User::with_key("u").name("Jane").country("gb").build();

        let mut stack = EvaluationStack::default();
        assert!(rule.matches(&matching, &EmptyStore, &mut stack));
        assert!(!rule.matches(&half_matching, &EmptyStore, &mut stack));
    }
}
