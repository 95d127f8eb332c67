#![cfg(test)]

use std::cell::RefCell;
use std::collections::HashMap;

use crate::eval::{PrerequisiteEvent, PrerequisiteEventRecorder};
use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::Store;

pub struct TestStore {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::new_from_json_str(FLAGS_JSON, SEGMENTS_JSON)
    }

    pub fn new_from_json_str(flags_json: &str, segments_json: &str) -> Self {
        Self {
            flags: serde_json::from_str(flags_json).expect("flag fixtures should parse"),
            segments: serde_json::from_str(segments_json).expect("segment fixtures should parse"),
        }
    }

    pub fn update_flag(&mut self, flag_key: &str, f: impl FnOnce(&mut Flag)) {
        if let Some(flag) = self.flags.get_mut(flag_key) {
            f(flag);
        }
    }
}

impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        self.flags.get(flag_key).cloned()
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        self.segments.get(segment_key).cloned()
    }
}

pub struct InMemoryPrerequisiteEventRecorder {
    pub events: RefCell<Vec<PrerequisiteEvent>>,
}

impl PrerequisiteEventRecorder for InMemoryPrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent) {
        self.events.borrow_mut().push(event);
    }
}

const FLAGS_JSON: &str = r#"{
    "flag": {
        "key": "flag",
        "version": 42,
        "on": false,
        "targets": [],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "clientSide": true,
        "salt": "salty"
    },
    "flagWithRuleExclusion": {
        "key": "flagWithRuleExclusion",
        "version": 42,
        "on": false,
        "targets": [],
        "rules": [
            {
                "variation": 0,
                "id": "platform-rule",
                "clauses": [
                    {
                        "attribute": "platform",
                        "op": "in",
                        "values": ["web", "aem", "ios"],
                        "negate": false
                    }
                ],
                "trackEvents": true
            }
        ],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "clientSide": true,
        "salt": "salty",
        "trackEvents": false,
        "trackEventsFallthrough": true,
        "debugEventsUntilDate": 1500000000
    },
    "flagWithTarget": {
        "key": "flagWithTarget",
        "version": 42,
        "on": false,
        "targets": [{
            "values": ["bob"],
            "variation": 0
        }],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "clientSide": true,
        "salt": "salty"
    },
    "flagWithInRule": {
        "key": "flagWithInRule",
        "version": 42,
        "on": false,
        "targets": [],
        "rules": [{
            "id": "in-rule",
            "clauses": [{
                "attribute": "team",
                "op": "in",
                "values": ["Avengers"],
                "negate": false
            }],
            "variation": 0,
            "trackEvents": false
        }],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    },
    "flagWithMissingPrereq": {
        "key": "flagWithMissingPrereq",
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [{
            "key": "badPrereq",
            "variation": 1
        }],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    },
    "flagWithOffPrereq": {
        "key": "flagWithOffPrereq",
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [{
            "key": "offPrereq",
            "variation": 1
        }],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    },
    "offPrereq": {
        "key": "offPrereq",
        "version": 42,
        "on": false,
        "targets": [],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 0},
        "offVariation": 1,
        "variations": [false, true],
        "salt": "salty"
    },
    "prereq": {
        "key": "prereq",
        "version": 42,
        "on": true,
        "targets": [{
            "values": ["bob"],
            "variation": 1
        }],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 0},
        "offVariation": 1,
        "variations": [true, false],
        "salt": "salty"
    },
    "flagWithSatisfiedPrereq": {
        "key": "flagWithSatisfiedPrereq",
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [{
            "key": "prereq",
            "variation": 0
        }],
        "fallthrough": {"variation": 0},
        "offVariation": 1,
        "variations": [true, false],
        "salt": "salty"
    },
    "flagWithNestedPrereq": {
        "key": "flagWithNestedPrereq",
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [{
            "key": "flagWithSatisfiedPrereq",
            "variation": 0
        }],
        "fallthrough": {"variation": 0},
        "offVariation": 1,
        "variations": [true, false],
        "salt": "salty"
    },
    "flagWithFirstPrereqAsPrereqToSecondPrereq": {
        "key": "flagWithFirstPrereqAsPrereqToSecondPrereq",
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [
            {
                "key": "prereq",
                "variation": 0
            },
            {
                "key": "flagWithSatisfiedPrereq",
                "variation": 0
            }
        ],
        "fallthrough": {"variation": 0},
        "offVariation": 1,
        "variations": [true, false],
        "salt": "salty"
    },
    "flagWithSegmentMatchRule": {
        "key": "flagWithSegmentMatchRule",
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [{
            "id": "match-rule",
            "clauses": [{
                "attribute": "key",
                "op": "segmentMatch",
                "values": ["segment"],
                "negate": false
            }],
            "variation": 1,
            "trackEvents": false
        }],
        "prerequisites": [],
        "fallthrough": {"variation": 0},
        "offVariation": 1,
        "variations": [true, false],
        "salt": "salty"
    },
    "flagWithRolloutBucketBy": {
        "key": "rollout",
        "version": 7,
        "on": true,
        "targets": [],
        "rules": [
            {
                "id": "platform-rollout",
                "clauses": [
                    {
                        "attribute": "platform",
                        "op": "in",
                        "values": ["web", "aem", "ios"],
                        "negate": false
                    }
                ],
                "rollout": {
                    "bucketBy": "ld_quid",
                    "variations": [
                        {"variation": 0, "weight": 50000},
                        {"variation": 1, "weight": 50000},
                        {"variation": 2, "weight": 0}
                    ]
                },
                "trackEvents": false
            }
        ],
        "prerequisites": [],
        "fallthrough": {"variation": 2},
        "offVariation": 1,
        "variations": ["rollout1", "rollout2", "rollout3"],
        "salt": "ce2634f116d741a7ad1b7ef363f6f9bc"
    },
    "flagWithExperiment": {
        "key": "flagWithExperiment",
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {
            "rollout": {
                "kind": "experiment",
                "variations": [
                    {"variation": 1, "weight": 10000, "untracked": false},
                    {"variation": 0, "weight": 35000, "untracked": true},
                    {"variation": 0, "weight": 55000, "untracked": false}
                ]
            }
        },
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    },
    "flagWithMalformedRule": {
        "key": "flagWithMalformedRule",
        "version": 42,
        "on": false,
        "targets": [],
        "rules": [{
            "id": "no-variation-rule",
            "clauses": [{
                "attribute": "key",
                "op": "in",
                "values": ["yes"],
                "negate": false
            }],
            "trackEvents": false
        }],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    }
}"#;

const SEGMENTS_JSON: &str = r#"{
    "segment": {
        "key": "segment",
        "version": 1,
        "included": ["alice"],
        "excluded": [],
        "rules": [],
        "salt": "salty"
    }
}"#;
