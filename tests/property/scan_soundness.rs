//! Scan results must agree with a naive reference matcher.
//!
//! The automaton walk, atom selection, packing, and verification together
//! must be equivalent to brute-force substring search: for arbitrary pattern
//! sets and inputs, a rule asserting its string matches exactly when the
//! pattern occurs, and reported counts equal overlapping occurrence counts.

use proptest::collection::vec;
use proptest::prelude::*;

use vigil::{
    CallbackAction, CmpOp, Cond, PatternSpec, RuleDef, Ruleset, RulesetBuilder, ScanEvent,
};

/// Overlapping occurrence count, brute force.
fn naive_count(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| w == &needle).count()
}

fn build_found_rules(patterns: &[Vec<u8>]) -> Ruleset {
    let mut b = RulesetBuilder::new();
    for (i, p) in patterns.iter().enumerate() {
        b.add_rule(
            RuleDef::new(&format!("r{i}"))
                .string("$a", PatternSpec::text(p))
                .condition(Cond::string("$a")),
        )
        .unwrap();
    }
    b.build().unwrap()
}

/// Runs a scan and returns per-rule verdicts in declaration order.
fn verdicts(rules: &Ruleset, data: &[u8]) -> Vec<bool> {
    let mut out = Vec::new();
    rules
        .scan_memory(data, 0, None, |ev| {
            match ev {
                ScanEvent::RuleMatching(_) => out.push(true),
                ScanEvent::RuleNotMatching(_) => out.push(false),
                _ => {}
            }
            CallbackAction::Continue
        })
        .unwrap();
    out
}

/// Patterns drawn from a tight alphabet so overlaps and shared prefixes are
/// common.
fn pattern_strategy() -> impl Strategy<Value = Vec<u8>> {
    vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c')], 1..6)
}

fn input_strategy() -> impl Strategy<Value = Vec<u8>> {
    vec(
        prop_oneof![Just(b'a'), Just(b'b'), Just(b'c'), any::<u8>()],
        0..200,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn found_agrees_with_substring_search(
        patterns in vec(pattern_strategy(), 1..6),
        input in input_strategy(),
    ) {
        let rules = build_found_rules(&patterns);
        let got = verdicts(&rules, &input);
        prop_assert_eq!(got.len(), patterns.len());
        for (i, p) in patterns.iter().enumerate() {
            let expected = naive_count(&input, p) > 0;
            prop_assert_eq!(
                got[i], expected,
                "pattern {:?} against {:?}", p, &input
            );
        }
    }

    #[test]
    fn counts_agree_with_overlapping_occurrences(
        pattern in pattern_strategy(),
        input in input_strategy(),
    ) {
        let expected = naive_count(&input, &pattern) as i64;
        let mut b = RulesetBuilder::new();
        b.add_rule(
            RuleDef::new("c")
                .string("$a", PatternSpec::text(&pattern))
                .condition(Cond::cmp(
                    CmpOp::Eq,
                    Cond::Count("$a".into()),
                    Cond::Int(expected),
                )),
        )
        .unwrap();
        let rules = b.build().unwrap();
        prop_assert_eq!(verdicts(&rules, &input), vec![true]);
    }

    #[test]
    fn first_offset_agrees_with_leftmost_occurrence(
        pattern in pattern_strategy(),
        input in input_strategy(),
    ) {
        let leftmost = input
            .windows(pattern.len())
            .position(|w| w == pattern.as_slice());
        prop_assume!(leftmost.is_some());

        let mut b = RulesetBuilder::new();
        b.add_rule(
            RuleDef::new("o")
                .string("$a", PatternSpec::text(&pattern))
                .condition(Cond::FoundAt(
                    "$a".into(),
                    Box::new(Cond::Int(leftmost.unwrap() as i64)),
                )),
        )
        .unwrap();
        let rules = b.build().unwrap();
        prop_assert_eq!(verdicts(&rules, &input), vec![true]);
    }

    #[test]
    fn save_load_preserves_verdicts(
        patterns in vec(pattern_strategy(), 1..4),
        input in input_strategy(),
    ) {
        let rules = build_found_rules(&patterns);
        let mut buf = Vec::new();
        rules.save_stream(&mut buf).unwrap();
        let loaded = Ruleset::load_stream(buf.as_slice()).unwrap();
        prop_assert_eq!(verdicts(&rules, &input), verdicts(&loaded, &input));
    }

    #[test]
    fn nocase_matches_any_casing(
        pattern in vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'z')], 1..5),
        input in vec(any::<u8>(), 0..120),
    ) {
        let mut b = RulesetBuilder::new();
        b.add_rule(
            RuleDef::new("n")
                .string("$a", PatternSpec::text(&pattern).nocase())
                .condition(Cond::string("$a")),
        )
        .unwrap();
        let rules = b.build().unwrap();

        let expected = input
            .windows(pattern.len())
            .any(|w| w.eq_ignore_ascii_case(&pattern));
        prop_assert_eq!(verdicts(&rules, &input), vec![expected]);
    }
}
