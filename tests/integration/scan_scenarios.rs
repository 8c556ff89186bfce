//! End-to-end scan scenarios over in-memory buffers.

use std::time::Duration;

use vigil::{
    CallbackAction, CmpOp, Cond, HexToken, PatternSpec, RuleDef, Ruleset, RulesetBuilder,
    ScanError, ScanEvent, SCAN_FLAGS_FAST_MODE,
};

/// Scans `data` and returns the event transcript as compact strings.
fn transcript(rules: &Ruleset, data: &[u8]) -> Vec<String> {
    let mut log = Vec::new();
    rules
        .scan_memory(data, 0, None, |ev| {
            log.push(render(&ev));
            CallbackAction::Continue
        })
        .unwrap();
    log
}

fn render(ev: &ScanEvent<'_>) -> String {
    match ev {
        ScanEvent::RuleMatching(r) => format!("+{}", r.identifier()),
        ScanEvent::RuleNotMatching(r) => format!("-{}", r.identifier()),
        ScanEvent::ImportModule(id) => format!("import:{id}"),
        ScanEvent::ModuleImported(id) => format!("imported:{id}"),
        ScanEvent::TooManyMatches(p) => format!("overflow:{}", p.identifier()),
        ScanEvent::ScanFinished => "finished".to_owned(),
    }
}

fn literal_rule(name: &str, pattern: &[u8]) -> RuleDef {
    RuleDef::new(name)
        .string("$a", PatternSpec::text(pattern))
        .condition(Cond::string("$a"))
}

#[test]
fn single_literal() {
    let mut b = RulesetBuilder::new();
    b.add_rule(literal_rule("r", b"foo")).unwrap();
    let rules = b.build().unwrap();
    assert_eq!(transcript(&rules, b"xfoox"), ["+r", "finished"]);
    assert_eq!(transcript(&rules, b"xfox"), ["-r", "finished"]);
}

#[test]
fn overlapping_literals() {
    let mut b = RulesetBuilder::new();
    for (name, pat) in [
        ("r_he", b"he".as_slice()),
        ("r_she", b"she"),
        ("r_his", b"his"),
        ("r_hers", b"hers"),
    ] {
        b.add_rule(literal_rule(name, pat)).unwrap();
    }
    let rules = b.build().unwrap();
    // "he" occurs as a substring of "ushers" too, so its rule matches.
    assert_eq!(
        transcript(&rules, b"ushers"),
        ["+r_he", "+r_she", "-r_his", "+r_hers", "finished"]
    );
}

#[test]
fn global_rule_suppresses_namespace() {
    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDef::new("g").namespace("n").global().condition(Cond::False))
        .unwrap();
    b.add_rule(
        RuleDef::new("r")
            .namespace("n")
            .string("$a", PatternSpec::text(b"x"))
            .condition(Cond::string("$a")),
    )
    .unwrap();
    // A sibling namespace is unaffected by the failing global.
    b.add_rule(
        RuleDef::new("other")
            .namespace("m")
            .string("$a", PatternSpec::text(b"x"))
            .condition(Cond::string("$a")),
    )
    .unwrap();
    let rules = b.build().unwrap();
    assert_eq!(
        transcript(&rules, b"x"),
        ["-g", "-r", "+other", "finished"]
    );
}

#[test]
fn satisfied_global_keeps_namespace_alive() {
    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDef::new("g").namespace("n").global().condition(Cond::True))
        .unwrap();
    b.add_rule(
        RuleDef::new("r")
            .namespace("n")
            .string("$a", PatternSpec::text(b"x"))
            .condition(Cond::string("$a")),
    )
    .unwrap();
    let rules = b.build().unwrap();
    assert_eq!(transcript(&rules, b"x"), ["+g", "+r", "finished"]);
}

#[test]
fn private_rules_generate_no_callbacks() {
    let mut b = RulesetBuilder::new();
    b.add_rule(
        RuleDef::new("hidden")
            .private()
            .string("$a", PatternSpec::text(b"foo"))
            .condition(Cond::string("$a")),
    )
    .unwrap();
    b.add_rule(RuleDef::new("uses_hidden").condition(Cond::rule("hidden")))
        .unwrap();
    let rules = b.build().unwrap();
    assert_eq!(transcript(&rules, b"foo"), ["+uses_hidden", "finished"]);
    assert_eq!(transcript(&rules, b"bar"), ["-uses_hidden", "finished"]);
}

#[test]
fn empty_block_list_reports_static_results() {
    let mut b = RulesetBuilder::new();
    b.add_rule(literal_rule("needs_string", b"foo")).unwrap();
    b.add_rule(RuleDef::new("always").condition(Cond::True))
        .unwrap();
    let rules = b.build().unwrap();
    let mut log = Vec::new();
    rules
        .scan_blocks(std::iter::empty(), 0, None, |ev| {
            log.push(render(&ev));
            CallbackAction::Continue
        })
        .unwrap();
    assert_eq!(log, ["-needs_string", "+always", "finished"]);
}

#[test]
fn callback_abort_stops_after_first_rule() {
    let mut b = RulesetBuilder::new();
    for i in 0..1000 {
        b.add_rule(RuleDef::new(&format!("r{i}")).condition(Cond::True))
            .unwrap();
    }
    let rules = b.build().unwrap();
    let mut delivered = 0u32;
    let result = rules.scan_memory(b"anything", 0, None, |_ev| {
        delivered += 1;
        CallbackAction::Abort
    });
    assert!(result.is_ok());
    assert_eq!(delivered, 1);
}

#[test]
fn timeout_returns_scan_timeout_and_recovers() {
    let mut b = RulesetBuilder::new();
    b.add_rule(literal_rule("r", b"never-present-pattern")).unwrap();
    let rules = b.build().unwrap();
    let data = vec![0u8; 1 << 20];
    let err = rules
        .scan_memory(
            &data,
            0,
            Some(Duration::from_nanos(1)),
            |_ev| CallbackAction::Continue,
        )
        .unwrap_err();
    assert!(matches!(err, ScanError::ScanTimeout));

    // Teardown must have released the slot and cleared state: the next scan
    // behaves as if it were the first.
    assert_eq!(transcript(&rules, b"never-present-pattern!"), ["+r", "finished"]);
}

#[test]
fn fast_mode_caps_per_string_matches() {
    let mut b = RulesetBuilder::new();
    b.add_rule(
        RuleDef::new("exactly_one")
            .string("$a", PatternSpec::text(b"aa"))
            .condition(Cond::cmp(CmpOp::Eq, Cond::Count("$a".into()), Cond::Int(1))),
    )
    .unwrap();
    let rules = b.build().unwrap();
    let data = b"aa..aa..aa";

    assert_eq!(transcript(&rules, data), ["-exactly_one", "finished"]);

    let mut log = Vec::new();
    rules
        .scan_memory(data, SCAN_FLAGS_FAST_MODE, None, |ev| {
            log.push(render(&ev));
            CallbackAction::Continue
        })
        .unwrap();
    assert_eq!(log, ["+exactly_one", "finished"]);
}

#[test]
fn wide_xor_and_fullword_modifiers() {
    let mut b = RulesetBuilder::new();
    b.add_rule(
        RuleDef::new("wide_xor")
            .string("$a", PatternSpec::text(b"cmd").wide().xor(1, 1))
            .condition(Cond::string("$a")),
    )
    .unwrap();
    b.add_rule(
        RuleDef::new("whole_word")
            .string("$w", PatternSpec::text(b"word").fullword())
            .condition(Cond::string("$w")),
    )
    .unwrap();
    let rules = b.build().unwrap();

    let wide_xored: Vec<u8> = b"c\0m\0d\0".iter().map(|&x| x ^ 1).collect();
    let mut data = b"......".to_vec();
    data.extend_from_slice(&wide_xored);
    assert_eq!(
        transcript(&rules, &data),
        ["+wide_xor", "-whole_word", "finished"]
    );

    assert_eq!(
        transcript(&rules, b"a word here"),
        ["-wide_xor", "+whole_word", "finished"]
    );
    assert_eq!(
        transcript(&rules, b"swords only"),
        ["-wide_xor", "-whole_word", "finished"]
    );
}

#[test]
fn hex_chain_with_jump() {
    let mut b = RulesetBuilder::new();
    b.add_rule(
        RuleDef::new("chained")
            .string(
                "$h",
                PatternSpec::hex(&[
                    HexToken::Byte(0xDE),
                    HexToken::Byte(0xAD),
                    HexToken::Jump(2, 4),
                    HexToken::Byte(0xBE),
                    HexToken::Byte(0xEF),
                ]),
            )
            .condition(Cond::string("$h")),
    )
    .unwrap();
    let rules = b.build().unwrap();

    let hit = [0xDE, 0xAD, 0x11, 0x22, 0x33, 0xBE, 0xEF];
    assert_eq!(transcript(&rules, &hit), ["+chained", "finished"]);

    let gap_too_long = [0xDE, 0xAD, 0, 0, 0, 0, 0, 0xBE, 0xEF];
    assert_eq!(transcript(&rules, &gap_too_long), ["-chained", "finished"]);

    let tail_only = [0x11, 0x22, 0xBE, 0xEF];
    assert_eq!(transcript(&rules, &tail_only), ["-chained", "finished"]);
}

#[test]
fn regex_string_with_offsets() {
    let mut b = RulesetBuilder::new();
    b.add_rule(
        RuleDef::new("token")
            .string("$t", PatternSpec::regex("tok_[0-9]{3}", b"tok_"))
            .condition(Cond::and(
                Cond::string("$t"),
                Cond::cmp(
                    CmpOp::Eq,
                    Cond::Offset("$t".into(), Box::new(Cond::Int(1))),
                    Cond::Int(4),
                ),
            )),
    )
    .unwrap();
    let rules = b.build().unwrap();
    assert_eq!(transcript(&rules, b"....tok_123"), ["+token", "finished"]);
    assert_eq!(transcript(&rules, b"tok_12x"), ["-token", "finished"]);
}

#[test]
fn filesize_and_externals_in_conditions() {
    let mut b = RulesetBuilder::new();
    b.declare_integer("limit", 0).unwrap();
    b.add_rule(RuleDef::new("small_enough").condition(Cond::cmp(
        CmpOp::Le,
        Cond::Filesize,
        Cond::external("limit"),
    )))
    .unwrap();
    let mut rules = b.build().unwrap();
    rules.define_integer_variable("limit", 8).unwrap();

    let mut log = Vec::new();
    rules
        .scan_memory(b"12345", 0, None, |ev| {
            log.push(render(&ev));
            CallbackAction::Continue
        })
        .unwrap();
    assert_eq!(
        log,
        ["import:limit", "imported:limit", "+small_enough", "finished"]
    );

    let mut log = Vec::new();
    rules
        .scan_memory(b"123456789", 0, None, |ev| {
            log.push(render(&ev));
            CallbackAction::Continue
        })
        .unwrap();
    assert_eq!(
        log,
        ["import:limit", "imported:limit", "-small_enough", "finished"]
    );
}

#[test]
fn entrypoint_condition_over_minimal_elf() {
    let mut image = minimal_elf_exec(0x400078);
    image.extend_from_slice(b"payload");

    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDef::new("entry_at_78").condition(Cond::cmp(
        CmpOp::Eq,
        Cond::Entrypoint,
        Cond::Int(0x78),
    )))
    .unwrap();
    let rules = b.build().unwrap();
    assert_eq!(transcript(&rules, &image), ["+entry_at_78", "finished"]);
    // Non-executable input leaves the entry point undefined.
    assert_eq!(transcript(&rules, b"plain text"), ["-entry_at_78", "finished"]);
}

/// Minimal ELF64 ET_EXEC image with one PT_LOAD at vaddr 0x400000.
fn minimal_elf_exec(entry: u64) -> Vec<u8> {
    let mut b = vec![0u8; 0x80];
    b[0..4].copy_from_slice(b"\x7fELF");
    b[4] = 2;
    b[5] = 1;
    b[6] = 1;
    b[16..18].copy_from_slice(&2u16.to_le_bytes());
    b[18..20].copy_from_slice(&0x3Eu16.to_le_bytes());
    b[20..24].copy_from_slice(&1u32.to_le_bytes());
    b[24..32].copy_from_slice(&entry.to_le_bytes());
    b[32..40].copy_from_slice(&0x40u64.to_le_bytes());
    b[52..54].copy_from_slice(&64u16.to_le_bytes());
    b[54..56].copy_from_slice(&56u16.to_le_bytes());
    b[56..58].copy_from_slice(&1u16.to_le_bytes());
    b[0x40..0x44].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    b[0x44..0x48].copy_from_slice(&5u32.to_le_bytes());
    b[0x48..0x50].copy_from_slice(&0u64.to_le_bytes());
    b[0x50..0x58].copy_from_slice(&0x400000u64.to_le_bytes());
    b[0x58..0x60].copy_from_slice(&0x400000u64.to_le_bytes());
    b[0x60..0x68].copy_from_slice(&0x100u64.to_le_bytes());
    b[0x68..0x70].copy_from_slice(&0x100u64.to_le_bytes());
    b[0x70..0x78].copy_from_slice(&0x1000u64.to_le_bytes());
    b
}
