//! Round-trip laws: serialized rulesets and alternate scan entry points
//! must reproduce identical callback transcripts.

use std::io::Write;

use vigil::{
    CallbackAction, CmpOp, Cond, HexToken, PatternSpec, RuleDef, Ruleset, RulesetBuilder,
    ScanEvent,
};

fn rich_ruleset() -> Ruleset {
    let mut b = RulesetBuilder::new();
    b.declare_integer("level", 3).unwrap();
    b.declare_string("env", "prod").unwrap();
    b.add_rule(
        RuleDef::new("plain")
            .string("$a", PatternSpec::text(b"orchid"))
            .condition(Cond::string("$a")),
    )
    .unwrap();
    b.add_rule(
        RuleDef::new("folded")
            .string("$a", PatternSpec::text(b"Mixed").nocase().wide())
            .condition(Cond::string("$a")),
    )
    .unwrap();
    b.add_rule(
        RuleDef::new("keyed")
            .string("$a", PatternSpec::text(b"secret").xor(0x10, 0x30))
            .condition(Cond::string("$a")),
    )
    .unwrap();
    b.add_rule(
        RuleDef::new("tagged")
            .string("$t", PatternSpec::regex("tag=[a-z]+", b"tag="))
            .condition(Cond::and(
                Cond::string("$t"),
                Cond::cmp(CmpOp::Ge, Cond::external("level"), Cond::Int(2)),
            )),
    )
    .unwrap();
    b.add_rule(
        RuleDef::new("magic")
            .namespace("bin")
            .string(
                "$h",
                PatternSpec::hex(&[
                    HexToken::Byte(0xCA),
                    HexToken::Byte(0xFE),
                    HexToken::Jump(0, 6),
                    HexToken::Byte(0xBA),
                    HexToken::Byte(0xBE),
                ]),
            )
            .condition(Cond::string("$h")),
    )
    .unwrap();
    b.add_rule(
        RuleDef::new("guard")
            .namespace("bin")
            .global()
            .condition(Cond::cmp(CmpOp::Gt, Cond::Filesize, Cond::Int(4))),
    )
    .unwrap();
    b.build().unwrap()
}

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

fn corpus() -> Vec<Vec<u8>> {
    let mut inputs: Vec<Vec<u8>> = vec![
        b"".to_vec(),
        b"nothing interesting".to_vec(),
        b"an orchid grows".to_vec(),
        b"m\0i\0x\0e\0d\0 wide".to_vec(),
        b"MIXED case".to_vec(),
        b"tag=alpha level stuff".to_vec(),
        [0xCA, 0xFE, 0x01, 0x02, 0xBA, 0xBE].to_vec(),
        [0xCA, 0xFE, 0xBA, 0xBE].to_vec(),
    ];
    // XOR-encoded "secret" under a key inside and outside the declared range.
    inputs.push(b"secret".iter().map(|&x| x ^ 0x20).collect());
    inputs.push(b"secret".iter().map(|&x| x ^ 0x55).collect());
    inputs
}

#[test]
fn loaded_copy_reproduces_every_transcript() {
    let rules = rich_ruleset();
    let mut buf = Vec::new();
    rules.save_stream(&mut buf).unwrap();
    let loaded = Ruleset::load_stream(buf.as_slice()).unwrap();

    for input in corpus() {
        assert_eq!(
            transcript(&rules, &input),
            transcript(&loaded, &input),
            "diverged on input {input:x?}"
        );
    }
}

#[test]
fn save_load_survives_a_second_generation() {
    let rules = rich_ruleset();
    let mut first = Vec::new();
    rules.save_stream(&mut first).unwrap();
    let gen1 = Ruleset::load_stream(first.as_slice()).unwrap();
    let mut second = Vec::new();
    gen1.save_stream(&mut second).unwrap();
    assert_eq!(first, second);
}

#[test]
fn scan_file_matches_scan_memory() {
    let rules = rich_ruleset();
    let dir = tempfile::tempdir().unwrap();

    for (i, input) in corpus().into_iter().enumerate() {
        let path = dir.path().join(format!("input-{i}.bin"));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&input).unwrap();
        f.sync_all().unwrap();
        drop(f);

        let mut log = Vec::new();
        rules
            .scan_file(&path, 0, None, |ev| {
                log.push(render(&ev));
                CallbackAction::Continue
            })
            .unwrap();
        assert_eq!(log, transcript(&rules, &input), "diverged on file {i}");
    }
}

#[test]
fn scan_memory_equals_explicit_single_block() {
    let rules = rich_ruleset();
    for input in corpus() {
        let mut log = Vec::new();
        rules
            .scan_blocks(
                [Ok(vigil::MemoryBlock::new(0, input.as_slice()))],
                0,
                None,
                |ev| {
                    log.push(render(&ev));
                    CallbackAction::Continue
                },
            )
            .unwrap();
        assert_eq!(log, transcript(&rules, &input));
    }
}
