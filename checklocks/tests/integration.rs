//! Integration tests for the checklocks pipeline
//!
//! Drives `check_source` end to end:
//! - Field, atomic and mixed contracts
//! - Function contracts across call sites
//! - `+checklocksfail` expectation bookkeeping on the fixtures
//! - Configuration errors and output rendering

use checklocks::{Config, Report, RuleKind, check_source};

const RESOURCE: &str = include_str!("fixtures/resource.ck");
const GENERIC: &str = include_str!("fixtures/generic.ck");

/// Struct shared by the hand-written scenarios below
const PRELUDE: &str = "
struct ProtectedResource {
    mu: sync.Mutex,
    // +checklocks:mu
    value: int,

    // +checkatomic
    // +checklocks:mu
    mixedValue: int32,
}
";

fn check(source: &str) -> Report {
    check_with(source, &Config::default())
}

fn check_with(source: &str, config: &Config) -> Report {
    check_source("test.ck", source, config).expect("source should parse")
}

fn with_prelude(body: &str) -> String {
    format!("{PRELUDE}\n{body}")
}

fn shared_reads() -> Config {
    let mut config = Config::default();
    config.analysis.shared_reads = true;
    config
}

fn rules(report: &Report) -> Vec<RuleKind> {
    report.diagnostics.iter().map(|d| d.rule).collect()
}

// ============================================
// End-to-end scenarios
// ============================================

#[test]
fn test_unlocked_writes_report_once_per_statement() {
    let report = check(&with_prelude(
        "fn (pr: *ProtectedResource) Set(v: int) {
            pr.value = v;
            pr.value = v + 1;
        }",
    ));
    assert_eq!(rules(&report), vec![RuleKind::AccessViolation, RuleKind::AccessViolation]);
    assert!(report.diagnostics[0].message.contains("pr.mu"));
}

#[test]
fn test_acquire_contract_called_while_held() {
    let report = check(&with_prelude(
        "// +checklocksacquire:pr.mu
        fn (pr: *ProtectedResource) Acquire() {
            pr.mu.Lock();
        }

        fn (pr: *ProtectedResource) Caller() {
            pr.mu.Lock();
            pr.Acquire();
            pr.value = 1;
            pr.mu.Unlock();
        }",
    ));
    // The lock stays held after the bad call, so the write and the unlock are fine
    assert_eq!(rules(&report), vec![RuleKind::AcquireViolation]);
    assert!(report.diagnostics[0].message.contains("Acquire"));
}

#[test]
fn test_mixed_field_plain_write_without_lock() {
    let report = check(&with_prelude(
        "fn (pr: *ProtectedResource) Write(v: int32) {
            pr.mixedValue = v;
        }",
    ));
    assert_eq!(report.len(), 2);
    assert_eq!(report.count(RuleKind::MixedModeViolation), 1);
    assert_eq!(report.count(RuleKind::AtomicAccessViolation), 1);
    assert_eq!(report.diagnostics[0].span, report.diagnostics[1].span);
}

#[test]
fn test_ignored_body_and_checked_caller() {
    let report = check(&with_prelude(
        "// +checklocksignore
        fn (pr: *ProtectedResource) Ignored() {
            pr.value = -1;
        }

        // +checklocks:pr.mu
        fn (pr: *ProtectedResource) Caller() {
            pr.Ignored();
            pr.mu.Unlock();
        }",
    ));
    // Nothing from inside `Ignored`; the caller still breaks its own exit contract
    assert_eq!(rules(&report), vec![RuleKind::ExitStateViolation]);
    assert!(report.diagnostics[0].message.contains("without required lock held"));
}

#[test]
fn test_constructor_built_local_is_checked() {
    let report = check(&with_prelude(
        "fn NewResource() -> *ProtectedResource { return nil; }

        // +checklocks:r.mu
        fn (r: *ProtectedResource) setLocked(v: int) { r.value = v; }

        fn main() {
            let r = NewResource();
            r.setLocked(1);
            r.value = 2;
        }",
    ));
    assert_eq!(
        rules(&report),
        vec![RuleKind::CallPreconditionViolation, RuleKind::AccessViolation]
    );
    assert!(report.diagnostics[1].message.contains("r.mu"), "{}", report.diagnostics[1].message);
}

#[test]
fn test_local_without_known_type_is_configuration_error() {
    let report = check(&with_prelude(
        "fn main() {
            let r = lookup();
            r.value = 2;
            r.value = 3;
        }",
    ));
    assert_eq!(rules(&report), vec![RuleKind::ConfigurationError]);
    assert!(report.diagnostics[0].message.contains("annotate its `let`"));

    // An annotation brings the local back under analysis
    let report = check(&with_prelude(
        "fn main() {
            let r: *ProtectedResource = lookup();
            r.value = 2;
        }",
    ));
    assert_eq!(rules(&report), vec![RuleKind::AccessViolation]);
}

#[test]
fn test_shadow_inside_block_ends_with_block() {
    let report = check(&with_prelude(
        "fn (pr: *ProtectedResource) Set(c: bool) {
            if c {
                let pr = 1;
            }
            pr.value = 1;
        }",
    ));
    assert_eq!(rules(&report), vec![RuleKind::AccessViolation]);
}

#[test]
fn test_shadowing_local_is_a_different_instance() {
    let source = with_prelude(
        "fn (pr: *ProtectedResource) Copy(other: *ProtectedResource) {
            pr.mu.Lock();
            if true {
                let pr = other;
                pr.value = 1;
            }
            pr.value = 2;
            pr.mu.Unlock();
        }",
    );
    let report = check(&source);
    // Only the write through the shadow lacks its lock
    assert_eq!(rules(&report), vec![RuleKind::AccessViolation]);
    let at = report.diagnostics[0].span.start;
    assert_eq!(&source[at..at + "pr.value = 1".len()], "pr.value = 1");
}

// ============================================
// Fixtures
// ============================================

#[test]
fn test_resource_fixture_meets_every_expectation() {
    let report = check_with(RESOURCE, &shared_reads());
    assert!(report.is_clean(), "{}", report.render_plain("resource.ck", RESOURCE));
}

#[test]
fn test_resource_fixture_exclusive_reads() {
    // Without shared reads, the two reads under an RLock are violations
    let report = check(RESOURCE);
    assert_eq!(rules(&report), vec![RuleKind::AccessViolation, RuleKind::AccessViolation]);
    for d in &report.diagnostics {
        assert!(d.message.contains("pr.rwMu"), "{}", d.message);
    }
    assert_eq!(report.diagnostics[0].held_description(), "pr.rwMu (shared)");
}

#[test]
fn test_generic_fixture_meets_every_expectation() {
    let report = check_with(GENERIC, &shared_reads());
    assert!(report.is_clean(), "{}", report.render_plain("generic.ck", GENERIC));
}

#[test]
fn test_fixture_output_is_deterministic() {
    let mut single = Config::default();
    single.analysis.jobs = 1;
    let mut many = Config::default();
    many.analysis.jobs = 8;

    let first = check_with(RESOURCE, &single);
    for _ in 0..4 {
        assert_eq!(check_with(RESOURCE, &many).diagnostics, first.diagnostics);
    }
}

// ============================================
// Expectations
// ============================================

#[test]
fn test_unmet_expectation_is_reported() {
    let report = check(&with_prelude(
        "fn (pr: *ProtectedResource) Set(v: int) {
            pr.mu.Lock();
            pr.value = v; // +checklocksfail
            pr.mu.Unlock();
        }",
    ));
    assert_eq!(rules(&report), vec![RuleKind::UnmetExpectation]);
}

#[test]
fn test_wrong_expectation_count_keeps_diagnostics() {
    let report = check(&with_prelude(
        "fn (pr: *ProtectedResource) Set(v: int) {
            pr.value = v; // +checklocksfail:2
        }",
    ));
    assert_eq!(report.count(RuleKind::AccessViolation), 1);
    assert_eq!(report.count(RuleKind::UnmetExpectation), 1);
}

#[test]
fn test_expectation_covers_nested_block() {
    let report = check(&with_prelude(
        "fn (pr: *ProtectedResource) Set(c: bool) {
            // +checklocksfail:2
            if c {
                pr.value = 1;
                pr.value = 2;
            }
        }",
    ));
    assert!(report.is_clean(), "{:?}", report.diagnostics);
}

// ============================================
// Configuration errors
// ============================================

#[test]
fn test_unknown_guard_is_configuration_error() {
    let report = check(
        "struct S {
            mu: sync.Mutex,
            // +checklocks:mux
            value: int,
        }",
    );
    assert_eq!(rules(&report), vec![RuleKind::ConfigurationError]);
    assert!(report.diagnostics[0].message.contains("did you mean `mu`"));
}

#[test]
fn test_rejected_function_body_is_not_analyzed() {
    let report = check(&with_prelude(
        "// +checklocks:pr.nope
        fn (pr: *ProtectedResource) Bad() {
            pr.value = 1;
        }",
    ));
    assert_eq!(rules(&report), vec![RuleKind::ConfigurationError]);
}

#[test]
fn test_custom_lock_vocabulary() {
    let config = Config::from_toml(
        r#"
        [locks]
        exclusive_types = ["SpinLock"]
        acquire = ["acquire"]
        release = ["release"]
        "#,
    )
    .unwrap();
    let source = "
        struct S {
            l: SpinLock,
            // +checklocks:l
            v: int,
        }
        fn (s: *S) ok() { s.l.acquire(); s.v = 1; s.l.release(); }
        fn (s: *S) bad() { s.v = 1; }
    ";
    let report = check_with(source, &config);
    assert_eq!(rules(&report), vec![RuleKind::AccessViolation]);
}

#[test]
fn test_unknown_config_key_rejected() {
    assert!(Config::from_toml("[analysis]\nshard_reads = true\n").is_err());
}

#[test]
fn test_syntax_error_is_an_error() {
    assert!(check_source("bad.ck", "fn f( {", &Config::default()).is_err());
}

// ============================================
// Rendering
// ============================================

#[test]
fn test_plain_output_format() {
    let source = with_prelude(
        "fn (pr: *ProtectedResource) Set(v: int) {
    pr.value = v;
}",
    );
    let report = check(&source);
    let out = report.render_plain("test.ck", &source);
    let line = source.lines().position(|l| l.contains("pr.value = v")).unwrap() + 1;
    assert!(out.starts_with(&format!("test.ck:{line}:5: ")), "{out}");
    assert!(out.trim_end().ends_with("(locks: no locks held)"), "{out}");
}

#[test]
fn test_json_output_lists_rules() {
    let report = check(RESOURCE);
    let json = report.render_json("resource.ck", RESOURCE).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let items = value.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|d| d["line"].as_u64().is_some()));
}
