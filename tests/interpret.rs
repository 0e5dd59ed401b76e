use relay_rexx::error::ErrorKind;
use relay_rexx::interp::{CaptureSink, Interpreter};

fn run(src: &str) -> Vec<String> {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    interp.run_source(src).expect("program should run");
    sink.lines()
}

fn run_err(src: &str) -> relay_rexx::Diagnostic {
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(CaptureSink::new()));
    interp.run_source(src).unwrap_err()
}

// ── Classic mode ────────────────────────────────────────────────────

#[test]
fn classic_reads_and_writes_caller_variables() {
    let lines = run("x = 1\nINTERPRET 'x = x + 1; SAY x'\nSAY x");
    assert_eq!(lines, vec!["2", "2"]);
}

#[test]
fn classic_keeps_the_address_context() {
    use relay_rexx::address::RecordingTarget;
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(CaptureSink::new()));
    let (target, received) = RecordingTarget::new();
    interp.register_target("t", Box::new(target));
    interp
        .run_source("ADDRESS t\nINTERPRET \"'from inside'\"")
        .unwrap();
    assert_eq!(received.borrow().as_slice(), ["from inside"]);
}

#[test]
fn interpret_code_built_at_runtime() {
    let lines = run("verb = 'SAY'\nINTERPRET verb ' 6 * 7'");
    assert_eq!(lines, vec!["42"]);
}

// ── Isolated mode ───────────────────────────────────────────────────

#[test]
fn isolated_sees_nothing_and_leaks_nothing() {
    let lines = run(
        "secret = 'hidden'\n\
         INTERPRET 'SAY secret; leak = 1' WITH ISOLATED\n\
         SAY leak",
    );
    // Unset inside: SECRET prints as its own name. Unset outside after: LEAK.
    assert_eq!(lines, vec!["SECRET", "LEAK"]);
}

#[test]
fn isolated_import_gives_read_access() {
    let lines = run(
        "config = 'fast'\nother = 'no'\n\
         INTERPRET 'SAY config; SAY other' WITH ISOLATED (config)",
    );
    assert_eq!(lines, vec!["fast", "OTHER"]);
}

#[test]
fn isolated_export_copies_results_out() {
    let lines = run(
        "INTERPRET 'answer = 42; scratch = 1' WITH ISOLATED EXPORT(answer)\n\
         SAY answer\nSAY scratch",
    );
    assert_eq!(lines, vec!["42", "SCRATCH"]);
}

#[test]
fn isolated_missing_import_and_export_names_are_skipped() {
    let lines = run(
        "a = 1\n\
         INTERPRET 'SAY a; SAY ghost' WITH ISOLATED (a ghost) EXPORT(never_made)\n\
         SAY never_made",
    );
    assert_eq!(lines, vec!["1", "GHOST", "NEVER_MADE"]);
}

#[test]
fn isolated_address_context_does_not_leak_in() {
    use relay_rexx::address::RecordingTarget;
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let (target, received) = RecordingTarget::new();
    interp.register_target("t", Box::new(target));
    // Inside the sandbox there is no current target, so the bare string is
    // just an expression; afterwards the outer target is back.
    interp
        .run_source("ADDRESS t\nINTERPRET \"'silent'\" WITH ISOLATED\n'routed'")
        .unwrap();
    assert_eq!(received.borrow().as_slice(), ["routed"]);
}

// ── Errors inside INTERPRET ─────────────────────────────────────────

#[test]
fn parse_error_in_interpreted_code_is_an_interpret_error() {
    let err = run_err("INTERPRET 'DO i = 1 TO'");
    assert_eq!(err.kind, ErrorKind::Interpret);
}

#[test]
fn exit_inside_interpret_terminates_the_whole_run() {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let outcome = interp
        .run_source("INTERPRET 'EXIT 5'\nSAY 'unreached'")
        .unwrap();
    assert_eq!(outcome.exit_code, 5);
    assert!(sink.lines().is_empty());
}

#[test]
fn signal_escapes_classic_interpret_to_outer_labels() {
    let lines = run(
        "INTERPRET 'SIGNAL out'\n\
         SAY 'skipped'\n\
         out:\n\
         SAY 'landed'",
    );
    assert_eq!(lines, vec!["landed"]);
}

#[test]
fn signal_cannot_escape_isolated_interpret() {
    let err = run_err("INTERPRET 'SIGNAL out' WITH ISOLATED\nout:\nSAY 'no'");
    assert_eq!(err.kind, ErrorKind::Signal);
    assert!(err.message.contains("OUT"));
}

// ── NO-INTERPRET ────────────────────────────────────────────────────

#[test]
fn no_interpret_blocks_later_interpret_permanently() {
    let err = run_err("NO-INTERPRET\nINTERPRET 'SAY 1'");
    assert_eq!(err.kind, ErrorKind::Interpret);
    assert!(err.message.contains("NO-INTERPRET"));
}

#[test]
fn no_interpret_underscore_spelling() {
    let err = run_err("NO_INTERPRET\nINTERPRET 'SAY 1'");
    assert_eq!(err.kind, ErrorKind::Interpret);
}

#[test]
fn code_before_no_interpret_may_still_interpret() {
    let lines = run("INTERPRET 'SAY 1'\nNO-INTERPRET\nSAY 2");
    assert_eq!(lines, vec!["1", "2"]);
}

// ── Depth guard ─────────────────────────────────────────────────────

#[test]
fn self_referential_interpret_overflows_cleanly() {
    let err = run_err("code = \"INTERPRET code\"\nINTERPRET code");
    assert_eq!(err.kind, ErrorKind::StackOverflow);
}
