use relay_rexx::interp::{CaptureSink, Interpreter};
use relay_rexx::value::Value;

fn run(src: &str) -> (Vec<String>, i32) {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let outcome = interp.run_source(src).expect("program should run");
    (sink.lines(), outcome.exit_code)
}

fn run_with_args(src: &str, args: &[&str]) -> Vec<String> {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    interp.set_args(args.iter().map(|a| Value::string(*a)).collect());
    interp.run_source(src).expect("program should run");
    sink.lines()
}

// ── CALL / RETURN dynamic scoping ───────────────────────────────────

#[test]
fn subroutine_shares_the_callers_variables() {
    let (lines, _) = run(
        "total = 0\n\
         CALL bump\n\
         CALL bump\n\
         SAY total\n\
         EXIT 0\n\
         bump:\n\
         total = total + 1\n\
         RETURN",
    );
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn return_value_reaches_result_and_pull() {
    let (lines, _) = run(
        "CALL answer\n\
         SAY RESULT\n\
         PULL got\n\
         SAY got\n\
         EXIT 0\n\
         answer:\n\
         RETURN 42",
    );
    assert_eq!(lines, vec!["42", "42"]);
}

#[test]
fn parse_arg_binds_positionals_and_blanks_the_rest() {
    let (lines, _) = run(
        "CALL greet 'Ada', 'Lovelace'\n\
         EXIT 0\n\
         greet:\n\
         PARSE ARG first, last, title\n\
         SAY first last\n\
         SAY '[' || title || ']'\n\
         RETURN",
    );
    assert_eq!(lines, vec!["Ada Lovelace", "[]"]);
}

#[test]
fn call_round_trip_mutation_then_return() {
    // Caller writes, callee reads and rewrites, caller observes the change.
    let (lines, _) = run(
        "state = 'before'\n\
         CALL flip\n\
         SAY state\n\
         EXIT 0\n\
         flip:\n\
         SAY state\n\
         state = 'after'\n\
         RETURN",
    );
    assert_eq!(lines, vec!["before", "after"]);
}

#[test]
fn label_call_in_expression_position() {
    let (lines, _) = run(
        "SAY TWICE(7) + 1\n\
         EXIT 0\n\
         twice:\n\
         PARSE ARG n\n\
         RETURN n * 2",
    );
    assert_eq!(lines, vec!["15"]);
}

// ── EXIT ────────────────────────────────────────────────────────────

#[test]
fn exit_terminates_from_nested_call_depth() {
    let (lines, code) = run(
        "CALL outer\n\
         SAY 'unreached'\n\
         outer:\n\
         CALL inner\n\
         SAY 'also unreached'\n\
         RETURN\n\
         inner:\n\
         EXIT 7\n\
         RETURN",
    );
    assert!(lines.is_empty());
    assert_eq!(code, 7);
}

#[test]
fn exit_unless_false_prints_message_and_exits() {
    let (lines, code) = run("ready = 0\nEXIT 1 UNLESS ready, 'not ready'\nSAY 'unreached'");
    assert_eq!(lines, vec!["not ready"]);
    assert_eq!(code, 1);
}

#[test]
fn exit_unless_true_continues() {
    let (lines, code) = run("ready = 1\nEXIT 1 UNLESS ready, 'not ready'\nSAY 'carried on'");
    assert_eq!(lines, vec!["carried on"]);
    assert_eq!(code, 0);
}

// ── SIGNAL ──────────────────────────────────────────────────────────

#[test]
fn signal_unwinds_out_of_a_subroutine() {
    let (lines, _) = run(
        "CALL helper\n\
         SAY 'skipped'\n\
         cleanup:\n\
         SAY 'cleanup ran'\n\
         EXIT 0\n\
         helper:\n\
         SIGNAL cleanup\n\
         RETURN",
    );
    assert_eq!(lines, vec!["cleanup ran"]);
}

#[test]
fn signal_target_is_case_insensitive() {
    let (lines, _) = run("SIGNAL Finish\nSAY 'no'\nFINISH:\nSAY 'yes'");
    assert_eq!(lines, vec!["yes"]);
}

// ── DO OVER ─────────────────────────────────────────────────────────

#[test]
fn do_over_list_iterates_each_element() {
    let (lines, _) = run(
        "items = JSON_PARSE('[\"a\",\"b\",\"c\"]')\n\
         DO item OVER items\n\
         SAY item\n\
         END",
    );
    assert_eq!(lines, vec!["a", "b", "c"]);
}

#[test]
fn do_over_empty_collection_runs_zero_times() {
    let (lines, _) = run(
        "items = JSON_PARSE('[]')\n\
         DO item OVER items\n\
         SAY 'never'\n\
         END\n\
         SAY 'done'",
    );
    assert_eq!(lines, vec!["done"]);
}

#[test]
fn do_over_words_of_a_string() {
    let (lines, _) = run("DO w OVER 'red green blue'\nSAY w\nEND");
    assert_eq!(lines, vec!["red", "green", "blue"]);
}

#[test]
fn do_over_iterates_a_snapshot_despite_mutation() {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    interp.register_function("PUSH", |args| {
        if let Value::List(items) = &args[0] {
            items.borrow_mut().push(args[1].clone());
        }
        Ok(Value::empty())
    });
    interp
        .run_source(
            "items = JSON_PARSE('[1,2,3]')\n\
             seen = 0\n\
             DO x OVER items\n\
             seen = seen + 1\n\
             CALL PUSH items, 99\n\
             END\n\
             SAY seen\n\
             SAY LENGTH(items)",
        )
        .expect("program should run");
    assert_eq!(sink.lines(), vec!["3", "6"]);
}

#[test]
fn do_over_map_iterates_keys() {
    let (lines, _) = run(
        "m = JSON_PARSE('{\"a\":1,\"b\":2}')\n\
         DO k OVER m\n\
         SAY k\n\
         END",
    );
    assert_eq!(lines, vec!["a", "b"]);
}

// ── Collections share references; COPY detaches ─────────────────────

#[test]
fn assignment_aliases_a_list_copy_detaches() {
    let (lines, _) = run(
        "a = JSON_PARSE('[1,2]')\n\
         b = a\n\
         c = COPY(a)\n\
         SAY LENGTH(b) LENGTH(c)",
    );
    assert_eq!(lines, vec!["2 2"]);
}

// ── Program arguments ───────────────────────────────────────────────

#[test]
fn top_level_parse_arg_reads_program_arguments() {
    let lines = run_with_args("PARSE ARG first, second\nSAY second || '/' || first", &["a", "b"]);
    assert_eq!(lines, vec!["b/a"]);
}
