use relay_rexx::address::RecordingTarget;
use relay_rexx::error::ErrorKind;
use relay_rexx::interp::{CaptureSink, Interpreter};
use relay_rexx::value::Value;

fn interp_with_target(name: &str) -> (Interpreter, CaptureSink, std::rc::Rc<std::cell::RefCell<Vec<String>>>) {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let (target, received) = RecordingTarget::new();
    interp.register_target(name, Box::new(target));
    (interp, sink, received)
}

#[test]
fn single_line_command_reaches_the_handler() {
    let (mut interp, _, received) = interp_with_target("deployer");
    interp
        .run_source("ADDRESS deployer 'launch web-frontend'")
        .unwrap();
    assert_eq!(received.borrow().as_slice(), ["launch web-frontend"]);
}

#[test]
fn dispatch_sets_rc_result_and_errortext() {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let (target, _) = RecordingTarget::new();
    interp.register_target("db", Box::new(target.replying(Value::string("5 rows"))));
    interp
        .run_source("ADDRESS db 'SELECT'\nSAY RC\nSAY RESULT\nSAY '[' || ERRORTEXT || ']'")
        .unwrap();
    assert_eq!(sink.lines(), vec!["0", "5 rows", "[]"]);
}

#[test]
fn handler_reported_failure_is_not_fatal() {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let (target, _) = RecordingTarget::new();
    interp.register_target("db", Box::new(target.failing(8, "no such table")));
    interp
        .run_source("ADDRESS db 'SELECT'\nSAY RC\nSAY ERRORTEXT\nSAY 'still running'")
        .unwrap();
    assert_eq!(sink.lines(), vec!["8", "no such table", "still running"]);
}

#[test]
fn unregistered_target_is_a_dispatch_error() {
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(CaptureSink::new()));
    let err = interp.run_source("ADDRESS ghost 'boo'").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Dispatch);
    assert!(err.message.contains("GHOST"));
}

#[test]
fn heredoc_body_is_delivered_verbatim_never_executed() {
    let (mut interp, sink, received) = interp_with_target("sqlite");
    interp
        .run_source("ADDRESS sqlite <<SQL\nSAY 'this is data'\nSELECT 1;\nSQL\nSAY 'after'")
        .unwrap();
    // The SAY inside the block must not run.
    assert_eq!(sink.lines(), vec!["after"]);
    assert_eq!(received.borrow().as_slice(), ["SAY 'this is data'\nSELECT 1;"]);
}

#[test]
fn heredoc_placeholders_interpolate_from_variables() {
    let (mut interp, _, received) = interp_with_target("sqlite");
    interp
        .run_source("table = 'users'\nADDRESS sqlite <<SQL\nSELECT * FROM {table};\nSQL")
        .unwrap();
    assert_eq!(received.borrow().as_slice(), ["SELECT * FROM users;"]);
}

#[test]
fn unset_placeholder_renders_its_uppercased_name() {
    let (mut interp, _, received) = interp_with_target("t");
    interp
        .run_source("ADDRESS t <<DOC\nhello {nobody}\nDOC")
        .unwrap();
    assert_eq!(received.borrow().as_slice(), ["hello NOBODY"]);
}

#[test]
fn json_heredoc_is_parsed_before_dispatch() {
    let (mut interp, _, received) = interp_with_target("api");
    interp
        .run_source("ADDRESS api <<REQJSON\n{\"count\": 2, \"action\": \"deploy\"}\nREQJSON")
        .unwrap();
    // Parsed to a structured value; the recording target sees its JSON
    // rendering with map keys in sorted order.
    assert_eq!(received.borrow().as_slice(), [r#"{"action":"deploy","count":2}"#]);
}

#[test]
fn malformed_json_heredoc_is_fatal() {
    let (mut interp, _, _) = interp_with_target("api");
    let err = interp
        .run_source("ADDRESS api <<REQJSON\nnot json at all {\nREQJSON")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Dispatch);
    assert!(err.message.contains("JSON"));
}

#[test]
fn matching_routes_a_line_exactly_once_pre_interpolation() {
    let (mut interp, _, received) = interp_with_target("checker");
    interp
        .run_source(
            "x = 1\n\
             ADDRESS checker MATCHING(\"^\\. (.*)$\")\n\
             . {x} should equal 1\n\
             SAY 'normal statement'",
        )
        .unwrap();
    // Capture group 1 only, braces intact — the checker does its own
    // interpolation.
    assert_eq!(received.borrow().as_slice(), ["{x} should equal 1"]);
}

#[test]
fn matching_mode_ends_at_the_next_address_statement() {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let (checker, checker_recv) = RecordingTarget::new();
    let (other, other_recv) = RecordingTarget::new();
    interp.register_target("checker", Box::new(checker));
    interp.register_target("other", Box::new(other));
    interp
        .run_source(
            "ADDRESS checker MATCHING(\"^> (.*)$\")\n\
             > first\n\
             ADDRESS other 'direct'\n\
             SAY 'end'",
        )
        .unwrap();
    assert_eq!(checker_recv.borrow().as_slice(), ["first"]);
    assert_eq!(other_recv.borrow().as_slice(), ["direct"]);
    assert_eq!(sink.lines(), vec!["end"]);
}

#[test]
fn bare_string_expression_routes_to_the_current_target() {
    let (mut interp, _, received) = interp_with_target("shell");
    interp
        .run_source("ADDRESS shell\n'ls -l'\n'pwd'")
        .unwrap();
    assert_eq!(received.borrow().as_slice(), ["ls -l", "pwd"]);
}

#[test]
fn one_shot_command_does_not_change_the_current_target() {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    let (a, a_recv) = RecordingTarget::new();
    let (b, b_recv) = RecordingTarget::new();
    interp.register_target("a", Box::new(a));
    interp.register_target("b", Box::new(b));
    interp
        .run_source("ADDRESS a\nADDRESS b 'one shot'\n'back to a'")
        .unwrap();
    assert_eq!(b_recv.borrow().as_slice(), ["one shot"]);
    assert_eq!(a_recv.borrow().as_slice(), ["back to a"]);
}

#[test]
fn address_context_is_restored_after_a_call() {
    let (mut interp, _, received) = interp_with_target("outer_env");
    interp
        .run_source(
            "ADDRESS outer_env\n\
             CALL sub\n\
             'after call'\n\
             EXIT 0\n\
             sub:\n\
             ADDRESS\n\
             RETURN",
        )
        .unwrap();
    // The subroutine reset the target, but the caller's context comes back.
    assert_eq!(received.borrow().as_slice(), ["after call"]);
}
