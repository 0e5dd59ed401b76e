use relay_rexx::interp::{CaptureSink, Interpreter};

fn run(src: &str) -> Vec<String> {
    let sink = CaptureSink::new();
    let mut interp = Interpreter::new();
    interp.set_sink(Box::new(sink.clone()));
    interp.run_source(src).expect("program should run");
    sink.lines()
}

#[test]
fn pipe_feeds_the_first_argument() {
    let lines = run("SAY 'hello' |> UPPER()");
    assert_eq!(lines, vec!["HELLO"]);
}

#[test]
fn pipe_with_extra_arguments() {
    let lines = run("SAY 'abcdef' |> SUBSTR(2, 3)");
    assert_eq!(lines, vec!["bcd"]);
}

#[test]
fn placeholder_can_appear_anywhere_and_repeat() {
    let lines = run("SAY 'ab' |> COPIES(_, 2)\nSAY 3 |> MAX(1, _, 2)");
    assert_eq!(lines, vec!["abab", "3"]);
}

#[test]
fn pipe_binds_looser_than_arithmetic() {
    // The whole sum is piped, not just the right operand.
    let lines = run("SAY 40 + 2 |> LENGTH()");
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn lambda_variable_as_a_named_stage() {
    let lines = run("shout = s => UPPER(s) || '!'\nSAY 'go' |> shout");
    assert_eq!(lines, vec!["GO!"]);
}

#[test]
fn inline_lambda_stage_in_a_chain() {
    let lines = run("SAY 10 |> (n => n / 4) |> (n => n + 0.5)");
    assert_eq!(lines, vec!["3"]);
}

#[test]
fn chain_through_user_routine() {
    let lines = run(
        "SAY 'radar' |> CHECK()\n\
         EXIT 0\n\
         check:\n\
         PARSE ARG word\n\
         RETURN word == REVERSE(word)",
    );
    assert_eq!(lines, vec!["1"]);
}

#[test]
fn piped_value_may_be_a_collection() {
    let lines = run("SAY JSON_PARSE('[1,2,3]') |> LENGTH()");
    assert_eq!(lines, vec!["3"]);
}
