use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_rexx::interp::Interpreter;
use relay_rexx::value::Value;

#[derive(Parser)]
#[command(name = "relay-rexx")]
#[command(about = "A REXX-dialect runtime with pipes and command dispatch")]
#[command(version)]
struct Cli {
    /// Source file to execute
    source: Option<PathBuf>,

    /// Execute an expression or statement directly
    #[arg(short = 'e', long)]
    eval: Option<String>,

    /// Start the interactive REPL (also the default with no source)
    #[arg(short, long)]
    interactive: bool,

    /// Arguments passed to the program (bound by PARSE ARG)
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.interactive {
        run_repl();
        return;
    }

    if let Some(source) = &cli.eval {
        // In -e mode the first trailing word parses into the source slot;
        // fold it back into the program arguments.
        let mut args: Vec<String> = Vec::new();
        if let Some(first) = &cli.source {
            args.push(first.display().to_string());
        }
        args.extend(cli.args.iter().cloned());
        std::process::exit(run(source, &args));
    }

    if let Some(path) = &cli.source {
        match std::fs::read_to_string(path) {
            Ok(source) => std::process::exit(run(&source, &cli.args)),
            Err(e) => {
                eprintln!("relay-rexx: cannot read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    run_repl();
}

fn run(source: &str, args: &[String]) -> i32 {
    let mut interp = Interpreter::new();
    interp.set_args(args.iter().map(Value::string).collect());
    match interp.run_source(source) {
        Ok(outcome) => outcome.exit_code,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

fn run_repl() {
    println!("relay-rexx {} — interactive mode", env!("CARGO_PKG_VERSION"));
    println!("Type statements. Use EXIT to quit.\n");

    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("relay-rexx: cannot initialize line editor: {e}");
            std::process::exit(1);
        }
    };

    let mut interp = Interpreter::new();

    loop {
        match rl.readline("rexx> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);
                if trimmed.eq_ignore_ascii_case("exit") {
                    break;
                }
                match interp.run_source(trimmed) {
                    Ok(outcome) if outcome.exit_code != 0 => {
                        std::process::exit(outcome.exit_code)
                    }
                    Ok(_) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
            Err(
                rustyline::error::ReadlineError::Interrupted | rustyline::error::ReadlineError::Eof,
            ) => break,
            Err(e) => {
                eprintln!("relay-rexx: {e}");
                break;
            }
        }
    }
}
