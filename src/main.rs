use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use tansy::context::Context;
use tansy::error::InterpretError;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => repl(),
        [path] => run_file(path),
        _ => {
            eprintln!("Usage: tansy [path]");
            ExitCode::from(64)
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Can't open '{}': {}", path, e);
            return ExitCode::from(64);
        }
    };
    let mut ctx = Context::default();
    match ctx.interpret(&source, path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(errs)) => {
            for e in &errs {
                eprintln!("{}", e);
            }
            ExitCode::from(65)
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::from(70)
        }
    }
}

fn repl() -> ExitCode {
    let mut ctx = Context::default();
    let stdin = io::stdin();
    let mut line_no = 0u32;
    print!("> ");
    let _ = io::stdout().flush();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        line_no += 1;
        match ctx.interpret(&line, &format!("<repl:{}>", line_no)) {
            Ok(()) => {}
            Err(e) => eprintln!("{}", e),
        }
        print!("> ");
        let _ = io::stdout().flush();
    }
    println!();
    ExitCode::SUCCESS
}
