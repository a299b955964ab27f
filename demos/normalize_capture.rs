use rnaccess::session::{CleanupAction, CleanupActions, normalize};
use std::env;
use std::fs;
use std::process;

fn print_usage() {
    eprintln!(
        "Usage: cargo run --example normalize_capture -- <capture.txt> <output.txt> [--crlf] [--keep-ansi] [--keep-backspaces] [--keep-cr]"
    );
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        print_usage();
        process::exit(2);
    }

    let input = &args[1];
    let output = &args[2];

    let mut actions = CleanupActions::default();
    for flag in args.iter().skip(3) {
        match flag.as_str() {
            "--crlf" => actions.insert(CleanupAction::NormalizeLineEndings),
            "--keep-ansi" => actions.remove(CleanupAction::StripAnsiCodes),
            "--keep-backspaces" => actions.remove(CleanupAction::ProcessBackspaces),
            "--keep-cr" => actions.remove(CleanupAction::ProcessCarriageReturns),
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            unknown => {
                eprintln!("Unknown flag: {unknown}");
                print_usage();
                process::exit(2);
            }
        }
    }

    let raw = match fs::read(input) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Failed to read capture file '{input}': {err}");
            process::exit(1);
        }
    };

    let cleaned = normalize(&String::from_utf8_lossy(&raw), &actions);
    let enabled: Vec<CleanupAction> = actions.iter().collect();
    println!(
        "{input}: {} bytes in, {} bytes out, actions={enabled:?}",
        raw.len(),
        cleaned.len()
    );

    if let Err(err) = fs::write(output, cleaned) {
        eprintln!("Failed to write output file '{output}': {err}");
        process::exit(1);
    }
}
