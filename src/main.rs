//! Front-end shell for the virtual machine.
//!
//! Loads an object file at address 0 and runs it, or serves the remote
//! debug stub over the standard streams.
//!
//! # Usage
//! ```text
//! stackvm [OPTIONS] <object-file> [ARGUMENT...]
//! ```
//!
//! # Options
//! - `-m, --memory <words>`: VM memory size in words (default 1048576)
//! - `-s, --stack-size <words>`: data-stack capacity (default 4096)
//! - `-r, --return-stack-size <words>`: return-stack capacity (default 4096)
//! - `-g, --gdb`: serve the remote debug protocol on stdin/stdout instead
//!   of running directly
//!
//! `<object-file>` and the trailing arguments are registered as the
//! machine's argument vector, reachable from VM code via the ARGC/ARGV
//! traps.

use std::env;
use std::fs::File;
use std::io;
use std::process;

use stackvm::asm::disass;
use stackvm::gdb::GdbStub;
use stackvm::loader::load_object;
use stackvm::vm::{Machine, DEFAULT_STACK_SIZE};
use stackvm::{error, UWord};

/// Default size of VM memory in words.
const DEFAULT_MEMORY: UWord = 1 << 20;
/// Largest accepted size option, in words.
const MAX_SIZE: UWord = 1 << 30;

fn print_usage(program: &str) {
    eprintln!("Usage: {} [OPTIONS] <object-file> [ARGUMENT...]", program);
    eprintln!();
    eprintln!("Run a virtual-machine object file.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -m, --memory <words>             VM memory size (default {})", DEFAULT_MEMORY);
    eprintln!("  -s, --stack-size <words>         data-stack capacity (default {})", DEFAULT_STACK_SIZE);
    eprintln!("  -r, --return-stack-size <words>  return-stack capacity (default {})", DEFAULT_STACK_SIZE);
    eprintln!("  -g, --gdb                        serve the debug stub on stdin/stdout");
    eprintln!("  -h, --help                       show this help");
}

fn parse_size(option: &str, value: Option<&String>) -> UWord {
    let text = match value {
        Some(text) => text,
        None => {
            eprintln!("{} requires an argument", option);
            process::exit(1);
        }
    };
    match text.parse::<UWord>() {
        Ok(size) if (1..=MAX_SIZE).contains(&size) => size,
        _ => {
            eprintln!("{} must be a positive number of words up to {}", option, MAX_SIZE);
            process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let mut memory_words = DEFAULT_MEMORY;
    let mut stack_size = DEFAULT_STACK_SIZE;
    let mut return_stack_size = DEFAULT_STACK_SIZE;
    let mut gdb_mode = false;

    let mut i = 1;
    let object_index = loop {
        match args.get(i).map(String::as_str) {
            Some(k @ ("--memory" | "-m")) => {
                i += 1;
                memory_words = parse_size(k, args.get(i));
            }
            Some(k @ ("--stack-size" | "-s")) => {
                i += 1;
                stack_size = parse_size(k, args.get(i));
            }
            Some(k @ ("--return-stack-size" | "-r")) => {
                i += 1;
                return_stack_size = parse_size(k, args.get(i));
            }
            Some("--gdb" | "-g") => gdb_mode = true,
            Some(option) if option.starts_with('-') && option.len() > 1 => {
                eprintln!("unrecognised option '{}'", option);
                eprintln!("Try '{} --help' for more information.", args[0]);
                process::exit(1);
            }
            Some(_) => break i,
            None => {
                eprintln!("no object file given");
                process::exit(1);
            }
        }
        i += 1;
    };

    let object_path = &args[object_index];
    let mut m = Machine::new(memory_words, return_stack_size, stack_size);
    m.register_args(&args[object_index..]);

    let file = match File::open(object_path) {
        Ok(file) => file,
        Err(err) => {
            error!("cannot open file {}: {}", object_path, err);
            process::exit(1);
        }
    };
    if let Err(err) = load_object(&mut m, file, 0) {
        error!("could not load {}: {}", object_path, err);
        process::exit(1);
    }

    if gdb_mode {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut stub = GdbStub::new(stdin.lock(), stdout.lock());
        match stub.serve(&mut m) {
            Ok(()) => {}
            // The debugger hanging up ends the session.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(err) => {
                error!("debug session failed: {}", err);
                process::exit(1);
            }
        }
        return;
    }

    if let Err(err) = m.run() {
        let at = m.pc();
        match m.load_word(at) {
            Ok(word) => error!(
                "error {} ({}) raised at pc ${:x}: {}",
                err.code(),
                err,
                at,
                disass(word, at)
            ),
            Err(_) => error!("error {} ({}) raised at pc ${:x}", err.code(), err, at),
        }
        process::exit(1);
    }
}
