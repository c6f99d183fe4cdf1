//! Eel compiler CLI.
//!
//! Compiles one Eel source file into two sibling artifacts: the
//! intermediate quad listing (`.eeli`) and the target assembly (`.s`).

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "eelc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Eel compiler - produce quad listings and assembly", long_about = None)]
struct Cli {
    /// Input Eel source file
    #[arg(required_unless_present = "completions")]
    source: Option<PathBuf>,

    /// Generate a shell completion script and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "eelc", &mut io::stdout());
        return;
    }

    match cli.source {
        Some(source) => run_build(&source),
        None => {
            // clap's required_unless_present already rejects this; be
            // explicit anyway rather than panic.
            let _ = Cli::command().print_help();
            process::exit(2);
        }
    }
}

fn run_build(source: &Path) {
    match eelc::compile_file(source) {
        Ok(()) => {
            println!(
                "Wrote intermediate code to {}",
                eelc::intermediate_path(source).display()
            );
            println!(
                "Wrote final code to {}",
                eelc::assembly_path(source).display()
            );
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}
