//! Eel compiler library.
//!
//! Provides single-pass compilation of Eel source text into two text
//! artifacts: a listing of three-address intermediate code ("quads")
//! and an assembly program for a MIPS-like target.
//!
//! The pipeline is `Lexer` -> `Parser`, where the parser doubles as
//! the driver: it emits quads as it goes and flushes the final code
//! generator at every block boundary. There is no separate AST and no
//! second pass.
//!
//! ```rust,ignore
//! let artifacts = eelc::compile_source(source)?;
//! println!("{}", artifacts.intermediate);
//! println!("{}", artifacts.assembly);
//! ```

pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod quads;
pub mod symbols;

pub use codegen::FinalGen;
pub use error::CompileError;
pub use lexer::{Cursor, Lexer, Position, Token, TokenKind};
pub use parser::Parser;
pub use quads::{Quad, QuadGen, QuadOp};
pub use symbols::{Argument, CallableKind, Entity, FunctionEntity, ParMode, Scope, SymbolTable};

use std::fs;
use std::path::{Path, PathBuf};

/// The two text artifacts of a successful compilation.
#[derive(Debug)]
pub struct Artifacts {
    /// One line per quad: `<id>: (<op>, <term0>, <term1>, <target>)`.
    pub intermediate: String,
    /// Assembly text, one instruction per line, labels flush left.
    pub assembly: String,
}

/// Compile Eel source text into its intermediate listing and assembly.
pub fn compile_source(source: &str) -> Result<Artifacts, CompileError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.parse()?;
    Ok(Artifacts {
        intermediate: parser.quads.listing(),
        assembly: parser.final_gen.formatted(),
    })
}

/// Where the intermediate listing of `source_path` goes: a sibling
/// file with the `eeli` extension.
pub fn intermediate_path(source_path: &Path) -> PathBuf {
    source_path.with_extension("eeli")
}

/// Where the assembly of `source_path` goes: a sibling `.s` file.
pub fn assembly_path(source_path: &Path) -> PathBuf {
    source_path.with_extension("s")
}

/// Compile a source file and write both artifacts next to it.
///
/// Compile errors come back prefixed with the source path, ready to
/// print; I/O failures come back as plain sentences.
pub fn compile_file(source_path: &Path) -> Result<(), String> {
    let source = fs::read_to_string(source_path)
        .map_err(|e| format!("Failed to read source file: {}", e))?;

    let artifacts =
        compile_source(&source).map_err(|e| format!("{}:{}", source_path.display(), e))?;

    let intermediate = intermediate_path(source_path);
    fs::write(&intermediate, &artifacts.intermediate)
        .map_err(|e| format!("Failed to write {}: {}", intermediate.display(), e))?;

    let assembly = assembly_path(source_path);
    fs::write(&assembly, &artifacts.assembly)
        .map_err(|e| format!("Failed to write {}: {}", assembly.display(), e))?;

    Ok(())
}
