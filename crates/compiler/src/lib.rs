//! Haze Compiler Library
//!
//! Compiles `.hz` source to x86-64 assembly in the FASM MS64 COFF
//! dialect, targeting the Windows x64 calling convention, and can drive
//! the external assembler and linker to produce an executable.
//!
//! The pipeline is four stages in strict sequence:
//!
//! ```text
//! source text -> Scanner -> Preprocessor -> Parser -> Generator -> .asm
//! ```
//!
//! Each stage fully consumes its input before the next runs, and every
//! stage reports failures through [`CompileError`] with the source
//! location attached. [`compile_source`] runs the pipeline in memory;
//! [`compile_file`] adds the file plumbing, and [`assemble`] / [`link`]
//! hand the result to FASM and the C linker configured in
//! [`BuildConfig`].

pub mod ast;
pub mod codegen;
pub mod config;
pub mod error;
pub mod parser;
pub mod preprocessor;
pub mod scanner;

pub use codegen::Generator;
pub use config::BuildConfig;
pub use error::{CompileError, SourceLocation};
pub use parser::Parser;
pub use preprocessor::Preprocessor;
pub use scanner::{Scanner, Token, TokenKind};

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Run the whole pipeline over in-memory source text and return the
/// generated assembly. `file` labels diagnostics; `include_dirs` is the
/// ordered `%include` search path.
pub fn compile_source(
    source: &str,
    file: &str,
    include_dirs: &[PathBuf],
) -> Result<String, CompileError> {
    let tokens = Scanner::new(source, file).scan()?;
    let tokens = Preprocessor::new().preprocess(tokens, include_dirs)?;
    let declarations = Parser::new(tokens).parse()?;
    Generator::new().generate(&declarations)
}

/// Compile a source file and write the assembly next to it with an
/// `.asm` suffix. The source file's directory is appended to the
/// include search path, after the configured directories.
pub fn compile_file(input: &Path, config: &BuildConfig) -> Result<PathBuf, String> {
    let source = fs::read_to_string(input)
        .map_err(|e| format!("Failed to read '{}': {}", input.display(), e))?;

    let mut include_dirs = config.include_dirs.clone();
    if let Some(parent) = input.parent() {
        include_dirs.push(parent.to_path_buf());
    }

    let asm = compile_source(&source, &input.to_string_lossy(), &include_dirs)
        .map_err(|e| e.to_string())?;

    let asm_path = input.with_extension("asm");
    fs::write(&asm_path, asm)
        .map_err(|e| format!("Failed to write '{}': {}", asm_path.display(), e))?;
    Ok(asm_path)
}

/// Assemble with FASM; the object file lands next to the assembly with
/// an `.obj` suffix.
pub fn assemble(asm_path: &Path, config: &BuildConfig) -> Result<PathBuf, String> {
    let mut args = config.assembler_args.clone();
    args.push(asm_path.to_string_lossy().into_owned());
    run_tool(&config.assembler, &args)?;
    Ok(asm_path.with_extension("obj"))
}

/// Link the object file into an executable with the configured C
/// linker.
pub fn link(obj_path: &Path, config: &BuildConfig) -> Result<PathBuf, String> {
    let exe_path = obj_path.with_extension(std::env::consts::EXE_EXTENSION);

    let mut args = config.linker_args.clone();
    args.push(obj_path.to_string_lossy().into_owned());
    args.push("-o".to_string());
    args.push(exe_path.to_string_lossy().into_owned());
    run_tool(&config.linker, &args)?;
    Ok(exe_path)
}

/// Run the produced executable, returning its exit code.
pub fn run_executable(exe_path: &Path) -> Result<i32, String> {
    println!("[CMD] {}", exe_path.display());
    let status = Command::new(exe_path)
        .status()
        .map_err(|e| format!("Failed to run '{}': {}", exe_path.display(), e))?;
    Ok(status.code().unwrap_or(-1))
}

fn run_tool(command: &str, args: &[String]) -> Result<(), String> {
    println!("[CMD] {} {}", command, args.join(" "));

    let status = Command::new(command).args(args).status().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            format!("'{}' not found in PATH", command)
        } else {
            format!("Failed to run '{}': {}", command, e)
        }
    })?;

    if !status.success() {
        return Err(format!(
            "'{}' exited with code {}",
            command,
            status.code().unwrap_or(-1)
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_source_minimal_program() {
        let asm = compile_source("proc main() -> i32 { return 0; }", "min.hz", &[]).unwrap();
        assert!(asm.starts_with("format MS64 COFF"));
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_compile_source_reports_stage_errors_with_location() {
        let err = compile_source("proc main() -> i32 { return $; }", "bad.hz", &[]).unwrap_err();
        assert!(err.to_string().starts_with("bad.hz:1:"));
        assert!(err.to_string().contains("[ERROR]"));
    }

    #[test]
    fn test_compile_file_writes_asm_next_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("prog.hz");
        fs::write(&source_path, "proc main() -> i32 { return 0; }\n").unwrap();

        let asm_path = compile_file(&source_path, &BuildConfig::default()).unwrap();
        assert_eq!(asm_path, dir.path().join("prog.asm"));
        let asm = fs::read_to_string(&asm_path).unwrap();
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_compile_file_resolves_includes_from_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("defs.hz"), "%define ANSWER 42\n").unwrap();
        let source_path = dir.path().join("prog.hz");
        fs::write(
            &source_path,
            "%include \"defs.hz\"\nproc main() -> i32 { return ANSWER; }\n",
        )
        .unwrap();

        let asm_path = compile_file(&source_path, &BuildConfig::default()).unwrap();
        let asm = fs::read_to_string(&asm_path).unwrap();
        assert!(asm.contains("mov rax, 42"));
    }

    #[test]
    fn test_compile_file_surfaces_compile_errors_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("broken.hz");
        fs::write(&source_path, "proc main() -> i32 { return nope; }\n").unwrap();

        let err = compile_file(&source_path, &BuildConfig::default()).unwrap_err();
        assert!(err.contains("[ERROR]"));
        assert!(err.contains("Undefined variable 'nope'"));
    }
}
