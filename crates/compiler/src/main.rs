//! Haze Compiler CLI
//!
//! Compiles a `.hz` source file to a FASM assembly file, then drives
//! the assembler and linker. Stage errors print as
//! `file:row:col: [ERROR]: message` and exit with code 1, as does a
//! non-zero exit from either external tool.

use clap::Parser as ClapParser;
use hazec::BuildConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "hazec")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Haze compiler - compile .hz programs to executables", long_about = None)]
struct Cli {
    /// Input .hz source file
    source_file: PathBuf,

    /// Only generate the assembly file
    #[arg(long)]
    asm: bool,

    /// Run the program after compiling (if successful)
    #[arg(long)]
    run: bool,

    /// Clean the ASM and OBJ files
    #[arg(long)]
    clean: bool,

    /// Additional include directories, searched before the defaults
    #[arg(long = "include", value_name = "DIR")]
    include_dirs: Vec<PathBuf>,

    /// Build manifest path (defaults to haze.toml next to the source)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let mut config = match load_config(cli) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{}", message);
            return 1;
        }
    };

    for dir in cli.include_dirs.iter().rev() {
        config.include_dirs.insert(0, dir.clone());
    }

    let asm_path = match hazec::compile_file(&cli.source_file, &config) {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{}", message);
            return 1;
        }
    };
    println!("[INFO] Generated assembly file: {}", asm_path.display());

    if cli.asm {
        return 0;
    }

    let obj_path = match hazec::assemble(&asm_path, &config) {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{}", message);
            return 1;
        }
    };

    let exe_path = match hazec::link(&obj_path, &config) {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{}", message);
            return 1;
        }
    };

    if cli.run {
        if let Err(message) = hazec::run_executable(&exe_path) {
            eprintln!("{}", message);
            return 1;
        }
    }

    if cli.clean {
        let _ = fs::remove_file(&asm_path);
        let _ = fs::remove_file(&obj_path);
    }

    0
}

fn load_config(cli: &Cli) -> Result<BuildConfig, String> {
    if let Some(path) = &cli.config {
        return BuildConfig::load(path);
    }

    let manifest = cli
        .source_file
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join("haze.toml");
    if manifest.exists() {
        return BuildConfig::load(&manifest);
    }

    Ok(BuildConfig::default())
}
