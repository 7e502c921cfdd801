//! Build configuration.
//!
//! Defaults cover the common case: includes resolve against the current
//! directory then `./include/` (the source file's directory is appended
//! by the driver), FASM assembles, and a C linker produces the
//! executable. A `haze.toml` manifest can extend the include path and
//! override either tool:
//!
//! ```toml
//! include = ["vendor/haze"]
//!
//! [assembler]
//! command = "fasm"
//! args = ["-m", "524288"]
//!
//! [linker]
//! command = "gcc"
//! args = ["-m64", "-g"]
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Include search path, in order; first hit wins.
    pub include_dirs: Vec<PathBuf>,
    pub assembler: String,
    pub assembler_args: Vec<String>,
    pub linker: String,
    pub linker_args: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            include_dirs: vec![PathBuf::from("./"), PathBuf::from("./include/")],
            assembler: "fasm".to_string(),
            assembler_args: vec!["-m".to_string(), "524288".to_string()],
            linker: "gcc".to_string(),
            linker_args: vec!["-m64".to_string(), "-g".to_string()],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    include: Vec<PathBuf>,
    assembler: Option<ToolOverride>,
    linker: Option<ToolOverride>,
}

#[derive(Debug, Deserialize)]
struct ToolOverride {
    command: Option<String>,
    args: Option<Vec<String>>,
}

impl BuildConfig {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        let manifest: Manifest =
            toml::from_str(text).map_err(|e| format!("Failed to parse build config: {}", e))?;

        let mut config = BuildConfig::default();
        config.include_dirs.extend(manifest.include);

        if let Some(assembler) = manifest.assembler {
            if let Some(command) = assembler.command {
                config.assembler = command;
            }
            if let Some(args) = assembler.args {
                config.assembler_args = args;
            }
        }
        if let Some(linker) = manifest.linker {
            if let Some(command) = linker.command {
                config.linker = command;
            }
            if let Some(args) = linker.args {
                config.linker_args = args;
            }
        }

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::default();
        assert_eq!(
            config.include_dirs,
            vec![PathBuf::from("./"), PathBuf::from("./include/")]
        );
        assert_eq!(config.assembler, "fasm");
        assert_eq!(config.linker, "gcc");
    }

    #[test]
    fn test_manifest_extends_include_path() {
        let config = BuildConfig::from_toml("include = [\"vendor/haze\"]").unwrap();
        assert_eq!(config.include_dirs.len(), 3);
        assert_eq!(config.include_dirs[2], PathBuf::from("vendor/haze"));
    }

    #[test]
    fn test_manifest_overrides_tools() {
        let config = BuildConfig::from_toml(
            "[assembler]\ncommand = \"fasm2\"\n\n[linker]\nargs = [\"-m64\"]\n",
        )
        .unwrap();
        assert_eq!(config.assembler, "fasm2");
        // Unspecified fields keep their defaults.
        assert_eq!(config.assembler_args, vec!["-m", "524288"]);
        assert_eq!(config.linker, "gcc");
        assert_eq!(config.linker_args, vec!["-m64"]);
    }

    #[test]
    fn test_invalid_manifest_is_an_error() {
        let err = BuildConfig::from_toml("include = 3").unwrap_err();
        assert!(err.contains("Failed to parse build config"));
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let err = BuildConfig::load(Path::new("/nonexistent/haze.toml")).unwrap_err();
        assert!(err.contains("Failed to read"));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haze.toml");
        fs::write(&path, "include = [\"lib\"]").unwrap();
        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.include_dirs[2], PathBuf::from("lib"));
    }
}
