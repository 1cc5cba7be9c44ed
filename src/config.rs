// File: src/config.rs
//
// `.loxrc` configuration: whether to color terminal output, where the
// REPL's history file lives, and whether to force a GC cycle on every
// allocation. Looked up first in the current directory, then the
// user's home directory; either file may omit any field.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub color: bool,
    pub history_file: Option<PathBuf>,
    pub gc_stress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config { color: true, history_file: default_history_file(), gc_stress: false }
    }
}

fn default_history_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lox_history"))
}

impl Config {
    /// Reads `./.loxrc`, falling back to `~/.loxrc`, falling back to
    /// built-in defaults if neither exists or parses.
    pub fn load() -> Self {
        for path in Self::candidate_paths() {
            if let Some(config) = Self::read(&path) {
                return config;
            }
        }
        Config::default()
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".loxrc")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".loxrc"));
        }
        paths
    }

    fn read(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        toml::from_str(&text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_color_and_disable_gc_stress() {
        let config = Config::default();
        assert!(config.color);
        assert!(!config.gc_stress);
    }

    #[test]
    fn partial_toml_fills_remaining_fields_from_defaults() {
        let config: Config = toml::from_str("gc_stress = true\n").unwrap();
        assert!(config.gc_stress);
        assert!(config.color);
    }
}
