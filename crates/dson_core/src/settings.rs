//! Import settings.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Knobs for one import session. Deserializable so a host can keep them
/// in a JSON config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Ordered search roots for cross-file references.
    pub content_dirs: Vec<PathBuf>,
    /// 0 = silent .. 5 = promote most warnings to errors.
    pub verbosity: u8,
    /// Escalate missing assets to errors where callers ask for it.
    pub strict: bool,
    /// Skip the case-insensitive directory fallback when a path misses.
    pub case_sensitive_paths: bool,
    /// Global unit scale applied to emitted bone geometry.
    pub scale: f32,
    /// Conjugate world matrices into a Z-up convention on output.
    pub zup: bool,
    /// Recursion guard for formula open-coding.
    pub max_formula_depth: u32,
    /// Pass cap for the morph dependency solver.
    pub max_solver_passes: u32,
    /// Parent-tail gap below `connect_epsilon * scale` marks a bone
    /// as connected.
    pub connect_epsilon: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            content_dirs: Vec::new(),
            verbosity: 2,
            strict: false,
            case_sensitive_paths: false,
            scale: 1.0,
            zup: false,
            max_formula_depth: 8,
            max_solver_passes: 5,
            connect_epsilon: 1e-4,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.verbosity, 2);
        assert_eq!(s.max_solver_passes, 5);
        assert!(!s.strict);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let s: Settings = serde_json::from_str(r#"{"verbosity": 4}"#).unwrap();
        assert_eq!(s.verbosity, 4);
        assert_eq!(s.scale, 1.0);
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = Settings::default();
        s.content_dirs.push(PathBuf::from("/content"));
        s.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.content_dirs, s.content_dirs);
    }
}
