use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::args::DriverArgs;
use crate::constants::CONFIG_FILE;

/// Optional per-project configuration, merged into the driver arguments
/// before the graph is built. Lives in a `cinder.toml` next to the sources.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub includes: Vec<PathBuf>,
    pub defines: Vec<String>,
    pub libpaths: Vec<PathBuf>,
    pub libraries: Vec<String>,
}

impl ProjectConfig {
    /// Load `cinder.toml` from `dir`, or defaults when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load_near(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        // Search paths in the file are relative to the file.
        for entry in config.includes.iter_mut().chain(config.libpaths.iter_mut()) {
            if entry.is_relative() {
                *entry = dir.join(&*entry);
            }
        }
        Ok(config)
    }

    /// Merge into `args`; command-line entries stay first.
    pub fn apply(self, args: &mut DriverArgs) {
        args.includes.extend(self.includes);
        args.defines.extend(self.defines);
        args.libpaths.extend(self.libpaths);
        for library in self.libraries {
            args.push_library(library);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProjectConfig;
    use crate::args::DriverArgs;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load_near(dir.path()).unwrap();
        assert!(config.includes.is_empty());
        assert!(config.libraries.is_empty());
    }

    #[test]
    fn config_merges_into_args_with_relative_paths_resolved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cinder.toml"),
            "includes = [\"include\"]\ndefines = [\"TRACE=1\"]\nlibraries = [\"m\"]\n",
        )
        .unwrap();

        let config = ProjectConfig::load_near(dir.path()).unwrap();
        let mut args = DriverArgs::default();
        config.apply(&mut args);

        assert_eq!(args.includes, vec![dir.path().join("include")]);
        assert_eq!(args.defines, vec!["TRACE=1".to_string()]);
        assert_eq!(args.libraries_snapshot(), vec!["m".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cinder.toml"), "objects = []\n").unwrap();
        assert!(ProjectConfig::load_near(dir.path()).is_err());
    }
}
