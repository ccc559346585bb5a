//! Pipeline configuration file: JSON, snake_case keys.

use std::path::Path;

use serde::Deserialize;

use crate::errors::ConfigError;

/// A pipeline name: length >= 3, starts with an ASCII letter, contains only
/// letters, digits, `-` and `_`.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {
            name.len() >= 3 && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub name: String,
    /// Paths to `.py` scripts, resolved relative to the config file, run in order.
    pub scripts: Vec<String>,
    pub source_pipeline_count: usize,
    #[serde(default)]
    pub target_pipeline_names: Vec<String>,
}

impl PipelineConfig {
    /// Loads and validates a pipeline configuration file.
    pub fn load(path: &str) -> Result<PipelineConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut config: PipelineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;

        let base_dir = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
        config.scripts = config
            .scripts
            .iter()
            .map(|rel| base_dir.join(rel).to_string_lossy().into_owned())
            .collect();

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.name)?;
        if self.scripts.is_empty() {
            return Err(ConfigError::NoScripts);
        }
        for script in &self.scripts {
            let p = Path::new(script);
            if !p.exists() {
                return Err(ConfigError::ScriptNotFound(script.clone()));
            }
            if p.extension().and_then(|e| e.to_str()) != Some("py") {
                return Err(ConfigError::ScriptNotPython(script.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn accepts_valid_names() {
        assert!(validate_name("abc").is_ok());
        assert!(validate_name("Pipeline-1_a").is_ok());
    }

    #[test]
    fn rejects_short_names() {
        assert!(validate_name("ab").is_err());
    }

    #[test]
    fn rejects_names_not_starting_with_a_letter() {
        assert!(validate_name("1abc").is_err());
        assert!(validate_name("-abc").is_err());
    }

    #[test]
    fn rejects_names_with_invalid_characters() {
        assert!(validate_name("abc def").is_err());
        assert!(validate_name("abc.def").is_err());
    }

    #[test]
    fn loads_and_resolves_script_paths_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("step.py");
        std::fs::write(&script_path, "def step():\n    pass\n").unwrap();

        let config_path = dir.path().join("pipeline.json");
        let mut f = std::fs::File::create(&config_path).unwrap();
        write!(
            f,
            r#"{{"name": "abc", "scripts": ["step.py"], "source_pipeline_count": 0}}"#
        )
        .unwrap();

        let config = PipelineConfig::load(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.scripts.len(), 1);
        assert!(Path::new(&config.scripts[0]).exists());
        assert!(config.target_pipeline_names.is_empty());
    }

    #[test]
    fn rejects_missing_scripts() {
        assert!(matches!(
            PipelineConfig {
                name: "abc".into(),
                scripts: vec![],
                source_pipeline_count: 0,
                target_pipeline_names: vec![],
            }
            .validate(),
            Err(ConfigError::NoScripts)
        ));
    }
}
