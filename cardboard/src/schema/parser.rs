use crate::error::Result;
use super::types::ProjectConfig;
use std::path::Path;

/// Parse a project YAML file into a ProjectConfig
pub fn parse_config(path: &Path) -> Result<ProjectConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse a project YAML string into a ProjectConfig
pub fn parse_config_str(content: &str) -> Result<ProjectConfig> {
    let config: ProjectConfig = serde_yaml::from_str(content)?;
    Ok(config)
}
