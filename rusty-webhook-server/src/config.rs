//! Loading and validating the endpoint configuration file.

use std::collections::btree_map;
use std::path::{Path, PathBuf};

use rusty_webhook_api::api::{ConfigFile, EndpointSpec, HEALTH_PATH, MIN_TOKEN_LEN};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode config: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{endpoint} {detail}")]
    Validation { endpoint: String, detail: String },
}

/// One fully loaded and validated configuration generation.
///
/// Never mutated after construction, the next load replaces it as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    endpoints: ConfigFile,
}

impl ConfigSnapshot {
    /// Decodes and validates configuration text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let endpoints: ConfigFile = serde_json::from_str(text)?;
        for (endpoint, spec) in &endpoints {
            validate(endpoint, spec).map_err(|detail| ConfigError::Validation {
                endpoint: endpoint.clone(),
                detail,
            })?;
        }
        Ok(Self { endpoints })
    }

    /// Endpoint path to spec, sorted by path.
    pub fn endpoints(&self) -> &ConfigFile {
        &self.endpoints
    }
}

impl IntoIterator for ConfigSnapshot {
    type Item = (String, EndpointSpec);
    type IntoIter = btree_map::IntoIter<String, EndpointSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.into_iter()
    }
}

/// Reads the file at `path` and builds a snapshot from it.
pub async fn load(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    ConfigSnapshot::from_json(&text)
}

fn validate(endpoint: &str, spec: &EndpointSpec) -> Result<(), String> {
    // These would make the router panic when registering the route.
    if !endpoint.starts_with('/') {
        return Err(String::from("path must start with '/'"));
    }
    if endpoint.contains([':', '*']) {
        return Err(String::from("path must not contain ':' or '*'"));
    }
    if endpoint == HEALTH_PATH {
        return Err(String::from("path is reserved for the health check"));
    }

    if spec.commands.is_empty() {
        return Err(String::from("commands: zero value"));
    }
    if let Some(i) = spec.commands.iter().position(|c| c.trim().is_empty()) {
        return Err(format!("commands[{i}]: blank command"));
    }
    if spec.token.chars().count() < MIN_TOKEN_LEN {
        return Err(format!("token: less than min ({MIN_TOKEN_LEN})"));
    }
    Ok(())
}
