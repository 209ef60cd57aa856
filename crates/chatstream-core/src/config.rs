use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use anyhow::{Result, anyhow};

use crate::ai::openai::DEFAULT_ENDPOINT;

pub const DEFAULT_MODEL: &str = "gpt-4";

/// What to do with partial assistant text when a stream fails midway
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamErrorPolicy {
    /// Keep whatever text arrived before the failure
    #[default]
    Retain,
    /// Remove the failed stream's assistant entry
    Rollback,
}

impl FromStr for StreamErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "retain" => Ok(StreamErrorPolicy::Retain),
            "rollback" => Ok(StreamErrorPolicy::Rollback),
            other => Err(format!("unknown stream error policy '{}' (expected retain or rollback)", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub history_path: Option<PathBuf>,
    pub on_stream_error: Option<StreamErrorPolicy>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, config_content)?;
        Ok(())
    }

    /// The credential, preferring the environment over the config file.
    ///
    /// It is never validated here; a bad key only shows up as a failed request.
    pub fn api_key(&self) -> Option<String> {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }

    pub fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }

    pub fn history_path(&self) -> Result<PathBuf> {
        match &self.history_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("history.db")),
        }
    }

    pub fn stream_error_policy(&self) -> StreamErrorPolicy {
        self.on_stream_error.unwrap_or_default()
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("chatstream"))
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }
}
