use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_ENGINE_URL: &str = "ws://127.0.0.1:8765/engine";
pub const DEFAULT_PAGE_CHAR_BUDGET: usize = 15_000;
pub const MIN_PAGE_CHAR_BUDGET: usize = 1_000;
pub const MAX_PAGE_CHAR_BUDGET: usize = 100_000;
pub const DEFAULT_REWRITE_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_CHAT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_CHAT_TEMPERATURE: f32 = 0.3;
const MAX_TEMPERATURE: f32 = 2.0;
const MAX_CHAT_MAX_TOKENS: u32 = 8_192;

const APP_DIR_NAME: &str = "retext";
const CONFIG_FILE_NAME: &str = "config.json";
const ENV_ENGINE_URL: &str = "RETEXT_ENGINE_URL";
const ENV_MODEL: &str = "RETEXT_MODEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no user configuration directory on this platform")]
    NoConfigDir,
    #[error("failed to access config file {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("config file is not valid JSON: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default = "default_engine_url")]
    pub engine_url: String,
    #[serde(default = "default_model_catalog")]
    pub model_catalog: Vec<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default = "default_page_char_budget")]
    pub page_char_budget: usize,
    #[serde(default = "default_rewrite_temperature")]
    pub rewrite_temperature: f32,
    #[serde(default = "default_chat_max_tokens")]
    pub chat_max_tokens: u32,
    #[serde(default = "default_chat_temperature")]
    pub chat_temperature: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            engine_url: default_engine_url(),
            model_catalog: default_model_catalog(),
            model_id: None,
            page_char_budget: default_page_char_budget(),
            rewrite_temperature: default_rewrite_temperature(),
            chat_max_tokens: default_chat_max_tokens(),
            chat_temperature: default_chat_temperature(),
        }
    }
}

fn default_engine_url() -> String {
    DEFAULT_ENGINE_URL.to_string()
}

fn default_model_catalog() -> Vec<String> {
    [
        "Qwen2.5-0.5B-Instruct-q4f16_1-MLC",
        "Llama-3.2-1B-Instruct-q4f16_1-MLC",
        "Phi-3.5-mini-instruct-q4f16_1-MLC",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_page_char_budget() -> usize {
    DEFAULT_PAGE_CHAR_BUDGET
}

fn default_rewrite_temperature() -> f32 {
    DEFAULT_REWRITE_TEMPERATURE
}

fn default_chat_max_tokens() -> u32 {
    DEFAULT_CHAT_MAX_TOKENS
}

fn default_chat_temperature() -> f32 {
    DEFAULT_CHAT_TEMPERATURE
}

pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Reads, normalizes and env-overrides the settings at the default location.
pub fn load_settings() -> Result<AppSettings, ConfigError> {
    let settings = normalize_loaded_settings(read_config(&config_path()?)?);
    Ok(apply_environment(settings, |key| std::env::var(key).ok()))
}

pub fn save_settings(settings: AppSettings) -> Result<AppSettings, ConfigError> {
    let settings = validate_settings(settings)?;
    write_config(&config_path()?, &settings)?;
    Ok(settings)
}

pub fn read_config(path: &Path) -> Result<AppSettings, ConfigError> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let content = fs::read_to_string(path).map_err(|err| ConfigError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    serde_json::from_str::<AppSettings>(&content).map_err(|err| ConfigError::Parse(err.to_string()))
}

pub fn write_config(path: &Path, settings: &AppSettings) -> Result<(), ConfigError> {
    let io_error = |err: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let serialized = serde_json::to_string_pretty(settings)
        .map_err(|err| ConfigError::Parse(err.to_string()))?;
    fs::write(path, serialized).map_err(io_error)
}

pub fn normalize_loaded_settings(mut settings: AppSettings) -> AppSettings {
    settings.engine_url = settings.engine_url.trim().to_string();
    if settings.engine_url.is_empty() {
        settings.engine_url = default_engine_url();
    }
    settings.model_id = normalize_model_id(settings.model_id);
    settings.model_catalog = normalize_catalog(settings.model_catalog);

    if !(MIN_PAGE_CHAR_BUDGET..=MAX_PAGE_CHAR_BUDGET).contains(&settings.page_char_budget) {
        warn!(
            page_char_budget = settings.page_char_budget,
            "loaded page character budget is out of range; clamping"
        );
        settings.page_char_budget = settings
            .page_char_budget
            .clamp(MIN_PAGE_CHAR_BUDGET, MAX_PAGE_CHAR_BUDGET);
    }

    settings.rewrite_temperature = clamp_temperature(settings.rewrite_temperature, "rewrite");
    settings.chat_temperature = clamp_temperature(settings.chat_temperature, "chat");

    if settings.chat_max_tokens == 0 || settings.chat_max_tokens > MAX_CHAT_MAX_TOKENS {
        warn!(
            chat_max_tokens = settings.chat_max_tokens,
            "loaded chat token limit is out of range; resetting to default"
        );
        settings.chat_max_tokens = DEFAULT_CHAT_MAX_TOKENS;
    }

    settings
}

pub fn validate_settings(mut settings: AppSettings) -> Result<AppSettings, ConfigError> {
    let url = settings.engine_url.trim();
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(ConfigError::Invalid(
            "engineUrl must start with ws:// or wss://".to_string(),
        ));
    }
    settings.engine_url = url.to_string();
    settings.model_id = normalize_model_id(settings.model_id);
    settings.model_catalog = normalize_catalog(settings.model_catalog);

    if !(MIN_PAGE_CHAR_BUDGET..=MAX_PAGE_CHAR_BUDGET).contains(&settings.page_char_budget) {
        return Err(ConfigError::Invalid(format!(
            "pageCharBudget must be between {MIN_PAGE_CHAR_BUDGET} and {MAX_PAGE_CHAR_BUDGET}"
        )));
    }

    for (name, value) in [
        ("rewriteTemperature", settings.rewrite_temperature),
        ("chatTemperature", settings.chat_temperature),
    ] {
        if !(0.0..=MAX_TEMPERATURE).contains(&value) {
            return Err(ConfigError::Invalid(format!(
                "{name} must be between 0 and {MAX_TEMPERATURE}"
            )));
        }
    }

    if !(1..=MAX_CHAT_MAX_TOKENS).contains(&settings.chat_max_tokens) {
        return Err(ConfigError::Invalid(format!(
            "chatMaxTokens must be between 1 and {MAX_CHAT_MAX_TOKENS}"
        )));
    }

    Ok(settings)
}

/// Applies `RETEXT_ENGINE_URL` / `RETEXT_MODEL` on top of file settings.
pub fn apply_environment(
    mut settings: AppSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> AppSettings {
    if let Some(url) = lookup(ENV_ENGINE_URL).filter(|value| !value.trim().is_empty()) {
        settings.engine_url = url.trim().to_string();
    }
    if let Some(model) = normalize_model_id(lookup(ENV_MODEL)) {
        settings.model_id = Some(model);
    }
    settings
}

fn normalize_model_id(model_id: Option<String>) -> Option<String> {
    model_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn normalize_catalog(catalog: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(catalog.len());
    for id in catalog {
        let id = id.trim();
        if !id.is_empty() && !normalized.iter().any(|existing| existing == id) {
            normalized.push(id.to_string());
        }
    }
    normalized
}

fn clamp_temperature(value: f32, name: &str) -> f32 {
    if value.is_nan() {
        warn!(name, "temperature is not a number; using 0");
        return 0.0;
    }
    value.clamp(0.0, MAX_TEMPERATURE)
}
