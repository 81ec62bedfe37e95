use crate::schema::SwitchbackConfig;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Jsonc,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;

        match ext {
            "jsonc" => Some(Self::Jsonc),
            "json" => Some(Self::Json),
            "yml" | "yaml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: SwitchbackConfig,
    pub path: PathBuf,
    pub format: ConfigFormat,
}

/// Find and load the configuration. `profile` replaces `active_profile`
/// before validation, so an unknown selection is reported at load time.
pub fn resolve_config(config_path: Option<&Path>, profile: Option<&str>) -> Result<ResolvedConfig> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .or_else(find_config_file)
        .ok_or_else(|| anyhow!("No switchback configuration file found"))?;

    load_with_profile(&path, profile)
}

pub fn load_config_from_file(path: &Path) -> Result<ResolvedConfig> {
    load_with_profile(path, None)
}

fn load_with_profile(path: &Path, profile: Option<&str>) -> Result<ResolvedConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let format = ConfigFormat::from_path(path)
        .ok_or_else(|| anyhow!("Unknown config format for: {}", path.display()))?;

    let mut config = expand_env_vars(parse_config_content(&content, format)?);
    if let Some(profile) = profile {
        config.active_profile = profile.to_string();
    }
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(ResolvedConfig {
        config,
        path: path.to_path_buf(),
        format,
    })
}

fn parse_config_content(content: &str, format: ConfigFormat) -> Result<SwitchbackConfig> {
    match format {
        ConfigFormat::Jsonc => json5::from_str(content).context("Failed to parse JSONC"),
        ConfigFormat::Json => serde_json::from_str(content).context("Failed to parse JSON"),
        ConfigFormat::Yaml => serde_yaml_ng::from_str(content).context("Failed to parse YAML"),
    }
}

const CONFIG_CANDIDATES: &[&str] = &[
    "switchback.jsonc",
    "switchback.json",
    "switchback.yml",
    "switchback.yaml",
    ".switchback.jsonc",
    ".switchback.json",
    ".switchback.yml",
    ".switchback.yaml",
];

/// First existing candidate in the working directory, then in
/// `~/.config/switchback/`.
pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_CANDIDATES.iter().map(PathBuf::from);
    let global = dirs::home_dir()
        .map(|home| home.join(".config").join("switchback"))
        .into_iter()
        .flat_map(|dir| CONFIG_CANDIDATES.iter().map(move |c| dir.join(c)));

    local.chain(global).find(|path| path.exists())
}

/// Only connection details are expanded; names and model ids are taken literally.
fn expand_env_vars(mut config: SwitchbackConfig) -> SwitchbackConfig {
    for provider in config.providers.iter_mut() {
        provider.base_url = expand_env_string(&provider.base_url);
        provider.token = expand_env_string(&provider.token);
        for overlay in provider.env.values_mut() {
            for value in overlay.values_mut() {
                *value = expand_env_string(value);
            }
        }
    }
    if let Some(log_file) = &config.proxy.log_file {
        config.proxy.log_file = Some(PathBuf::from(expand_env_string(
            &log_file.to_string_lossy(),
        )));
    }
    config
}

/// Expand `${VAR}` and `$VAR`. Unset variables are kept verbatim so a typo
/// surfaces as an obviously wrong token instead of an empty one.
fn expand_env_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
            continue;
        }

        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            var_name.push(c);
            chars.next();
        }
        if var_name.is_empty() {
            result.push('$');
        } else if let Ok(value) = env::var(&var_name) {
            result.push_str(&value);
        } else {
            result.push('$');
            result.push_str(&var_name);
        }
    }

    result
}
