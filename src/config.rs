use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::aliases::product_aliases_path;
use crate::browser::BrowserConfig;
use crate::session::SessionConfig;
use crate::transport::ProcessCommand;

pub const GIS_ENV: &str = "SMALLWORLD_GIS";
pub const METHOD_FINDER_ENV: &str = "MAGIK_METHOD_FINDER";

/// Optional overrides read from `settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gis_path: Option<PathBuf>,
    pub aliases_file: Option<PathBuf>,
    pub environment_file: Option<PathBuf>,
    pub method_finder: Option<ProcessCommand>,
    pub prompt: Option<String>,
    pub line_terminator: Option<String>,
    pub default_package: Option<String>,
}

pub fn settings_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    Ok(magik_session_home()?.join("settings.json"))
}

/// Loads the settings file. A missing default file means "no overrides"; a
/// file named on the command line must exist.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let path = settings_path(explicit)?;
    if explicit.is_none() && !path.exists() {
        tracing::debug!(path = %path.display(), "no settings file");
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    let settings = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
    tracing::debug!(path = %path.display(), "settings loaded");
    Ok(settings)
}

pub fn resolve_gis_path(flag: Option<&Path>, settings: &Settings) -> Result<PathBuf> {
    first_of(
        flag.map(Path::to_path_buf),
        env_path(GIS_ENV),
        settings.gis_path.clone(),
    )
    .with_context(|| {
        format!("Smallworld installation not configured (use --gis or set {GIS_ENV})")
    })
}

/// Falls back to the core product's own `config/gis_aliases`.
pub fn resolve_aliases_file(flag: Option<&Path>, gis_path: &Path, settings: &Settings) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| settings.aliases_file.clone())
        .unwrap_or_else(|| product_aliases_path(gis_path))
}

pub fn resolve_environment_file(flag: Option<&Path>, settings: &Settings) -> Option<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| settings.environment_file.clone())
}

pub fn resolve_method_finder(
    flag: Option<ProcessCommand>,
    settings: &Settings,
) -> Result<ProcessCommand> {
    first_of(
        flag,
        env_path(METHOD_FINDER_ENV).map(ProcessCommand::new),
        settings.method_finder.clone(),
    )
    .with_context(|| {
        format!("Method finder not configured (use --finder or set {METHOD_FINDER_ENV})")
    })
}

pub fn session_config(settings: &Settings) -> SessionConfig {
    let mut config = SessionConfig::default();
    if let Some(prompt) = &settings.prompt {
        config.prompt = prompt.clone();
    }
    if let Some(terminator) = &settings.line_terminator {
        config.line_terminator = terminator.clone();
    }
    config
}

pub fn browser_config(settings: &Settings) -> BrowserConfig {
    let mut config = BrowserConfig::default();
    if let Some(package) = &settings.default_package {
        config.default_package = package.clone();
    }
    config
}

fn first_of<T>(flag: Option<T>, from_env: Option<T>, from_settings: Option<T>) -> Option<T> {
    flag.or(from_env).or(from_settings)
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn magik_session_home() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve config directory"))?;
    Ok(base.join("magik-session"))
}
