//! Global server configuration.
//!
//! roost-dev keeps its state in a single config directory (default
//! `~/.config/roost-dev`). `config.json` holds server-wide settings,
//! `config-theme.json` the dashboard theme, and every other file in the
//! directory describes one app (see [`crate::apps`]).

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

const GLOBAL_CONFIG_NAME: &str = "config.json";
const THEME_CONFIG_NAME: &str = "config-theme.json";

/// Server-wide settings loaded from `config.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory the config was loaded from. Not part of the JSON.
    #[serde(skip)]
    pub dir: PathBuf,

    /// Top-level domain apps are served under (default: `test`).
    #[serde(default = "default_tld")]
    pub tld: String,

    /// Port the HTTP front door binds on `127.0.0.1` (default: 80).
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Optional local-LLM log analysis settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama: Option<OllamaConfig>,

    /// Command used by `/api/open-terminal` to launch an agent in the app
    /// directory (default: `claude`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_command: Option<String>,
}

/// Settings for log analysis through a local Ollama server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OllamaConfig {
    pub enabled: bool,
    /// e.g. `http://localhost:11434`
    #[serde(default)]
    pub url: String,
    /// e.g. `llama3.2`
    #[serde(default)]
    pub model: String,
}

fn default_tld() -> String {
    "test".to_string()
}

fn default_http_port() -> u16 {
    80
}

impl Config {
    /// Load `config.json` from `dir`. A missing file yields defaults; a file
    /// that exists but does not parse is a fatal configuration error.
    pub fn load(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let path = dir.join(GLOBAL_CONFIG_NAME);
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str::<Config>(&data)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        cfg.dir = dir;
        Ok(cfg)
    }

    /// The default config directory: `$HOME/.config/roost-dev`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("roost-dev")
    }

    /// Hostname reserved for the dashboard and control API.
    pub fn control_host(&self) -> String {
        format!("roost-dev.{}", self.tld)
    }

    pub fn claude_command(&self) -> &str {
        self.claude_command.as_deref().unwrap_or("claude")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            tld: default_tld(),
            http_port: default_http_port(),
            ollama: None,
            claude_command: None,
        }
    }
}

/// Read the dashboard theme from `config-theme.json`.
///
/// Anything missing or malformed falls back to `system`.
pub fn read_theme(dir: &Path) -> String {
    #[derive(Deserialize)]
    struct ThemeFile {
        theme: String,
    }

    let Ok(data) = std::fs::read_to_string(dir.join(THEME_CONFIG_NAME)) else {
        return "system".to_string();
    };
    match serde_json::from_str::<ThemeFile>(&data) {
        Ok(t) if matches!(t.theme.as_str(), "light" | "dark" | "system") => t.theme,
        _ => "system".to_string(),
    }
}

/// Persist the dashboard theme. Rejects unknown values.
pub fn write_theme(dir: &Path, theme: &str) -> anyhow::Result<()> {
    if !matches!(theme, "light" | "dark" | "system") {
        anyhow::bail!("invalid theme: {theme}");
    }
    let data = serde_json::to_string(&serde_json::json!({ "theme": theme }))?;
    std::fs::write(dir.join(THEME_CONFIG_NAME), data)
        .with_context(|| format!("writing {}", dir.join(THEME_CONFIG_NAME).display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path()).unwrap();

        assert_eq!(cfg.tld, "test");
        assert_eq!(cfg.http_port, 80);
        assert!(cfg.ollama.is_none());
        assert_eq!(cfg.claude_command(), "claude");
        assert_eq!(cfg.control_host(), "roost-dev.test");
    }

    #[test]
    fn loads_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(GLOBAL_CONFIG_NAME),
            r#"{"tld": "local", "http_port": 8080, "claude_command": "claude-custom"}"#,
        )
        .unwrap();

        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.tld, "local");
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.claude_command(), "claude-custom");
        assert_eq!(cfg.control_host(), "roost-dev.local");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(GLOBAL_CONFIG_NAME), "{invalid").unwrap();

        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn ollama_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(GLOBAL_CONFIG_NAME),
            r#"{"tld": "test", "ollama": {"enabled": true, "url": "http://localhost:11434", "model": "llama3.2"}}"#,
        )
        .unwrap();

        let cfg = Config::load(dir.path()).unwrap();
        let ollama = cfg.ollama.expect("ollama config present");
        assert!(ollama.enabled);
        assert_eq!(ollama.model, "llama3.2");
    }

    #[test]
    fn theme_defaults_to_system() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_theme(dir.path()), "system");

        std::fs::write(dir.path().join(THEME_CONFIG_NAME), r#"{"theme":"neon"}"#).unwrap();
        assert_eq!(read_theme(dir.path()), "system");
    }

    #[test]
    fn theme_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_theme(dir.path(), "dark").unwrap();
        assert_eq!(read_theme(dir.path()), "dark");

        assert!(write_theme(dir.path(), "neon").is_err());
    }
}
