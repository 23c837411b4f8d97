use crate::data::Platform;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub resonite: ResoniteConfig,
    #[serde(default)]
    pub vrchat: VRChatConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Platforms enabled in this config
    pub fn enabled_platforms(&self) -> Vec<Platform> {
        let mut platforms = Vec::new();
        if self.resonite.enabled {
            platforms.push(Platform::Resonite);
        }
        if self.vrchat.enabled {
            platforms.push(Platform::VRChat);
        }
        platforms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResoniteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_resonite_api")]
    pub api_url: String,
    #[serde(default = "default_resonite_hub")]
    pub hub_url: String,
    #[serde(default = "default_resonite_assets")]
    pub assets_url: String,
}

fn default_resonite_api() -> String {
    "https://api.resonite.com".to_string()
}

fn default_resonite_hub() -> String {
    "wss://api.resonite.com/hub".to_string()
}

fn default_resonite_assets() -> String {
    "https://assets.resonite.com".to_string()
}

impl Default for ResoniteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: None,
            token: None,
            api_url: default_resonite_api(),
            hub_url: default_resonite_hub(),
            assets_url: default_resonite_assets(),
        }
    }
}

impl ResoniteConfig {
    /// `(user_id, token)` if both are set
    pub fn credentials(&self) -> Result<(&str, &str)> {
        let user_id = non_empty(&self.user_id).context("resonite.user_id is not set")?;
        let token = non_empty(&self.token).context("resonite.token is not set")?;
        Ok((user_id, token))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VRChatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_vrchat_api")]
    pub api_url: String,
    #[serde(default = "default_vrchat_pipeline")]
    pub pipeline_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_vrchat_api() -> String {
    "https://api.vrchat.cloud/api/1".to_string()
}

fn default_vrchat_pipeline() -> String {
    "wss://pipeline.vrchat.cloud".to_string()
}

fn default_user_agent() -> String {
    format!("omniroster/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for VRChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auth_token: None,
            api_url: default_vrchat_api(),
            pipeline_url: default_vrchat_pipeline(),
            user_agent: default_user_agent(),
        }
    }
}

impl VRChatConfig {
    pub fn auth_token(&self) -> Result<&str> {
        non_empty(&self.auth_token).context("vrchat.auth_token is not set")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_rest_attempts")]
    pub rest_max_attempts: u32,
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_rest_attempts() -> u32 {
    5
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            rest_max_attempts: default_rest_attempts(),
        }
    }
}

impl MonitoringConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl CacheConfig {
    /// Resolved snapshot path for one platform's metadata cache
    pub fn snapshot_path(&self, platform: Platform) -> Result<PathBuf> {
        let dir = match &self.path {
            Some(dir) => dir.clone(),
            None => cache_dir()?,
        };
        Ok(dir.join(format!("{}-metadata.json", platform.label().to_lowercase())))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "omniroster").context("Could not determine config directory")
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn cache_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.cache_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    if !path.exists() {
        anyhow::bail!(
            "Config file not found at {}. Run `omniroster --init` to create one.",
            path.display()
        );
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    parse(&content).with_context(|| format!("Failed to parse config from {}", path.display()))
}

pub fn parse(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    Ok(config)
}

fn prompt(label: &str) -> Result<String> {
    use std::io::{self, Write};

    print!("{label}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn optional(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

pub async fn init_wizard() -> Result<()> {
    println!("Omniroster Configuration Wizard");
    println!("===============================\n");

    let config_path = default_config_path()?;
    if config_path.exists() {
        let answer = prompt(&format!(
            "Config already exists at {}. Overwrite? [y/N] ",
            config_path.display()
        ))?;
        if !answer.eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    println!("Leave a field empty to skip that platform.\n");

    let resonite_user = optional(prompt("Resonite user id (U-...): ")?);
    let resonite_token = match resonite_user {
        Some(_) => optional(prompt("Resonite session token: ")?),
        None => None,
    };
    let vrchat_token = optional(prompt("VRChat auth cookie value (authcookie_...): ")?);

    let config = Config {
        resonite: ResoniteConfig {
            enabled: resonite_user.is_some() && resonite_token.is_some(),
            user_id: resonite_user,
            token: resonite_token,
            ..ResoniteConfig::default()
        },
        vrchat: VRChatConfig {
            enabled: vrchat_token.is_some(),
            auth_token: vrchat_token,
            ..VRChatConfig::default()
        },
        monitoring: MonitoringConfig::default(),
        cache: CacheConfig::default(),
    };

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Tokens are secrets: write with restricted permissions
    let content = toml::to_string_pretty(&config)?;
    std::fs::write(&config_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("\nConfig saved to {}", config_path.display());
    println!("Run `omniroster` to start monitoring.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert!(config.enabled_platforms().is_empty());
        assert_eq!(config.monitoring.refresh_interval_secs, 60);
        assert_eq!(config.monitoring.rest_max_attempts, 5);
        assert!(config.cache.enabled);
        assert_eq!(config.resonite.api_url, "https://api.resonite.com");
    }

    #[test]
    fn parses_platform_sections() {
        let config = parse(
            r#"
            [resonite]
            enabled = true
            user_id = "U-me"
            token = "secret"

            [vrchat]
            enabled = true
            auth_token = "authcookie_x"
            user_agent = "tester/1.0"

            [monitoring]
            refresh_interval_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(
            config.enabled_platforms(),
            vec![Platform::Resonite, Platform::VRChat]
        );
        assert_eq!(config.resonite.credentials().unwrap(), ("U-me", "secret"));
        assert_eq!(config.vrchat.auth_token().unwrap(), "authcookie_x");
        assert_eq!(config.vrchat.user_agent, "tester/1.0");
        assert_eq!(config.monitoring.refresh_interval(), Duration::from_secs(30));
    }

    #[test]
    fn blank_credentials_are_rejected() {
        let config = parse("[resonite]\nuser_id = \"  \"\ntoken = \"t\"\n").unwrap();
        assert!(config.resonite.credentials().is_err());
        assert!(config.vrchat.auth_token().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("--init"));
    }

    #[test]
    fn snapshot_path_is_per_platform() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheConfig {
            enabled: true,
            path: Some(dir.path().to_path_buf()),
        };
        assert_eq!(
            cache.snapshot_path(Platform::VRChat).unwrap(),
            dir.path().join("vrchat-metadata.json")
        );
    }
}
