use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub push: PushConfig,
  /// SQLite database path (defaults to $XDG_DATA_HOME/chitcache/worker.db)
  pub database: Option<PathBuf>,
}

/// Everything the lifecycle manager and router need to know about a release.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Origin the application shell is served from (scheme://host[:port])
  pub origin: String,
  pub shell_cache_prefix: String,
  /// Release tag of the shell generation; bump it to roll out a new shell
  pub version: String,
  pub runtime_cache: String,
  /// URLs that must all be fetchable for install to succeed, in order
  pub manifest: Vec<String>,
  pub api_prefix: String,
  pub offline_document: String,
  pub fallback_icon: String,
  pub sync_tag: String,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      shell_cache_prefix: "chitfund-shell".to_string(),
      version: "v1".to_string(),
      runtime_cache: "chitfund-runtime".to_string(),
      manifest: [
        "/",
        "/dashboard",
        "/groups",
        "/members",
        "/payments",
        "/reports",
        "/manifest.json",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      api_prefix: "/api/".to_string(),
      offline_document: "/offline.html".to_string(),
      fallback_icon: "/icons/icon-192x192.png".to_string(),
      sync_tag: "sync-payments".to_string(),
    }
  }
}

impl WorkerConfig {
  /// Name of the shell cache generation for this release.
  pub fn shell_cache(&self) -> String {
    format!("{}-{}", self.shell_cache_prefix, self.version)
  }

  /// Resolve a path (or absolute URL) against the configured origin.
  pub fn resolve(&self, path: &str) -> Result<url::Url> {
    let base = url::Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    base
      .join(path)
      .map_err(|e| eyre!("Failed to resolve '{}' against {}: {}", path, self.origin, e))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub title: String,
  /// Body used when a push message carries no text
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  pub view_icon: String,
  pub dismiss_icon: String,
  /// Page opened when the notification (or its view action) is clicked
  pub open_url: String,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      title: "Chit Fund Manager".to_string(),
      default_body: "You have a new update from your chit group".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-72x72.png".to_string(),
      view_icon: "/icons/checkmark.png".to_string(),
      dismiss_icon: "/icons/xmark.png".to_string(),
      open_url: "/".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./chitcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/chitcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("chitcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("chitcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Database location, explicit or under the user's data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => crate::db::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_when_section_missing() {
    let config = Config::from_yaml("database: /tmp/x.db\n").unwrap();
    assert_eq!(config.worker.shell_cache(), "chitfund-shell-v1");
    assert_eq!(config.worker.runtime_cache, "chitfund-runtime");
    assert_eq!(config.worker.manifest[0], "/");
    assert_eq!(config.database, Some(PathBuf::from("/tmp/x.db")));
  }

  #[test]
  fn test_partial_worker_section() {
    let yaml = "worker:\n  version: v7\n  manifest: ['/', '/manifest.json']\n";
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.worker.shell_cache(), "chitfund-shell-v7");
    assert_eq!(config.worker.manifest, vec!["/", "/manifest.json"]);
    assert_eq!(config.worker.api_prefix, "/api/");
  }

  #[test]
  fn test_resolve_against_origin() {
    let worker = WorkerConfig::default();
    let url = worker.resolve("/api/payments").unwrap();
    assert_eq!(url.as_str(), "http://localhost:3000/api/payments");
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
