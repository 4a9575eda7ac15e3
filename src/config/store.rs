use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::NegotiationConfig;
use crate::error::{NegotiationError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, sessions load the current
/// configuration once when they are spawned.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<NegotiationConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store, writing defaults when the file does not exist yet
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = Self::load_config(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            change_tx,
        })
    }

    async fn load_config(path: &Path) -> Result<NegotiationConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                debug!("Loaded configuration from {}", path.display());
                serde_json::from_str(&json).map_err(|e| NegotiationError::Config(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, writing defaults", path.display());
                let config = NegotiationConfig::default();
                Self::save_config_to_file(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_config_to_file(path: &Path, config: &NegotiationConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<NegotiationConfig> {
        self.cache.load_full()
    }

    /// Replace the entire configuration
    pub async fn set(&self, config: NegotiationConfig) -> Result<()> {
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "negotiation".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write, the last concurrent writer wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut NegotiationConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionErrorPolicy;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kiosk-link.json");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(*store.get(), NegotiationConfig::default());

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.session_key = "KIOSK-42".to_string();
                c.session_error_policy = SessionErrorPolicy::Fatal;
            })
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "negotiation");

        let config = store.get();
        assert_eq!(config.session_key, "KIOSK-42");

        // Persistence across instances
        let store2 = ConfigStore::new(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.session_key, "KIOSK-42");
        assert_eq!(config.session_error_policy, SessionErrorPolicy::Fatal);
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = ConfigStore::new(&path).await;
        assert!(matches!(result, Err(NegotiationError::Config(_))));
    }
}
