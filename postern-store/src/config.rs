use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{FileMessageStore, MemoryMessageStore, MessageStore};

/// Configuration for the message store
///
/// File-backed store in RON config:
/// ```ron
/// Postern (
///     store: File(path: "/var/spool/postern"),
/// )
/// ```
///
/// Memory-backed store, optionally capped:
/// ```ron
/// Postern (
///     store: Memory(capacity: Some(1000)),
/// )
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub enum StoreConfig {
    File {
        path: PathBuf,
    },
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("/var/spool/postern"),
        }
    }
}

impl StoreConfig {
    /// The store directory for file-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File { path } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Build and initialise the configured store
    ///
    /// File-backed stores validate their path and load any records left by a
    /// previous run before they are returned.
    ///
    /// # Errors
    /// Returns an error if the path is rejected or the directory cannot be loaded
    pub async fn open(self) -> crate::Result<Arc<dyn MessageStore>> {
        match self {
            Self::File { path } => {
                let store = FileMessageStore::builder().path(path).build()?;
                store.init().await?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity: None } => Ok(Arc::new(MemoryMessageStore::new())),
            Self::Memory {
                capacity: Some(capacity),
            } => Ok(Arc::new(MemoryMessageStore::with_capacity(capacity))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_file_config() {
        let config: StoreConfig = ron::from_str(r#"File(path: "/var/spool/postern")"#).unwrap();
        assert_eq!(
            config.path(),
            Some(std::path::Path::new("/var/spool/postern"))
        );
    }

    #[test]
    fn test_parse_memory_config() {
        let config: StoreConfig = ron::from_str("Memory(capacity: Some(10))").unwrap();
        assert_eq!(config, StoreConfig::Memory { capacity: Some(10) });
        assert_eq!(config.path(), None);
    }

    #[tokio::test]
    async fn test_open_rejects_relative_path() {
        let config = StoreConfig::File {
            path: PathBuf::from("relative/spool"),
        };
        let err = config.open().await.unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }
}
