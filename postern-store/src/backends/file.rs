use std::{
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use postern_common::internal;
use tokio::{fs, sync::Mutex};

use crate::{
    MessageId, MessageStatus, NewMessage, QueuedMessage, SerializationError, StoreError,
    Transition, ValidationError, r#trait::MessageStore,
};

const SENSITIVE_PREFIXES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// File-backed message store
///
/// Each message is kept as two files in the store directory:
/// - `{id}.eml` holds the raw message content, written once at enqueue
/// - `{id}.bin` holds the bincode-encoded record, rewritten on every transition
///
/// # Atomicity
/// Every file is written to a `.tmp_` sibling and renamed into place, so a
/// crash never leaves a half-written record behind. Deletes rename both
/// files to a `.deleted` suffix before removing them; leftovers are cleaned
/// up by [`FileMessageStore::init`].
///
/// All mutations are serialised by a store-wide write lock. The records are
/// mirrored in memory after `init`, so reads never touch the disk.
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    path: PathBuf,
    index: Arc<DashMap<MessageId, QueuedMessage>>,
    next_id: Arc<AtomicU64>,
    write_lock: Arc<Mutex<()>>,
}

impl Default for FileMessageStore {
    fn default() -> Self {
        Self::with_path(PathBuf::from("/var/spool/postern"))
    }
}

impl FileMessageStore {
    fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            index: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Reject relative paths, `..` components and system directories
    ///
    /// # Errors
    /// Returns the first rule the path breaks
    pub fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentDir(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        if let Some(prefix) = SENSITIVE_PREFIXES.iter().find(|p| path.starts_with(p)) {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileMessageStoreBuilder {
        FileMessageStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepare the store directory and load every record from it
    ///
    /// Creates the directory if needed, removes `.deleted` and `.tmp_`
    /// leftovers and content files without a record, then rebuilds the
    /// in-memory index. The id counter resumes after the highest stored id.
    ///
    /// # Errors
    /// - If the directory cannot be created or read
    /// - If the path exists but is not a directory
    /// - If a record cannot be decoded
    pub async fn init(&self) -> crate::Result<()> {
        internal!("Initialising message store at {} ...", self.path.display());

        if !fs::try_exists(&self.path).await? {
            internal!("{} does not exist, creating...", self.path.display());
            fs::create_dir_all(&self.path).await?;
        } else if !fs::metadata(&self.path).await?.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        let _guard = self.write_lock.lock().await;
        self.index.clear();

        let mut records = Vec::new();
        let mut contents = Vec::new();
        let mut cleaned = 0;

        let mut entries = fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.ends_with(".deleted") || filename.starts_with(".tmp_") {
                fs::remove_file(entry.path()).await?;
                cleaned += 1;
                continue;
            }

            match MessageId::from_filename(&filename) {
                Some(id) if filename.ends_with(".bin") => records.push(id),
                Some(id) => contents.push(id),
                None => {}
            }
        }

        for id in records {
            let mut message = self.read_record(id).await?;
            message.data = Arc::from(fs::read(self.data_path(id)).await?);
            self.index.insert(id, message);
        }

        for id in contents {
            if !self.index.contains_key(&id) {
                fs::remove_file(self.data_path(id)).await?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from message store"
            );
        }

        let next = self.index.iter().map(|e| e.key().get()).max().unwrap_or(0) + 1;
        self.next_id.store(next, Ordering::SeqCst);

        internal!(
            level = INFO,
            "Loaded {} messages from {}",
            self.index.len(),
            self.path.display()
        );

        Ok(())
    }

    fn meta_path(&self, id: MessageId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    fn data_path(&self, id: MessageId) -> PathBuf {
        self.path.join(format!("{id}.eml"))
    }

    async fn read_record(&self, id: MessageId) -> crate::Result<QueuedMessage> {
        let path = self.meta_path(id);
        let bytes = fs::read(&path).await?;
        let (message, _): (QueuedMessage, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map_err(SerializationError::from)?;

        if message.id != id {
            return Err(SerializationError::Corrupted {
                file: path.display().to_string(),
                reason: format!("record holds id {}", message.id),
            }
            .into());
        }

        Ok(message)
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> crate::Result<()> {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self.path.join(format!(".tmp_{filename}"));

        fs::write(&temp, bytes).await?;
        fs::rename(&temp, path).await?;
        Ok(())
    }

    async fn write_record(&self, message: &QueuedMessage) -> crate::Result<()> {
        let bytes = bincode::serde::encode_to_vec(message, bincode::config::legacy())
            .map_err(SerializationError::from)?;
        self.write_atomic(&self.meta_path(message.id), &bytes).await
    }

    async fn remove_files(&self, id: MessageId) -> crate::Result<()> {
        let meta = self.meta_path(id);
        let data = self.data_path(id);
        let deleted_meta = self.path.join(format!("{id}.bin.deleted"));
        let deleted_data = self.path.join(format!("{id}.eml.deleted"));

        fs::rename(&meta, &deleted_meta).await?;
        fs::rename(&data, &deleted_data).await?;

        fs::remove_file(&deleted_meta).await?;
        fs::remove_file(&deleted_data).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn enqueue(&self, message: NewMessage) -> crate::Result<QueuedMessage> {
        let _guard = self.write_lock.lock().await;

        let id = MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let queued = message.into_queued(id);

        self.write_atomic(&self.data_path(id), &queued.data).await?;
        self.write_record(&queued).await?;
        self.index.insert(id, queued.clone());

        internal!(level = DEBUG, "Stored message {id} at {}", self.path.display());

        Ok(queued)
    }

    async fn get(&self, id: MessageId) -> crate::Result<QueuedMessage> {
        self.index
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_all(&self) -> crate::Result<Vec<QueuedMessage>> {
        let mut messages: Vec<_> = self.index.iter().map(|e| e.value().clone()).collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %id))]
    async fn transition(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
        transition: Transition,
    ) -> crate::Result<QueuedMessage> {
        let _guard = self.write_lock.lock().await;

        let mut message = self.get(id).await?;
        if !expected.contains(&message.status) {
            return Err(StoreError::StatusMismatch {
                id,
                actual: message.status,
            });
        }

        transition.apply(&mut message);
        self.write_record(&message).await?;
        self.index.insert(id, message.clone());

        Ok(message)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %id))]
    async fn delete_if(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
    ) -> crate::Result<QueuedMessage> {
        let _guard = self.write_lock.lock().await;

        let message = self.get(id).await?;
        if !expected.contains(&message.status) {
            return Err(StoreError::StatusMismatch {
                id,
                actual: message.status,
            });
        }

        self.remove_files(id).await?;
        self.index.remove(&id);

        internal!(level = DEBUG, "Deleted message {id} from store");

        Ok(message)
    }
}

#[derive(Debug, Default)]
pub struct FileMessageStoreBuilder {
    path: PathBuf,
}

impl FileMessageStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn build(self) -> Result<FileMessageStore, ValidationError> {
        FileMessageStore::validate_path(&self.path)?;
        Ok(FileMessageStore::with_path(self.path))
    }
}
