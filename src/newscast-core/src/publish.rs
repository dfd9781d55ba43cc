//! Artifact publishing: scratch file, upload, locator, cleanup.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::AssembledTrack;
use crate::config::StorageConfig;
use crate::error::NewscastError;

/// External object storage.
///
/// After a successful `upload` the object must be retrievable at
/// [`locator`]`(scheme, namespace, key)`. Uploads under distinct keys may run
/// concurrently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        local_path: &Path,
        namespace: &str,
        key: &str,
        content_type: &str,
    ) -> Result<(), NewscastError>;
}

/// Stores objects with a plain HTTP `PUT` to `{scheme}://{namespace}/{key}`.
pub struct HttpObjectStore {
    http: reqwest::Client,
    scheme: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self, NewscastError> {
        let token = match &config.token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                NewscastError::ConfigError(format!("Storage token variable {} is not set", var))
            })?),
            None => None,
        };

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                NewscastError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            scheme: config.scheme.clone(),
            token,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(
        &self,
        local_path: &Path,
        namespace: &str,
        key: &str,
        content_type: &str,
    ) -> Result<(), NewscastError> {
        let body = tokio::fs::read(local_path).await?;
        let url = locator(&self.scheme, namespace, key);

        let mut request = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| NewscastError::PublishFailed(format!("upload to {} failed: {}", url, e)))?;
        Ok(())
    }
}

/// A durably stored track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub locator: String,
    pub content_type: String,
}

/// Build the public locator for an object.
pub fn locator(scheme: &str, namespace: &str, key: &str) -> String {
    format!(
        "{}://{}/{}",
        scheme,
        namespace.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

/// Persists assembled tracks to object storage.
pub struct ArtifactPublisher {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    scheme: String,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            namespace: config.namespace.clone(),
            scheme: config.scheme.clone(),
            scratch_dir: config.scratch_dir(),
            timeout: config.timeout(),
        }
    }

    /// Upload `track` under `{run_id}/{name}` and return its reference.
    ///
    /// `name` is reduced to one safe path segment first: characters other
    /// than alphanumerics, `-`, `_` and `.` become `_`, leading dots are
    /// dropped and `.mp3` is appended when missing. The locator ends in that
    /// sanitized name, so `"ep 1"` is published as `.../ep_1.mp3`.
    ///
    /// The scratch copy is removed on every exit path, including when this
    /// future is dropped mid-upload.
    pub async fn publish(
        &self,
        track: &AssembledTrack,
        name: &str,
        run_id: Uuid,
    ) -> Result<ArtifactReference, NewscastError> {
        if self.namespace.trim().is_empty() {
            return Err(NewscastError::ConfigError(
                "storage.namespace is not set".to_string(),
            ));
        }
        let name = sanitize_name(name)?;
        let key = format!("{}/{}", run_id, name);

        let scratch_failed = |e: std::io::Error| {
            NewscastError::PublishFailed(format!(
                "cannot write scratch file in {}: {}",
                self.scratch_dir.display(),
                e
            ))
        };
        let mut scratch = tempfile::Builder::new()
            .prefix("newscast-")
            .suffix(".mp3")
            .tempfile_in(&self.scratch_dir)
            .map_err(scratch_failed)?;
        scratch.write_all(track.bytes()).map_err(scratch_failed)?;
        scratch.flush().map_err(scratch_failed)?;
        debug!("Scratch file {}", scratch.path().display());

        let upload = tokio::time::timeout(
            self.timeout,
            self.store
                .upload(scratch.path(), &self.namespace, &key, track.content_type()),
        )
        .await;

        if let Err(e) = scratch.close() {
            warn!("Failed to remove scratch file: {}", e);
        }

        match upload {
            Ok(Ok(())) => {}
            Ok(Err(NewscastError::PublishFailed(message))) => {
                return Err(NewscastError::PublishFailed(message));
            }
            Ok(Err(e)) => return Err(NewscastError::PublishFailed(e.to_string())),
            Err(_) => {
                return Err(NewscastError::PublishFailed(format!(
                    "upload did not finish within {}s",
                    self.timeout.as_secs()
                )));
            }
        }

        let reference = ArtifactReference {
            locator: locator(&self.scheme, &self.namespace, &key),
            content_type: track.content_type().to_string(),
        };
        info!("Published {}", reference.locator);
        Ok(reference)
    }
}

/// Write a track straight to a caller-chosen file (on-demand download mode).
///
/// The bytes land in a sibling temp file first and are renamed into place, so
/// a failed write never leaves a truncated file at `path`.
pub fn save_track(track: &AssembledTrack, path: &Path) -> Result<PathBuf, NewscastError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut scratch = tempfile::Builder::new()
        .prefix(".newscast-")
        .tempfile_in(&dir)?;
    scratch.write_all(track.bytes())?;
    scratch.flush()?;
    scratch
        .persist(path)
        .map_err(|e| NewscastError::Io(e.error))?;

    info!("Saved {}", path.display());
    Ok(path.to_path_buf())
}

/// Default artifact name for a given day.
pub fn daily_name(date: NaiveDate) -> String {
    format!("newscast-{}.mp3", date.format("%Y-%m-%d"))
}

/// Reduce a caller-supplied name to a single safe path segment ending in `.mp3`.
fn sanitize_name(name: &str) -> Result<String, NewscastError> {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');

    if sanitized.is_empty() {
        return Err(NewscastError::ConfigError(
            "Artifact name cannot be empty".to_string(),
        ));
    }
    if sanitized.to_ascii_lowercase().ends_with(".mp3") {
        Ok(sanitized.to_string())
    } else {
        Ok(format!("{}.mp3", sanitized))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::AudioAssembler;
    use crate::audio::AudioFragment;
    use crate::audio::tests::wav_bytes;
    use crate::config::AudioConfig;
    use crate::script::SpeakerId;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Keeps uploads in memory, keyed by locator.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
        pub(crate) seen_paths: Mutex<Vec<PathBuf>>,
    }

    impl MemoryStore {
        pub(crate) fn fetch(&self, locator: &str) -> Option<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(locator)
                .map(|(bytes, _)| bytes.clone())
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn upload(
            &self,
            local_path: &Path,
            namespace: &str,
            key: &str,
            content_type: &str,
        ) -> Result<(), NewscastError> {
            let bytes = std::fs::read(local_path)?;
            self.seen_paths.lock().unwrap().push(local_path.to_path_buf());
            self.objects.lock().unwrap().insert(
                locator("https", namespace, key),
                (bytes, content_type.to_string()),
            );
            Ok(())
        }
    }

    struct FailingStore {
        seen_path: Mutex<Option<PathBuf>>,
    }

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn upload(
            &self,
            local_path: &Path,
            _namespace: &str,
            _key: &str,
            _content_type: &str,
        ) -> Result<(), NewscastError> {
            assert!(local_path.exists());
            *self.seen_path.lock().unwrap() = Some(local_path.to_path_buf());
            Err(NewscastError::PublishFailed("HTTP 403".to_string()))
        }
    }

    /// Never finishes an upload.
    struct HangingStore;

    #[async_trait]
    impl ObjectStore for HangingStore {
        async fn upload(
            &self,
            _local_path: &Path,
            _namespace: &str,
            _key: &str,
            _content_type: &str,
        ) -> Result<(), NewscastError> {
            std::future::pending().await
        }
    }

    fn track() -> AssembledTrack {
        AudioAssembler::new(&AudioConfig::default())
            .unwrap()
            .assemble(vec![AudioFragment::new(
                0,
                SpeakerId::AgentA,
                wav_bytes(2_400, 24_000, 4_000),
            )])
            .unwrap()
    }

    fn storage(scratch: &Path) -> StorageConfig {
        StorageConfig {
            namespace: "casts.example.com".to_string(),
            scratch_dir: Some(scratch.to_path_buf()),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_publish_round_trip() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let publisher = ArtifactPublisher::new(store.clone(), &storage(scratch.path()));
        let track = track();
        let run_id = Uuid::new_v4();

        let reference = publisher
            .publish(&track, "daily.mp3", run_id)
            .await
            .unwrap();

        assert_eq!(
            reference.locator,
            format!("https://casts.example.com/{}/daily.mp3", run_id)
        );
        assert!(reference.locator.ends_with("daily.mp3"));
        assert_eq!(reference.content_type, "audio/mpeg");
        assert_eq!(store.fetch(&reference.locator).unwrap(), track.bytes());

        // scratch copy is gone
        let seen = store.seen_paths.lock().unwrap()[0].clone();
        assert!(!seen.exists());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_upload_still_removes_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(FailingStore {
            seen_path: Mutex::new(None),
        });
        let publisher = ArtifactPublisher::new(store.clone(), &storage(scratch.path()));

        let err = publisher
            .publish(&track(), "daily", Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, NewscastError::PublishFailed(_)));
        let seen = store.seen_path.lock().unwrap().clone().unwrap();
        assert!(!seen.exists());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_timeout_is_publish_failed() {
        let scratch = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            timeout_secs: 1,
            ..storage(scratch.path())
        };
        let publisher = ArtifactPublisher::new(Arc::new(HangingStore), &config);

        let err = publisher
            .publish(&track(), "slow.mp3", Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, NewscastError::PublishFailed(ref m) if m.contains("1s")));
        assert_eq!(err.class(), crate::error::FailureClass::RetryLater);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_scratch_dir_is_publish_failed() {
        let scratch = tempfile::tempdir().unwrap();
        let missing = scratch.path().join("does-not-exist");
        let store = Arc::new(MemoryStore::default());
        let publisher = ArtifactPublisher::new(store.clone(), &storage(&missing));

        let err = publisher
            .publish(&track(), "daily.mp3", Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, NewscastError::PublishFailed(_)));
        assert!(store.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locator_ends_in_sanitized_name() {
        let scratch = tempfile::tempdir().unwrap();
        let publisher =
            ArtifactPublisher::new(Arc::new(MemoryStore::default()), &storage(scratch.path()));

        let reference = publisher
            .publish(&track(), "ep 1", Uuid::new_v4())
            .await
            .unwrap();
        assert!(reference.locator.ends_with("/ep_1.mp3"), "{}", reference.locator);
    }

    #[tokio::test]
    async fn test_missing_namespace_is_config_error() {
        let scratch = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            namespace: String::new(),
            ..storage(scratch.path())
        };
        let publisher = ArtifactPublisher::new(Arc::new(MemoryStore::default()), &config);
        let err = publisher
            .publish(&track(), "daily.mp3", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, NewscastError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_concurrent_runs_get_distinct_keys() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let publisher = ArtifactPublisher::new(store.clone(), &storage(scratch.path()));
        let track = track();

        let (a, b) = tokio::join!(
            publisher.publish(&track, "daily.mp3", Uuid::new_v4()),
            publisher.publish(&track, "daily.mp3", Uuid::new_v4()),
        );
        assert_ne!(a.unwrap().locator, b.unwrap().locator);
        assert_eq!(store.objects.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_save_track_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episode.mp3");
        let track = track();

        save_track(&track, &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), track.bytes());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("daily").unwrap(), "daily.mp3");
        assert_eq!(sanitize_name("a/b c.mp3").unwrap(), "a_b_c.mp3");
        assert_eq!(sanitize_name("../etc").unwrap(), "_etc.mp3");
        assert!(sanitize_name("  ").is_err());
    }

    #[test]
    fn test_daily_name() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert_eq!(daily_name(date), "newscast-2026-10-16.mp3");
    }

    #[test]
    fn test_locator_format() {
        assert_eq!(
            locator("https", "bucket.example.com/", "/run/x.mp3"),
            "https://bucket.example.com/run/x.mp3"
        );
    }
}
