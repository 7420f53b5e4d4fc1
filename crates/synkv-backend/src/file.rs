//! Directory-backed storage: one file per key.
//!
//! Layout: `{root}/{namespace}/{escaped key}`, file content is the raw UTF-8
//! payload. Several processes may open the same root; with a poll interval
//! configured, each handle's change feed reports files changed by others.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{BackendError, BackendResult};
use crate::traits::Backend;
use crate::types::{Change, ChangeStream, MediumChange, Namespace, OriginId, RawValue};

/// Configuration for a [`FileBackend`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileBackendConfig {
    /// Directory holding one sub-directory per namespace.
    pub root: PathBuf,
    /// How often to rescan for changes made by other processes. `None`
    /// disables the change feed.
    pub poll_interval: Option<Duration>,
    /// Capacity of the change broadcast channel.
    pub channel_capacity: usize,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".synkv"),
            poll_interval: None,
            channel_capacity: 256,
        }
    }
}

type Fingerprints = Arc<Mutex<HashMap<String, [u8; 32]>>>;
type FeedSlot = Arc<Mutex<Option<broadcast::Sender<MediumChange>>>>;

/// A [`Backend`] storing each key as a file.
pub struct FileBackend {
    dir: PathBuf,
    namespace: Namespace,
    origin: OriginId,
    config: FileBackendConfig,
    /// Last payload fingerprint this handle knows per key, whether it wrote
    /// it or observed it. The poller only reports files that differ.
    known: Fingerprints,
    feed: FeedSlot,
}

impl FileBackend {
    /// Open (creating if needed) the namespace directory under `config.root`.
    pub fn open(namespace: Namespace, config: FileBackendConfig) -> BackendResult<Self> {
        let dir = config.root.join(namespace.as_str());
        fs::create_dir_all(&dir).map_err(map_io)?;
        info!(backend = "file", namespace = %namespace, dir = %dir.display(), "opened");
        Ok(Self {
            dir,
            namespace,
            origin: OriginId::new(),
            config,
            known: Arc::new(Mutex::new(HashMap::new())),
            feed: Arc::new(Mutex::new(None)),
        })
    }

    /// Directory holding this namespace's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> BackendResult<PathBuf> {
        Ok(self.dir.join(encode_key(key)?))
    }

    fn start_poller(&self, interval: Duration) -> io::Result<broadcast::Sender<MediumChange>> {
        let (tx, _) = broadcast::channel(self.config.channel_capacity.max(1));

        // Baseline: files present now are not reported as changes.
        {
            let mut known = self.known.lock().expect("fingerprint lock poisoned");
            for (key, raw) in scan(&self.dir)? {
                known.insert(key, raw.fingerprint());
            }
        }

        let dir = self.dir.clone();
        let known = Arc::clone(&self.known);
        let slot = Arc::clone(&self.feed);
        let sender = tx.clone();
        let origin = OriginId::new();
        let namespace = self.namespace.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;

                if sender.receiver_count() == 0 {
                    let mut slot = slot.lock().expect("feed lock poisoned");
                    if sender.receiver_count() == 0 {
                        *slot = None;
                        debug!(backend = "file", namespace = %namespace, "poller stopped");
                        return;
                    }
                }

                let dir = dir.clone();
                let known = Arc::clone(&known);
                let scanned = tokio::task::spawn_blocking(move || {
                    let mut known = known.lock().expect("fingerprint lock poisoned");
                    scan(&dir).map(|current| diff(&mut known, current))
                })
                .await;

                match scanned {
                    Ok(Ok(changes)) => {
                        for (key, change) in changes {
                            debug!(backend = "file", namespace = %namespace, key = %key, "external change");
                            let _ = sender.send(MediumChange {
                                origin,
                                qualified_key: namespace.qualify(&key),
                                change,
                            });
                        }
                    }
                    Ok(Err(e)) => warn!(backend = "file", error = %e, "scan failed"),
                    Err(e) => warn!(backend = "file", error = %e, "scan task failed"),
                }
            }
        });

        Ok(tx)
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("dir", &self.dir)
            .field("namespace", &self.namespace)
            .field("poll_interval", &self.config.poll_interval)
            .finish()
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn read(&self, key: &str) -> BackendResult<Option<RawValue>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(RawValue::new(text))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(e)),
        }
    }

    async fn write(&self, key: &str, raw: &RawValue) -> BackendResult<()> {
        let path = self.path_for(key)?;
        let dir = self.dir.clone();
        let known = Arc::clone(&self.known);
        let key = key.to_owned();
        let raw = raw.clone();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            // Held across the rename so the poller never sees our own write
            // before its fingerprint is recorded.
            let mut known = known.lock().expect("fingerprint lock poisoned");
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(raw.as_str().as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            known.insert(key, raw.fingerprint());
            Ok(())
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("write task failed: {e}")))?
        .map_err(map_io)
    }

    async fn remove(&self, key: &str) -> BackendResult<bool> {
        let path = self.path_for(key)?;
        let known = Arc::clone(&self.known);
        let key = key.to_owned();

        tokio::task::spawn_blocking(move || -> io::Result<bool> {
            let mut known = known.lock().expect("fingerprint lock poisoned");
            known.remove(&key);
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("remove task failed: {e}")))?
        .map_err(map_io)
    }

    async fn keys(&self) -> BackendResult<Vec<String>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> io::Result<Vec<String>> {
            let mut keys = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if let Some(key) = entry.file_name().to_str().and_then(decode_file_name) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("list task failed: {e}")))?
        .map_err(map_io)
    }

    fn watch(&self) -> Option<ChangeStream> {
        let interval = self.config.poll_interval?;
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(backend = "file", "no async runtime; change feed disabled");
            return None;
        }

        let mut slot = self.feed.lock().expect("feed lock poisoned");
        let sender = match slot.as_ref() {
            Some(sender) => sender.clone(),
            None => match self.start_poller(interval) {
                Ok(sender) => {
                    *slot = Some(sender.clone());
                    sender
                }
                Err(e) => {
                    warn!(backend = "file", error = %e, "cannot start poller");
                    return None;
                }
            },
        };

        Some(ChangeStream::new(
            sender.subscribe(),
            self.namespace.clone(),
            Some(self.origin),
        ))
    }
}

fn map_io(e: io::Error) -> BackendError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => BackendError::PermissionDenied(e.to_string()),
        _ => BackendError::Io(e),
    }
}

/// Read every decodable key file in `dir`.
fn scan(dir: &Path) -> io::Result<HashMap<String, RawValue>> {
    let mut files = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(key) = entry.file_name().to_str().and_then(decode_file_name) else {
            continue;
        };
        match fs::read_to_string(entry.path()) {
            Ok(text) => {
                files.insert(key, RawValue::new(text));
            }
            // Removed between listing and reading; picked up next scan.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!(key = %key, error = %e, "skipping unreadable file"),
        }
    }
    Ok(files)
}

/// Compare a scan against known fingerprints, updating them, and return the
/// changes in key order.
fn diff(
    known: &mut HashMap<String, [u8; 32]>,
    current: HashMap<String, RawValue>,
) -> Vec<(String, Change)> {
    let mut changes = Vec::new();

    let removed: Vec<String> = known
        .keys()
        .filter(|k| !current.contains_key(*k))
        .cloned()
        .collect();
    for key in removed {
        known.remove(&key);
        changes.push((key, Change::Removed));
    }

    for (key, raw) in current {
        let fp = raw.fingerprint();
        if known.get(&key) != Some(&fp) {
            known.insert(key.clone(), fp);
            changes.push((key, Change::Set(raw)));
        }
    }

    changes.sort_by(|(a, _), (b, _)| a.cmp(b));
    changes
}

/// Bytes stored verbatim in file names. Uppercase letters are escaped so keys
/// differing only in case stay distinct on case-insensitive filesystems.
fn is_plain(byte: u8) -> bool {
    byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' || byte == b'_'
}

/// Escape a logical key into a portable file name.
///
/// Lowercase ASCII letters, digits, `-` and `_` pass through; every other
/// byte becomes `%XX`. Escaped names never start with `.`, so temp files are
/// never mistaken for keys.
pub fn encode_key(key: &str) -> BackendResult<String> {
    if key.is_empty() {
        return Err(BackendError::InvalidKey {
            key: key.to_owned(),
            reason: "must not be empty".into(),
        });
    }
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if is_plain(byte) {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    Ok(name)
}

/// Inverse of [`encode_key`]; `None` for names that are not escaped keys.
pub fn decode_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = name.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if is_plain(b) => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    if out.is_empty() {
        return None;
    }
    String::from_utf8(out).ok()
}
