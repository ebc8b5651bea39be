//! Persistent per-peer key storage.
//!
//! This module provides a thread-safe store for the resumption keys of
//! enrolled companion devices. Each peer has at most one current key; a
//! successful handshake replaces it with the freshly derived next key. The
//! store persists to JSON at `~/.config/proxlock/peer_keys.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use protocol::PeerId;
use serde::{Deserialize, Serialize};

/// The stored state for one enrolled peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerKeyRecord {
    /// The current resumption key.
    #[serde(with = "key_serde")]
    pub key: Vec<u8>,
    /// The local user this peer is allowed to unlock.
    pub user_handle: i32,
}

/// Read/write access to enrolled peers' resumption keys.
pub trait PeerKeyStore: Send + Sync {
    /// Looks up the record for a peer. `None` means the peer is unknown.
    fn record(&self, peer: &PeerId) -> Option<PeerKeyRecord>;

    /// Durably replaces the peer's resumption key, preserving its
    /// `user_handle`.
    ///
    /// Fails if the peer has no existing record; keys are only ever rotated
    /// for enrolled peers.
    fn save_key(&self, peer: &PeerId, key: &[u8]) -> Result<()>;

    /// Removes the peer's record entirely. Removing an unknown peer is not
    /// an error.
    fn clear(&self, peer: &PeerId) -> Result<()>;
}

/// Serde support for key material (serializes as base64).
mod key_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use base64::Engine;
        let encoded: String = Deserialize::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// One peer entry in the serialized store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPeer {
    peer_id: PeerId,
    #[serde(flatten)]
    record: PeerKeyRecord,
}

/// Wrapper for serializing the key store.
#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreData {
    /// Version of the store format (for future migrations).
    version: u32,
    /// The enrolled peers.
    peers: Vec<StoredPeer>,
}

impl Default for KeyStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            peers: Vec::new(),
        }
    }
}

/// File-backed [`PeerKeyStore`].
///
/// Uses a `RwLock<HashMap>` for concurrent access and persists every
/// mutation to JSON so keys survive restarts. Writes are atomic (temp file
/// plus rename) to prevent corruption.
pub struct FileKeyStore {
    /// The path to the JSON file.
    path: PathBuf,
    /// The enrolled peers, keyed by peer ID.
    peers: RwLock<HashMap<PeerId, PeerKeyRecord>>,
}

impl FileKeyStore {
    /// Creates a key store that will persist to the given path.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a key store at the default path,
    /// `~/.config/proxlock/peer_keys.json`.
    pub fn with_default_path() -> Self {
        Self::new(default_key_store_path())
    }

    /// Returns the path to the key store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the key store from the JSON file.
    ///
    /// If the file does not exist, the store starts empty. If the file
    /// exists but is invalid, returns an error.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("Key store file not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read key store: {}", self.path.display()))?;

        let data: KeyStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse key store: {}", self.path.display()))?;

        let mut peers = self
            .peers
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on key store"))?;

        peers.clear();
        for peer in data.peers {
            peers.insert(peer.peer_id, peer.record);
        }

        tracing::info!("Loaded {} enrolled peers from {:?}", peers.len(), self.path);
        Ok(())
    }

    /// Enrolls a peer with its initial key and user handle.
    ///
    /// If the peer already exists, it will be replaced. Persists
    /// immediately.
    pub fn enroll(&self, peer: PeerId, key: &[u8], user_handle: i32) -> Result<()> {
        {
            let mut peers = self
                .peers
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on key store"))?;

            tracing::info!("Enrolling peer {} for user {}", peer, user_handle);
            peers.insert(
                peer,
                PeerKeyRecord {
                    key: key.to_vec(),
                    user_handle,
                },
            );
        }
        self.save()
    }

    /// Saves the key store to the JSON file.
    ///
    /// Uses atomic write (write to temp file, then rename) to prevent
    /// corruption. Creates parent directories if they don't exist.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create key store directory: {}", parent.display())
            })?;
        }

        let peers = self
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on key store"))?;

        let data = KeyStoreData {
            version: 1,
            peers: peers
                .iter()
                .map(|(peer_id, record)| StoredPeer {
                    peer_id: *peer_id,
                    record: record.clone(),
                })
                .collect(),
        };

        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize key store")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)
            .with_context(|| format!("Failed to write temp key store: {}", temp_path.display()))?;

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp key store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved {} enrolled peers to {:?}", peers.len(), self.path);
        Ok(())
    }
}

impl PeerKeyStore for FileKeyStore {
    fn record(&self, peer: &PeerId) -> Option<PeerKeyRecord> {
        self.peers.read().ok()?.get(peer).cloned()
    }

    fn save_key(&self, peer: &PeerId, key: &[u8]) -> Result<()> {
        {
            let mut peers = self
                .peers
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on key store"))?;

            let record = peers
                .get_mut(peer)
                .with_context(|| format!("Cannot rotate key for unknown peer {peer}"))?;
            record.key = key.to_vec();
        }
        self.save()
    }

    fn clear(&self, peer: &PeerId) -> Result<()> {
        let removed = {
            let mut peers = self
                .peers
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on key store"))?;
            peers.remove(peer).is_some()
        };

        if removed {
            tracing::info!("Cleared key for peer {}", peer);
            self.save()?;
        }
        Ok(())
    }
}

/// Returns the default key store path, `~/.config/proxlock/peer_keys.json`.
pub fn default_key_store_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("proxlock")
        .join("peer_keys.json")
}
