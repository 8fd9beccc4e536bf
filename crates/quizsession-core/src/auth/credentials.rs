use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Keychain service name
const SERVICE_NAME: &str = "quizsession";

/// Keychain account holding the token pair
const SESSION_ACCOUNT: &str = "session";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Access and refresh token, always saved and cleared together.
///
/// Serialized with the wire names (`token`, `refreshToken`), which are also the
/// two keys of the persisted record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens are secrets; keep them out of logs and panic messages.
impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Durable holder for the session's token pair.
///
/// `read` returns the pair or nothing: a reader can never observe one token
/// without the other.
pub trait CredentialStore: Send + Sync {
    /// Persist both tokens; later reads anywhere in the process see the new pair
    fn save(&self, tokens: &TokenPair) -> Result<()>;

    /// Current snapshot, without touching the backing storage
    fn read(&self) -> Option<TokenPair>;

    /// Remove both tokens. Clearing an empty store is not an error.
    fn clear(&self) -> Result<()>;

    fn access_token(&self) -> Option<String> {
        self.read().map(|t| t.access_token)
    }

    fn refresh_token(&self) -> Option<String> {
        self.read().map(|t| t.refresh_token)
    }

    fn has_credentials(&self) -> bool {
        self.read().is_some()
    }
}

/// In-memory view shared by every backend. Writers are serialized so the
/// durable copy and the snapshot are always updated in the same order.
#[derive(Default)]
struct Snapshot {
    current: RwLock<Option<TokenPair>>,
    writer: Mutex<()>,
}

impl Snapshot {
    fn with(initial: Option<TokenPair>) -> Self {
        Self {
            current: RwLock::new(initial),
            writer: Mutex::new(()),
        }
    }

    fn get(&self) -> Option<TokenPair> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `persist` and then publish `next`, holding the writer lock throughout.
    ///
    /// A failed save leaves the previous pair in place. A clear is always
    /// published, even when the backing storage could not be emptied; the
    /// error is still returned.
    fn update(&self, next: Option<TokenPair>, persist: impl FnOnce() -> Result<()>) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let persisted = persist();
        if persisted.is_ok() || next.is_none() {
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        }
        persisted
    }
}

/// Process-local store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryCredentialStore {
    snapshot: Snapshot,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a token pair, as if restored from a previous run
    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            snapshot: Snapshot::with(Some(tokens)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, tokens: &TokenPair) -> Result<()> {
        self.snapshot.update(Some(tokens.clone()), || Ok(()))
    }

    fn read(&self) -> Option<TokenPair> {
        self.snapshot.get()
    }

    fn clear(&self) -> Result<()> {
        self.snapshot.update(None, || Ok(()))
    }
}

/// OS keychain store. Both tokens live in a single keychain secret, so a save
/// or clear can never leave half a session behind.
pub struct KeyringCredentialStore {
    entry: Entry,
    snapshot: Snapshot,
}

impl KeyringCredentialStore {
    /// Open the default keychain entry and load any stored session
    pub fn new() -> Result<Self> {
        Self::open(SERVICE_NAME, SESSION_ACCOUNT)
    }

    pub fn open(service: &str, account: &str) -> Result<Self> {
        let entry = Entry::new(service, account).context("Failed to create keyring entry")?;
        let initial = match entry.get_password() {
            Ok(secret) => match serde_json::from_str::<TokenPair>(&secret) {
                Ok(tokens) => Some(tokens),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable session in keychain");
                    None
                }
            },
            Err(keyring::Error::NoEntry) => None,
            Err(e) => return Err(e).context("Failed to read session from keychain"),
        };
        debug!(restored = initial.is_some(), "Keychain credential store opened");

        Ok(Self {
            entry,
            snapshot: Snapshot::with(initial),
        })
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save(&self, tokens: &TokenPair) -> Result<()> {
        let secret = serde_json::to_string(tokens)?;
        self.snapshot.update(Some(tokens.clone()), || {
            self.entry
                .set_password(&secret)
                .context("Failed to store session in keychain")
        })
    }

    fn read(&self) -> Option<TokenPair> {
        self.snapshot.get()
    }

    fn clear(&self) -> Result<()> {
        self.snapshot.update(None, || match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    #[serde(flatten)]
    tokens: TokenPair,
    saved_at: DateTime<Utc>,
}

/// Store backed by `session.json` in the cache directory.
///
/// Writes go to a temporary file that is renamed over the real one, so the
/// file on disk always holds either the old pair or the new pair.
pub struct FileCredentialStore {
    cache_dir: PathBuf,
    snapshot: Snapshot,
}

impl FileCredentialStore {
    /// Open the store in `cache_dir`, loading a previously saved session
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let path = cache_dir.join(SESSION_FILE);
        let initial = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read session file")?;
            match serde_json::from_str::<SessionFile>(&contents) {
                Ok(file) => {
                    debug!(saved_at = %file.saved_at, "Session file loaded");
                    Some(file.tokens)
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable session file");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            cache_dir,
            snapshot: Snapshot::with(initial),
        })
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }

    fn write_atomically(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).context("Failed to write session file")?;
        std::fs::rename(&tmp, path).context("Failed to replace session file")?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn save(&self, tokens: &TokenPair) -> Result<()> {
        let file = SessionFile {
            tokens: tokens.clone(),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        let path = self.session_path();
        self.snapshot
            .update(Some(tokens.clone()), || Self::write_atomically(&path, &contents))
    }

    fn read(&self) -> Option<TokenPair> {
        self.snapshot.get()
    }

    fn clear(&self) -> Result<()> {
        let path = self.session_path();
        self.snapshot.update(None, || {
            if path.exists() {
                std::fs::remove_file(&path).context("Failed to remove session file")?;
            }
            Ok(())
        })
    }
}
