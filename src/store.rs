//! Durable records: voiceprints and one-time code records, keyed by account.

use crate::error::{Result, ShieldError};
use crate::identity::AccountId;
use crate::otp::{OtpCode, OtpRecord};
use crate::voiceprint::VoicePrint;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Storage for enrolled voiceprints.
#[async_trait::async_trait]
pub trait VoicePrintStore: Send + Sync {
    /// Store a voiceprint, atomically replacing any earlier one for the account.
    async fn persist_voiceprint(&self, voiceprint: &VoicePrint) -> Result<()>;

    async fn voiceprint(&self, account: &AccountId) -> Result<Option<VoicePrint>>;

    /// Returns whether a voiceprint existed.
    async fn delete_voiceprint(&self, account: &AccountId) -> Result<bool>;
}

/// Storage for one-time code records. At most one record per account.
#[async_trait::async_trait]
pub trait OtpStore: Send + Sync {
    /// Replace-or-insert the account's record.
    async fn put_otp(&self, record: OtpRecord) -> Result<()>;

    async fn otp(&self, account: &AccountId) -> Result<Option<OtpRecord>>;

    /// Mark the record consumed if it is still unconsumed and still holds
    /// `code`. Returns false when another caller got there first.
    async fn mark_consumed(&self, account: &AccountId, code: &OtpCode) -> Result<bool>;

    /// Returns whether a record existed.
    async fn remove_otp(&self, account: &AccountId) -> Result<bool>;
}

/// Remove everything stored for an account.
pub async fn delete_account_records(
    voiceprints: &dyn VoicePrintStore,
    otps: &dyn OtpStore,
    account: &AccountId,
) -> Result<()> {
    let had_voiceprint = voiceprints.delete_voiceprint(account).await?;
    let had_code = otps.remove_otp(account).await?;
    tracing::info!(account = %account, had_voiceprint, had_code, "account records deleted");
    Ok(())
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    voiceprints: Mutex<HashMap<AccountId, VoicePrint>>,
    otps: Mutex<HashMap<AccountId, OtpRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn voiceprint_count(&self) -> usize {
        self.voiceprints.lock().await.len()
    }

    pub async fn otp_count(&self) -> usize {
        self.otps.lock().await.len()
    }
}

#[async_trait::async_trait]
impl VoicePrintStore for MemoryStore {
    async fn persist_voiceprint(&self, voiceprint: &VoicePrint) -> Result<()> {
        self.voiceprints
            .lock()
            .await
            .insert(voiceprint.account_id.clone(), voiceprint.clone());
        Ok(())
    }

    async fn voiceprint(&self, account: &AccountId) -> Result<Option<VoicePrint>> {
        Ok(self.voiceprints.lock().await.get(account).cloned())
    }

    async fn delete_voiceprint(&self, account: &AccountId) -> Result<bool> {
        Ok(self.voiceprints.lock().await.remove(account).is_some())
    }
}

#[async_trait::async_trait]
impl OtpStore for MemoryStore {
    async fn put_otp(&self, record: OtpRecord) -> Result<()> {
        self.otps
            .lock()
            .await
            .insert(record.account_id.clone(), record);
        Ok(())
    }

    async fn otp(&self, account: &AccountId) -> Result<Option<OtpRecord>> {
        Ok(self.otps.lock().await.get(account).cloned())
    }

    async fn mark_consumed(&self, account: &AccountId, code: &OtpCode) -> Result<bool> {
        let mut otps = self.otps.lock().await;
        match otps.get_mut(account) {
            Some(record) if !record.consumed && record.code.matches(code) => {
                record.consumed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_otp(&self, account: &AccountId) -> Result<bool> {
        Ok(self.otps.lock().await.remove(account).is_some())
    }
}

/// Store that keeps one JSON file per record under a data directory:
/// `voiceprints/<account>.json` and `codes/<account>.json`.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// reader never sees a partial record.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    // Serialises read-modify-write sequences within this process.
    lock: Mutex<()>,
}

const VOICEPRINT_DIR: &str = "voiceprints";
const CODE_DIR: &str = "codes";

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, account: &AccountId) -> Result<PathBuf> {
        let id = account.as_str();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ShieldError::Store {
                message: format!("account id {:?} is not usable as a file name", id),
            });
        }
        Ok(self.root.join(kind).join(format!("{}.json", id)))
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ShieldError::Io(e)),
        }
    }

    async fn write<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        let parent = path.parent().ok_or_else(|| ShieldError::Store {
            message: format!("{} has no parent directory", path.display()),
        })?;
        tokio::fs::create_dir_all(parent).await?;

        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ShieldError::Io(e)),
        }
    }
}

#[async_trait::async_trait]
impl VoicePrintStore for JsonFileStore {
    async fn persist_voiceprint(&self, voiceprint: &VoicePrint) -> Result<()> {
        let path = self.record_path(VOICEPRINT_DIR, &voiceprint.account_id)?;
        let _guard = self.lock.lock().await;
        self.write(&path, voiceprint).await
    }

    async fn voiceprint(&self, account: &AccountId) -> Result<Option<VoicePrint>> {
        let path = self.record_path(VOICEPRINT_DIR, account)?;
        self.read(&path).await
    }

    async fn delete_voiceprint(&self, account: &AccountId) -> Result<bool> {
        let path = self.record_path(VOICEPRINT_DIR, account)?;
        let _guard = self.lock.lock().await;
        self.remove(&path).await
    }
}

#[async_trait::async_trait]
impl OtpStore for JsonFileStore {
    async fn put_otp(&self, record: OtpRecord) -> Result<()> {
        let path = self.record_path(CODE_DIR, &record.account_id)?;
        let _guard = self.lock.lock().await;
        self.write(&path, &record).await
    }

    async fn otp(&self, account: &AccountId) -> Result<Option<OtpRecord>> {
        let path = self.record_path(CODE_DIR, account)?;
        self.read(&path).await
    }

    async fn mark_consumed(&self, account: &AccountId, code: &OtpCode) -> Result<bool> {
        let path = self.record_path(CODE_DIR, account)?;
        let _guard = self.lock.lock().await;
        let Some(mut record) = self.read::<OtpRecord>(&path).await? else {
            return Ok(false);
        };
        if record.consumed || !record.code.matches(code) {
            return Ok(false);
        }
        record.consumed = true;
        self.write(&path, &record).await?;
        Ok(true)
    }

    async fn remove_otp(&self, account: &AccountId) -> Result<bool> {
        let path = self.record_path(CODE_DIR, account)?;
        let _guard = self.lock.lock().await;
        self.remove(&path).await
    }
}
