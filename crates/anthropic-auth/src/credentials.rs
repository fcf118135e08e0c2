//! The credentials document: a stateless codec plus an atomic file writer.
//!
//! The document is the on-disk source of truth at startup and after every
//! hot reload; once loaded, the pool holds the authoritative in-memory
//! state (see `anthropic_pool::pool::Pool`), so this module does not cache
//! account data between calls — only the write path serializes concurrent
//! writers via `CredentialsStore`'s lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::Secret;

use crate::error::{Error, Result};

const CURRENT_VERSION: u32 = 1;

/// One account as parsed from (or destined for) the on-disk document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAccount {
    pub name: String,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: u64,
}

/// Account name must match `^[a-z0-9_-]{1,32}$`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAccount {
    access_token: String,
    refresh_token: String,
    expires_at: u64,
}

/// Insertion-ordered map of account name to credential, with duplicate-key
/// rejection during deserialization (plain `HashMap`/`serde_json::Map` both
/// silently keep the last of two duplicate JSON keys; the on-disk format
/// requires a hard load failure instead, per the documented validation rule).
struct OrderedAccounts(Vec<(String, WireAccount)>);

impl Serialize for OrderedAccounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, account) in &self.0 {
            map.serialize_entry(name, account)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderedAccounts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AccountsVisitor;

        impl<'de> Visitor<'de> for AccountsVisitor {
            type Value = OrderedAccounts;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "a map of account name to credential")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = HashSet::new();
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, account)) = map.next_entry::<String, WireAccount>()? {
                    if !seen.insert(name.clone()) {
                        return Err(de::Error::custom(format!(
                            "duplicate account name in document: {name}"
                        )));
                    }
                    entries.push((name, account));
                }
                Ok(OrderedAccounts(entries))
            }
        }

        deserializer.deserialize_map(AccountsVisitor)
    }
}

#[derive(Serialize, Deserialize)]
struct WireDocument {
    version: u32,
    accounts: OrderedAccounts,
}

/// Parse and validate a credentials document from its JSON text.
///
/// Order of `ParsedAccount`s in the returned vec is the order accounts
/// appeared in the document, which callers must preserve into the pool's
/// rotation order.
pub fn parse_document(contents: &str) -> Result<Vec<ParsedAccount>> {
    let document: WireDocument = serde_json::from_str(contents)
        .map_err(|e| Error::CredentialsInvalid(format!("parsing document: {e}")))?;

    if document.version != CURRENT_VERSION {
        return Err(Error::CredentialsInvalid(format!(
            "unsupported document version {} (expected {CURRENT_VERSION})",
            document.version
        )));
    }

    let mut accounts = Vec::with_capacity(document.accounts.0.len());
    for (name, wire) in document.accounts.0 {
        if !is_valid_name(&name) {
            return Err(Error::CredentialsInvalid(format!(
                "invalid account name: {name}"
            )));
        }
        if wire.access_token.is_empty() || wire.refresh_token.is_empty() {
            return Err(Error::CredentialsInvalid(format!(
                "account {name} has an empty token"
            )));
        }
        if wire.expires_at == 0 {
            return Err(Error::CredentialsInvalid(format!(
                "account {name} has a non-positive expiresAt"
            )));
        }
        accounts.push(ParsedAccount {
            name,
            access_token: Secret::new(wire.access_token),
            refresh_token: Secret::new(wire.refresh_token),
            expires_at: wire.expires_at,
        });
    }

    Ok(accounts)
}

/// Serialize accounts back into document text, preserving the given order.
pub fn serialize_document(accounts: &[ParsedAccount]) -> Result<String> {
    let wire_accounts = accounts
        .iter()
        .map(|a| {
            (
                a.name.clone(),
                WireAccount {
                    access_token: a.access_token.expose().clone(),
                    refresh_token: a.refresh_token.expose().clone(),
                    expires_at: a.expires_at,
                },
            )
        })
        .collect();
    let document = WireDocument {
        version: CURRENT_VERSION,
        accounts: OrderedAccounts(wire_accounts),
    };
    serde_json::to_string_pretty(&document)
        .map_err(|e| Error::CredentialsInvalid(format!("serializing document: {e}")))
}

/// A SHA-256 digest of document text, used by the watcher to recognize its
/// own writes and avoid reloading them.
pub fn content_hash(contents: &str) -> String {
    use base64::Engine;
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(contents.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Owns the on-disk path and serializes concurrent writers. Holds no
/// account state of its own.
pub struct CredentialsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and parse the document. If the file does not exist, treats it
    /// as a first run: writes out an empty `{"version":1,"accounts":{}}`
    /// document and returns no accounts, rather than failing startup.
    pub async fn load(&self) -> Result<Vec<ParsedAccount>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "credentials document not found, starting empty");
            self.save(&[]).await?;
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading credentials document: {e}")))?;
        let accounts = parse_document(&contents)?;
        info!(path = %self.path.display(), accounts = accounts.len(), "loaded credentials document");
        Ok(accounts)
    }

    /// Serialize and atomically persist `accounts`. Returns the content
    /// hash of what was written, for the watcher's self-write suppression.
    pub async fn save(&self, accounts: &[ParsedAccount]) -> Result<String> {
        let text = serialize_document(accounts)?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, &text).await?;
        debug!(path = %self.path.display(), accounts = accounts.len(), "persisted credentials document");
        Ok(content_hash(&text))
    }
}

async fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating credentials directory: {e}")))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    let file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp credentials file: {e}")))?;
    {
        use tokio::io::AsyncWriteExt;
        let mut file = file;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("writing temp credentials file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Io(format!("fsyncing temp credentials file: {e}")))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credentials file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path).await.map_err(|e| {
        warn!(path = %path.display(), "failed to rename temp credentials file into place");
        Error::Io(format!("renaming temp credentials file: {e}"))
    })
}
