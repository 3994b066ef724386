//! Node identity and data directory layout
//!
//! The data directory holds the node's private key and the block repository.
//! It must be readable by the owner only; a world- or group-accessible
//! directory aborts node creation. The private key is stored as hex in
//! `private.key`.

use base64::Engine;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Private key file inside the data directory.
pub const KEY_FILE: &str = "private.key";

/// Block repository directory inside the data directory.
pub const REPO_DIR: &str = "repo";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data directory {0} has insecure permissions (mode {1:o}); owner-only required")]
    InsecurePermissions(PathBuf, u32),

    #[error("Malformed private key file: {0}")]
    MalformedKey(String),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// The node's key material and derived peer identity.
pub struct NodeIdentity {
    secret: [u8; 32],
    peer_id: String,
}

#[derive(Serialize)]
struct PeerRecord<'a> {
    #[serde(rename = "peerId")]
    peer_id: &'a str,
    addrs: &'a [String],
    #[serde(rename = "seqNo")]
    seq_no: u64,
}

impl NodeIdentity {
    /// Load the identity from `data_dir`, creating the directory and key on
    /// first run. Fails when the directory is accessible to anyone but the
    /// owner.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        if !data_dir.exists() {
            fs::create_dir_all(data_dir)?;
            set_owner_only(data_dir, 0o700)?;
        }
        check_owner_only(data_dir)?;

        let key_path = data_dir.join(KEY_FILE);
        let secret = if key_path.exists() {
            let hex_key = fs::read_to_string(&key_path)?;
            let bytes = hex::decode(hex_key.trim())
                .map_err(|e| IdentityError::MalformedKey(e.to_string()))?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| IdentityError::MalformedKey("key must be 32 bytes".into()))?;
            secret
        } else {
            let mut secret = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut secret);
            fs::write(&key_path, hex::encode(secret))?;
            set_owner_only(&key_path, 0o600)?;
            info!(path = %key_path.display(), "generated node private key");
            secret
        };

        let peer_id = hex::encode(Sha256::digest(secret));
        Ok(Self { secret, peer_id })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Encoded peer record: `spr:` + base64 of the JSON record.
    pub fn peer_record(&self, addrs: &[String]) -> String {
        let record = PeerRecord {
            peer_id: &self.peer_id,
            addrs,
            seq_no: 1,
        };
        let json = serde_json::to_vec(&record).unwrap_or_default();
        format!(
            "spr:{}",
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
        )
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(IdentityError::InsecurePermissions(
            path.to_path_buf(),
            mode & 0o777,
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}
