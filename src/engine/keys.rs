//! Archive keypairs.
//!
//! An archive key is the Ed25519 public key of a freshly generated keypair.
//! The PKCS#8 secret is written hex-encoded to `<secret_dir>/<key>.key`;
//! holding that file is what makes an archive writable.

use super::traits::{ArchiveKey, EngineError, EngineResult};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Path of the secret file for `key`.
pub fn secret_path(secret_dir: &Path, key: &ArchiveKey) -> PathBuf {
    secret_dir.join(format!("{}.key", key.to_hex()))
}

/// Generate a keypair, persist its secret, return the public key.
pub async fn generate_keypair(secret_dir: &Path) -> EngineResult<ArchiveKey> {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| EngineError::Crypto("keypair generation failed".to_string()))?;
    let pkcs8 = Zeroizing::new(pkcs8.as_ref().to_vec());

    let pair = Ed25519KeyPair::from_pkcs8(&pkcs8)
        .map_err(|e| EngineError::Crypto(format!("invalid generated keypair: {}", e)))?;
    let key = ArchiveKey::from_bytes(pair.public_key().as_ref())?;

    tokio::fs::create_dir_all(secret_dir).await?;
    let path = secret_path(secret_dir, &key);
    let encoded = Zeroizing::new(hex::encode(pkcs8.as_slice()));
    tokio::fs::write(&path, encoded.as_bytes()).await?;
    restrict_permissions(&path).await?;

    tracing::debug!(key = %key, path = %path.display(), "stored archive secret");
    Ok(key)
}

/// True if `secret_dir` holds the secret for `key`.
pub async fn holds_secret(secret_dir: &Path, key: &ArchiveKey) -> bool {
    let raw = match tokio::fs::read_to_string(secret_path(secret_dir, key)).await {
        Ok(raw) => Zeroizing::new(raw),
        Err(_) => return false,
    };
    let pkcs8 = match hex::decode(raw.trim()) {
        Ok(bytes) => Zeroizing::new(bytes),
        Err(_) => return false,
    };
    match Ed25519KeyPair::from_pkcs8(&pkcs8) {
        Ok(pair) => pair.public_key().as_ref() == key.as_bytes(),
        Err(_) => false,
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> EngineResult<()> {
    Ok(())
}
