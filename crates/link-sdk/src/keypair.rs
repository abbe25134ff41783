//! Link identity: a P-256 key pair and the values derived from it.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use crate::platform::Storage;
use crate::types::{LinkError, Result};

/// Brokers differ on whether they pad URL-safe base64.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The key capability the handshake needs.
pub trait KeyPair: Send + Sync {
    /// Uncompressed SEC1 public point.
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Key file line: `"<private> <public>"`, both standard base64.
    fn save(&self) -> String;

    /// ECDH with a peer's URL-safe base64 public key; returns the shared
    /// X coordinate.
    fn derive_shared_secret(&self, peer_public_key: &str) -> Result<Vec<u8>>;

    /// URL-safe, unpadded base64 of [`public_key_bytes`](Self::public_key_bytes).
    fn encoded_public_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key_bytes())
    }
}

#[derive(Clone)]
pub struct P256KeyPair {
    secret: SecretKey,
}

impl P256KeyPair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Parse a key file line.  The public half, when present, must match
    /// the private scalar.
    pub fn load(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let private = fields
            .next()
            .ok_or_else(|| LinkError::Key("empty key file".into()))?;
        let raw = STANDARD
            .decode(private)
            .map_err(|e| LinkError::Key(format!("private key is not base64: {e}")))?;

        // Big-integer encoders may prepend a zero byte.
        let trimmed = match raw.len() {
            n if n > 32 => &raw[n - 32..],
            _ => &raw[..],
        };
        let secret = SecretKey::from_slice(trimmed)
            .map_err(|_| LinkError::Key("private key is not a valid P-256 scalar".into()))?;
        let pair = Self { secret };

        if let Some(public) = fields.next() {
            let stored = STANDARD
                .decode(public)
                .map_err(|e| LinkError::Key(format!("public key is not base64: {e}")))?;
            if stored != pair.public_key_bytes() {
                return Err(LinkError::Key(
                    "public key does not match private key".into(),
                ));
            }
        }
        Ok(pair)
    }

    /// Load the key file at `path`, or generate and persist a new pair.
    pub async fn load_or_generate(storage: &dyn Storage, path: &str) -> Result<Self> {
        if storage.exists(path).await {
            let line = storage.read(path).await?;
            if !line.trim().is_empty() {
                tracing::debug!(path = %path, "loaded link keys");
                return Self::load(line.trim());
            }
        }
        let pair = Self::generate();
        storage.write(path, &pair.save()).await?;
        tracing::info!(path = %path, "generated new link keys");
        Ok(pair)
    }
}

impl KeyPair for P256KeyPair {
    fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    fn save(&self) -> String {
        format!(
            "{} {}",
            STANDARD.encode(self.secret.to_bytes()),
            STANDARD.encode(self.public_key_bytes())
        )
    }

    fn derive_shared_secret(&self, peer_public_key: &str) -> Result<Vec<u8>> {
        let raw = URL_SAFE_LENIENT
            .decode(peer_public_key)
            .map_err(|e| LinkError::Key(format!("peer key is not base64: {e}")))?;
        let peer = PublicKey::from_sec1_bytes(&raw)
            .map_err(|_| LinkError::Key("peer key is not a P-256 point".into()))?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Derived identifiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sha256_url(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// `name-<hash of public key>`.
pub fn ds_id(name: &str, public_key: &[u8]) -> String {
    format!("{name}-{}", sha256_url(&[public_key]))
}

/// Connection `auth` parameter: hash of salt followed by shared secret.
pub fn auth_param(salt: &str, shared_secret: &[u8]) -> String {
    sha256_url(&[salt.as_bytes(), shared_secret])
}

/// Token query parameter: the token's 16-char id followed by a hash of
/// `ds_id ‖ token`.
pub fn create_token(token: &str, ds_id: &str) -> String {
    let id: String = token.chars().take(16).collect();
    format!("{id}{}", sha256_url(&[ds_id.as_bytes(), token.as_bytes()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FsStorage;

    #[test]
    fn token_hash_matches_known_vector() {
        let token = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKL";
        let ds = "test-link-0123456789";
        assert_eq!(
            create_token(token, ds),
            "abcdefghijklmnop4SSJtKYs5XTBMGvRbBAq5vDfRjjXLPtYHiHlFez0U8I"
        );
        assert_eq!(create_token(token, ds), create_token(token, ds));
    }

    #[test]
    fn ds_id_hashes_public_key() {
        let mut key = vec![4u8];
        key.extend(1..=64u8);
        assert_eq!(
            ds_id("link", &key),
            "link-DtOmq5V_9vWaljCkc9MafQT8tGVIuJAWGWmAx-llhPY"
        );
    }

    #[test]
    fn auth_hashes_salt_then_secret() {
        let secret: Vec<u8> = (0..32u8).collect();
        assert_eq!(
            auth_param("0x1234", &secret),
            "-efqgNMC5VG81Stmcl79CPk18TKNCBKLNrz9G63Ye_M"
        );
    }

    #[test]
    fn save_then_load_restores_identity() {
        let pair = P256KeyPair::generate();
        let line = pair.save();
        assert_eq!(line.split(' ').count(), 2);
        let loaded = P256KeyPair::load(&line).unwrap();
        assert_eq!(loaded.public_key_bytes(), pair.public_key_bytes());
        assert_eq!(pair.public_key_bytes().len(), 65);
    }

    #[test]
    fn mismatched_public_half_rejected() {
        let a = P256KeyPair::generate();
        let b = P256KeyPair::generate();
        let private = a.save().split(' ').next().unwrap().to_string();
        let public = b.save().split(' ').nth(1).unwrap().to_string();
        assert!(P256KeyPair::load(&format!("{private} {public}")).is_err());
    }

    #[test]
    fn both_sides_derive_same_secret() {
        let a = P256KeyPair::generate();
        let b = P256KeyPair::generate();
        let ab = a.derive_shared_secret(&b.encoded_public_key()).unwrap();
        let ba = b.derive_shared_secret(&a.encoded_public_key()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 32);
    }

    #[tokio::test]
    async fn load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let first = P256KeyPair::load_or_generate(&storage, "keys/dslink.keys")
            .await
            .unwrap();
        let second = P256KeyPair::load_or_generate(&storage, "keys/dslink.keys")
            .await
            .unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }
}
