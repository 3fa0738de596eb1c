use std::fmt;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Signs and checks tree signables. The core never looks inside a
/// signature, so any scheme (multi-signature, threshold, ...) fits.
pub trait Signer: Send + Sync {
    fn sign(&self, signable: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, signable: &[u8], signature: &[u8]) -> bool;
}

/// Writer identity. Readers only hold the public half.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub secret_key: Option<[u8; 32]>,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public_key: signing_key.verifying_key().to_bytes(),
            secret_key: Some(signing_key.to_bytes()),
        }
    }

    /// The same identity without the secret key.
    pub fn public(&self) -> Self {
        Self {
            public_key: self.public_key,
            secret_key: None,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.secret_key.is_some()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex_prefix(&self.public_key))
            .field("secret_key", &self.secret_key.map(|_| "<redacted>"))
            .finish()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

pub struct Ed25519Signer {
    verifying_key: VerifyingKey,
    signing_key: Option<SigningKey>,
}

impl Ed25519Signer {
    pub fn new(key_pair: &KeyPair) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(&key_pair.public_key)
            .map_err(|e| Error::InvalidOperation(format!("invalid public key: {e}")))?;
        let signing_key = key_pair.secret_key.as_ref().map(SigningKey::from_bytes);

        if let Some(signing_key) = &signing_key {
            if signing_key.verifying_key() != verifying_key {
                return Err(Error::InvalidOperation(
                    "secret key does not match public key".into(),
                ));
            }
        }

        Ok(Self {
            verifying_key,
            signing_key,
        })
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, signable: &[u8]) -> Result<Vec<u8>> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("no secret key, cannot sign".into()))?;
        Ok(signing_key.sign(signable).to_bytes().to_vec())
    }

    fn verify(&self, signable: &[u8], signature: &[u8]) -> bool {
        let sig = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.verifying_key.verify(signable, &sig).is_ok()
    }
}
