//! Secret field boundary
//!
//! Access tokens, token secrets, and refresh tokens never cross the storage
//! boundary in the clear. A [`SecretCipher`] seals plaintext into an opaque
//! stored representation and opens it back; the broker only ever holds
//! [`SecretField`] values and is agnostic to the cipher behind them. The
//! encryption primitive itself lives outside this crate; a passthrough cipher
//! is provided for tests and for deployments that encrypt at a lower layer.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Cipher error types
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("sealing secret failed: {0}")]
    SealFailed(String),
    #[error("opening secret failed: {0}")]
    OpenFailed(String),
}

/// Pluggable seal/open boundary for sensitive fields.
pub trait SecretCipher: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String, CipherError>;
    fn open(&self, sealed: &str) -> Result<String, CipherError>;
}

/// Cipher that stores secrets verbatim. Suitable for tests and for hosts that
/// encrypt the whole store at rest.
#[derive(Debug, Default, Clone)]
pub struct PassthroughCipher;

impl SecretCipher for PassthroughCipher {
    fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        Ok(plaintext.to_string())
    }

    fn open(&self, sealed: &str) -> Result<String, CipherError> {
        Ok(sealed.to_string())
    }
}

/// Shared handle to the active cipher.
pub type CipherHandle = Arc<dyn SecretCipher>;

/// A sensitive string in its sealed (stored) representation.
///
/// `Debug` output is redacted. The sealed bytes are zeroized on drop. An
/// absent optional secret is represented as `None` at the model level, never
/// as an empty `SecretField`; emptiness and absence are distinct states.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretField(String);

impl SecretField {
    /// Seal a plaintext secret through the active cipher.
    pub fn seal(cipher: &CipherHandle, plaintext: &str) -> Result<Self, CipherError> {
        Ok(SecretField(cipher.seal(plaintext)?))
    }

    /// Wrap a value that is already in sealed form (e.g. read from storage).
    pub fn from_sealed(sealed: String) -> Self {
        SecretField(sealed)
    }

    /// Recover the plaintext through the active cipher.
    pub fn open(&self, cipher: &CipherHandle) -> Result<String, CipherError> {
        cipher.open(&self.0)
    }

    /// The sealed representation, for handing to storage.
    pub fn sealed(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretField(<redacted>)")
    }
}
