//! Identity keypairs and the signed claims that bind them to sessions.
//!
//! Every peer holds a long-lived Ed25519 identity key and a Noise static
//! keypair. During the handshake each side sends a [`PeerClaim`]: its
//! identity key, its Noise static public key, and a signature binding the
//! two under a domain-separated context. Verifying the claim against the
//! static key the handshake actually produced proves the session endpoint
//! speaks for that identity - without it, any key could claim any name.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::IdentityError;
use crate::noise::NOISE_PATTERN;

/// Encoded claim length: identity key, static key, signature.
pub const CLAIM_LEN: usize = 32 + 32 + 64;

/// Domain separation for the key-binding signature.
const BINDING_CONTEXT: &[u8] = b"umbra identity key binding v1";

/// Hex digits of the identity key shown in fingerprints.
const FINGERPRINT_LEN: usize = 8;

/// A peer's long-lived identity: Ed25519 signing key plus Noise static
/// keypair. The private halves are zeroized on drop.
pub struct Identity {
    signing: SigningKey,
    noise_public: [u8; 32],
    noise_private: Zeroizing<Vec<u8>>,
}

impl Identity {
    /// Generate a fresh identity from the system CSPRNG.
    ///
    /// # Errors
    ///
    /// Fails if Noise static key generation fails.
    pub fn generate() -> Result<Self, IdentityError> {
        let signing = SigningKey::generate(&mut OsRng);
        let params = NOISE_PATTERN
            .parse()
            .map_err(IdentityError::Keygen)?;
        let keypair = snow::Builder::new(params).generate_keypair()?;

        let mut noise_public = [0u8; 32];
        noise_public.copy_from_slice(&keypair.public);
        Ok(Self {
            signing,
            noise_public,
            noise_private: Zeroizing::new(keypair.private),
        })
    }

    /// The Ed25519 verifying key bytes.
    #[must_use]
    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The Noise static public key.
    #[must_use]
    pub fn noise_public(&self) -> &[u8; 32] {
        &self.noise_public
    }

    /// The Noise static private key, for engine construction.
    pub(crate) fn noise_private(&self) -> &[u8] {
        &self.noise_private
    }

    /// Build the signed claim this identity sends during handshakes.
    #[must_use]
    pub fn claim(&self) -> PeerClaim {
        let binding = binding_message(&self.noise_public);
        let signature = self.signing.sign(&binding);
        PeerClaim {
            identity_key: self.verifying_key(),
            noise_static: self.noise_public,
            signature: signature.to_bytes(),
        }
    }

    /// Short hex fingerprint of the identity key, for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.verifying_key())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// The signed identity claim carried in a handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerClaim {
    identity_key: [u8; 32],
    noise_static: [u8; 32],
    signature: [u8; 64],
}

impl PeerClaim {
    /// Encode to the fixed wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; CLAIM_LEN] {
        let mut out = [0u8; CLAIM_LEN];
        out[..32].copy_from_slice(&self.identity_key);
        out[32..64].copy_from_slice(&self.noise_static);
        out[64..].copy_from_slice(&self.signature);
        out
    }

    /// Decode from handshake payload bytes.
    ///
    /// # Errors
    ///
    /// Fails when the payload is not exactly [`CLAIM_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != CLAIM_LEN {
            return Err(IdentityError::ClaimLength {
                expected: CLAIM_LEN,
                actual: bytes.len(),
            });
        }
        let mut identity_key = [0u8; 32];
        let mut noise_static = [0u8; 32];
        let mut signature = [0u8; 64];
        identity_key.copy_from_slice(&bytes[..32]);
        noise_static.copy_from_slice(&bytes[32..64]);
        signature.copy_from_slice(&bytes[64..]);
        Ok(Self {
            identity_key,
            noise_static,
            signature,
        })
    }

    /// Verify the claim against the static key the handshake produced.
    ///
    /// CPU-bound (one Ed25519 verification); runs inside a handshake task,
    /// not on the reactor thread.
    ///
    /// # Errors
    ///
    /// Fails when the claimed static key differs from the session's, when
    /// the identity key is invalid, or when the signature does not verify.
    pub fn verify(&self, expected_static: &[u8; 32]) -> Result<VerifiedPeer, IdentityError> {
        if &self.noise_static != expected_static {
            return Err(IdentityError::StaticKeyMismatch);
        }
        let key = VerifyingKey::from_bytes(&self.identity_key)
            .map_err(|_| IdentityError::InvalidIdentityKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&self.signature);
        key.verify_strict(&binding_message(&self.noise_static), &signature)
            .map_err(|_| IdentityError::SignatureInvalid)?;
        Ok(VerifiedPeer {
            identity_key: self.identity_key,
        })
    }

    /// The claimed identity key bytes.
    #[must_use]
    pub fn identity_key(&self) -> &[u8; 32] {
        &self.identity_key
    }
}

/// An identity that survived claim verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    identity_key: [u8; 32],
}

impl VerifiedPeer {
    /// The verified identity key bytes.
    #[must_use]
    pub fn identity_key(&self) -> &[u8; 32] {
        &self.identity_key
    }

    /// Short hex fingerprint, for logs and pinning displays.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.identity_key)
    }
}

impl fmt::Display for VerifiedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

fn binding_message(noise_static: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(BINDING_CONTEXT.len() + 32);
    msg.extend_from_slice(BINDING_CONTEXT);
    msg.extend_from_slice(noise_static);
    msg
}

fn fingerprint_of(identity_key: &[u8; 32]) -> String {
    hex::encode(&identity_key[..FINGERPRINT_LEN / 2])
}
