//! Trust policies and the delegated handshake task.
//!
//! Claim verification is one Ed25519 signature check plus a policy decision -
//! cheap in absolute terms but still the most expensive step of a handshake,
//! so the engine packages it as a [`HandshakeTask`] the caller runs off the
//! reactor thread. The verdict lands in a shared write-once cell the engine
//! polls; no pool thread ever calls back into the engine.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::TrustError;
use crate::identity::{PeerClaim, VerifiedPeer};

/// Policy deciding whether a cryptographically verified peer is acceptable.
///
/// Evaluated after the claim signature has already been checked; the policy
/// only decides whether that identity may hold a session. Implementations
/// cross threads (they run on the task pool) and must be cheap enough to run
/// during connection setup.
pub trait TrustProvider: Send + Sync {
    /// Accept or reject a verified peer identity.
    ///
    /// # Errors
    ///
    /// Returns a [`TrustError`] describing why the identity is rejected.
    fn evaluate(&self, peer: &VerifiedPeer) -> Result<(), TrustError>;
}

/// Accepts any peer whose identity claim verified.
///
/// Useful for relays that authenticate at the application layer (`AUTH`)
/// rather than by transport identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustAnyVerified;

impl TrustProvider for TrustAnyVerified {
    fn evaluate(&self, _peer: &VerifiedPeer) -> Result<(), TrustError> {
        Ok(())
    }
}

/// Accepts only peers whose identity key is in a pinned allowlist.
#[derive(Debug, Clone, Default)]
pub struct PinnedIdentities {
    allowed: HashSet<[u8; 32]>,
}

impl PinnedIdentities {
    /// Empty allowlist; rejects everything until keys are pinned.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin an identity key as trusted.
    pub fn pin(&mut self, identity_key: [u8; 32]) {
        self.allowed.insert(identity_key);
    }

    /// Number of pinned identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    /// Whether the allowlist is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl TrustProvider for PinnedIdentities {
    fn evaluate(&self, peer: &VerifiedPeer) -> Result<(), TrustError> {
        if self.allowed.contains(peer.identity_key()) {
            Ok(())
        } else {
            Err(TrustError::UnknownIdentity {
                fingerprint: peer.fingerprint(),
            })
        }
    }
}

/// Outcome of a handshake task, written once into the shared cell.
#[derive(Debug, Clone)]
pub enum TaskVerdict {
    /// The claim verified and the trust policy accepted the identity.
    Accepted(VerifiedPeer),
    /// Verification or policy failed; the handshake must fail.
    Rejected(String),
}

/// CPU-bound peer validation delegated out of the session engine.
///
/// Runs anywhere (task pool worker or, on pool overflow, the submitting
/// thread); delivers its verdict through the engine's write-once cell.
pub struct HandshakeTask {
    claim: PeerClaim,
    expected_static: [u8; 32],
    trust: Arc<dyn TrustProvider>,
    verdict: Arc<OnceLock<TaskVerdict>>,
}

impl HandshakeTask {
    pub(crate) fn new(
        claim: PeerClaim,
        expected_static: [u8; 32],
        trust: Arc<dyn TrustProvider>,
        verdict: Arc<OnceLock<TaskVerdict>>,
    ) -> Self {
        Self {
            claim,
            expected_static,
            trust,
            verdict,
        }
    }

    /// Verify the claim, evaluate the trust policy, and publish the verdict.
    pub fn run(self) {
        let verdict = match self.claim.verify(&self.expected_static) {
            Ok(peer) => match self.trust.evaluate(&peer) {
                Ok(()) => {
                    debug!(peer = %peer, "handshake task accepted peer");
                    TaskVerdict::Accepted(peer)
                }
                Err(err) => TaskVerdict::Rejected(err.to_string()),
            },
            Err(err) => TaskVerdict::Rejected(err.to_string()),
        };
        // A second write can only happen if the same task ran twice; the
        // first verdict stands.
        let _ = self.verdict.set(verdict);
    }
}

impl std::fmt::Debug for HandshakeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeTask")
            .field("claimed_identity", &hex::encode(&self.claim.identity_key()[..4]))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn verified(identity: &Identity) -> VerifiedPeer {
        identity.claim().verify(identity.noise_public()).unwrap()
    }

    #[test]
    fn test_trust_any_accepts() {
        let identity = Identity::generate().unwrap();
        assert!(TrustAnyVerified.evaluate(&verified(&identity)).is_ok());
    }

    #[test]
    fn test_pinned_rejects_unknown() {
        let identity = Identity::generate().unwrap();
        let pins = PinnedIdentities::new();
        assert!(matches!(
            pins.evaluate(&verified(&identity)),
            Err(TrustError::UnknownIdentity { .. })
        ));
    }

    #[test]
    fn test_pinned_accepts_pinned() {
        let identity = Identity::generate().unwrap();
        let mut pins = PinnedIdentities::new();
        pins.pin(identity.verifying_key());
        assert_eq!(pins.len(), 1);
        assert!(pins.evaluate(&verified(&identity)).is_ok());
    }

    #[test]
    fn test_task_publishes_accepted_verdict() {
        let identity = Identity::generate().unwrap();
        let cell = Arc::new(OnceLock::new());
        let task = HandshakeTask::new(
            identity.claim(),
            *identity.noise_public(),
            Arc::new(TrustAnyVerified),
            cell.clone(),
        );
        task.run();
        assert!(matches!(cell.get(), Some(TaskVerdict::Accepted(_))));
    }

    #[test]
    fn test_task_publishes_rejection_on_bad_static() {
        let identity = Identity::generate().unwrap();
        let other = Identity::generate().unwrap();
        let cell = Arc::new(OnceLock::new());
        let task = HandshakeTask::new(
            identity.claim(),
            *other.noise_public(),
            Arc::new(TrustAnyVerified),
            cell.clone(),
        );
        task.run();
        assert!(matches!(cell.get(), Some(TaskVerdict::Rejected(_))));
    }

    #[test]
    fn test_task_publishes_policy_rejection() {
        let identity = Identity::generate().unwrap();
        let cell = Arc::new(OnceLock::new());
        let task = HandshakeTask::new(
            identity.claim(),
            *identity.noise_public(),
            Arc::new(PinnedIdentities::new()),
            cell.clone(),
        );
        task.run();
        match cell.get() {
            Some(TaskVerdict::Rejected(reason)) => assert!(reason.contains("not trusted")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
