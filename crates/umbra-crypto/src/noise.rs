//! Noise-backed session engine with a hand-rolled record layer.
//!
//! Wire format below the frame codec, one record per engine call:
//!
//! ```text
//! [len: u16 BE][type: u8][body: len bytes]
//!
//! type 0x01 HANDSHAKE   body = one Noise handshake message
//! type 0x02 DATA        body = one Noise transport message (payload + tag)
//! type 0x03 CLOSE       body = one Noise transport message (empty + tag)
//! ```
//!
//! The pattern is `Noise_XX_25519_ChaChaPoly_BLAKE2s`: three handshake
//! messages, mutual static-key authentication, static keys hidden from
//! passive observers. The handshake message that reveals a side's static key
//! (message 2 for the responder, message 3 for the initiator) carries that
//! side's [`PeerClaim`] as its payload; when the peer's claim arrives the
//! engine emits a [`HandshakeTask`] and reports `AwaitingTask` until the
//! verdict lands.
//!
//! Capacity discipline: every call pre-checks the destination before touching
//! the Noise state, so `OutputTooSmall` and `InputIncomplete` never consume
//! input and a retry after growth is always safe.

use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

use umbra_wire::ByteBuffer;

use crate::engine::{EngineResult, EngineStatus, HandshakeStatus, Role, SessionEngine};
use crate::error::EngineError;
use crate::identity::{CLAIM_LEN, Identity, PeerClaim, VerifiedPeer};
use crate::trust::{HandshakeTask, TaskVerdict, TrustProvider};

/// Noise pattern every Umbra session uses.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Record header: length (u16 BE) plus type byte.
pub const RECORD_HEADER_LEN: usize = 3;

/// Largest record body: the Noise message size bound.
pub const MAX_RECORD_BODY: usize = 65535;

/// AEAD tag appended to every transport-mode Noise message.
const NOISE_TAG_LEN: usize = 16;

/// Largest plaintext one DATA record can carry.
pub const MAX_RECORD_PLAINTEXT: usize = MAX_RECORD_BODY - NOISE_TAG_LEN;

/// Body bound for XX handshake messages: two public keys, the claim payload,
/// and two AEAD tags. Actual messages are smaller; this is the pre-check
/// ceiling so a write never fails for space mid-handshake.
const MAX_HANDSHAKE_BODY: usize = 32 + 32 + CLAIM_LEN + 2 * NOISE_TAG_LEN;

const REC_HANDSHAKE: u8 = 0x01;
const REC_DATA: u8 = 0x02;
const REC_CLOSE: u8 = 0x03;

enum SessionState {
    Handshake(Box<snow::HandshakeState>),
    Transport(snow::TransportState),
    // Transitional placeholder; observable only if promotion itself failed.
    Poisoned,
}

/// [`SessionEngine`] implementation over `snow`.
///
/// Owns no I/O: ciphertext and plaintext move through the caller's buffers.
/// See the module docs for the record layer and handshake payloads.
pub struct NoiseEngine {
    role: Role,
    state: SessionState,
    local_claim: [u8; CLAIM_LEN],
    trust: Arc<dyn TrustProvider>,
    pending_task: Option<HandshakeTask>,
    verdict: Option<Arc<OnceLock<TaskVerdict>>>,
    handshake_writes: u8,
    close_requested: bool,
    outbound_done: bool,
    inbound_done: bool,
    failed: bool,
    timed_out: bool,
    record_hint: usize,
    plaintext_hint: usize,
}

impl NoiseEngine {
    /// Build an engine for one session.
    ///
    /// # Errors
    ///
    /// Fails when the Noise pattern or key material is rejected by `snow`.
    pub fn new(
        role: Role,
        identity: &Identity,
        trust: Arc<dyn TrustProvider>,
    ) -> Result<Self, EngineError> {
        let builder = snow::Builder::new(NOISE_PATTERN.parse().map_err(EngineError::Noise)?)
            .local_private_key(identity.noise_private())?;
        let handshake = match role {
            Role::Initiator => builder.build_initiator()?,
            Role::Responder => builder.build_responder()?,
        };
        debug!(role = role.label(), "session engine created");
        Ok(Self {
            role,
            state: SessionState::Handshake(Box::new(handshake)),
            local_claim: identity.claim().encode(),
            trust,
            pending_task: None,
            verdict: None,
            handshake_writes: 0,
            close_requested: false,
            outbound_done: false,
            inbound_done: false,
            failed: false,
            timed_out: false,
            record_hint: RECORD_HEADER_LEN + MAX_HANDSHAKE_BODY,
            plaintext_hint: MAX_HANDSHAKE_BODY,
        })
    }

    fn fail(&mut self, err: EngineError) -> EngineError {
        self.failed = true;
        err
    }

    /// Terminal gate shared by `encrypt` and `decrypt`.
    fn check_usable(&self) -> Result<(), EngineError> {
        if self.timed_out {
            return Err(EngineError::Terminal("handshake timed out".into()));
        }
        if self.failed {
            return Err(EngineError::Terminal("session failed".into()));
        }
        if self.verdict_rejected() {
            return Err(EngineError::Terminal("peer identity rejected".into()));
        }
        if self.inbound_done && self.outbound_done {
            return Err(EngineError::Terminal("session closed".into()));
        }
        Ok(())
    }

    fn verdict_rejected(&self) -> bool {
        matches!(
            self.verdict.as_ref().and_then(|cell| cell.get()),
            Some(TaskVerdict::Rejected(_))
        )
    }

    fn verdict_accepted(&self) -> bool {
        matches!(
            self.verdict.as_ref().and_then(|cell| cell.get()),
            Some(TaskVerdict::Accepted(_))
        )
    }

    /// Move a finished, trust-accepted handshake into transport mode.
    fn promote(&mut self) -> Result<(), EngineError> {
        let ready = matches!(&self.state, SessionState::Handshake(hs)
            if hs.is_handshake_finished())
            && self.verdict_accepted();
        if !ready {
            return Ok(());
        }
        match std::mem::replace(&mut self.state, SessionState::Poisoned) {
            SessionState::Handshake(hs) => match hs.into_transport_mode() {
                Ok(transport) => {
                    debug!(role = self.role.label(), "session established");
                    self.state = SessionState::Transport(transport);
                    Ok(())
                }
                Err(err) => Err(self.fail(EngineError::Noise(err))),
            },
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    /// Whether the next handshake write reveals our static key and must
    /// carry the claim. XX: the initiator's first message carries neither.
    fn next_write_carries_claim(&self) -> bool {
        !(self.role == Role::Initiator && self.handshake_writes == 0)
    }

    fn handshake_encrypt(&mut self, dst: &mut ByteBuffer) -> Result<EngineResult, EngineError> {
        if self.awaiting_verdict() {
            return Err(EngineError::TaskPending);
        }
        let needed = RECORD_HEADER_LEN + MAX_HANDSHAKE_BODY;
        if dst.remaining() < needed {
            self.record_hint = needed;
            return Ok(EngineResult::new(EngineStatus::OutputTooSmall, 0, 0));
        }

        let carries_claim = self.next_write_carries_claim();
        let SessionState::Handshake(hs) = &mut self.state else {
            return Err(EngineError::Terminal("not handshaking".into()));
        };
        let payload: &[u8] = if carries_claim { &self.local_claim } else { &[] };
        let mut body = [0u8; MAX_HANDSHAKE_BODY];
        let n = match hs.write_message(payload, &mut body) {
            Ok(n) => n,
            Err(err) => return Err(self.fail(EngineError::Noise(err))),
        };
        self.handshake_writes += 1;

        put_record(dst, REC_HANDSHAKE, &body[..n])?;
        trace!(
            role = self.role.label(),
            len = n,
            claim = carries_claim,
            "handshake record produced"
        );
        Ok(EngineResult::new(
            EngineStatus::Success,
            0,
            RECORD_HEADER_LEN + n,
        ))
    }

    fn handshake_decrypt(
        &mut self,
        src: &mut ByteBuffer,
        _dst: &mut ByteBuffer,
    ) -> Result<EngineResult, EngineError> {
        if self.awaiting_verdict() {
            return Err(EngineError::TaskPending);
        }
        let Some((rec_type, body_len)) = parse_header(src.unread()) else {
            return Ok(EngineResult::new(EngineStatus::InputIncomplete, 0, 0));
        };
        let total = RECORD_HEADER_LEN + body_len;
        if src.remaining() < total {
            self.record_hint = self.record_hint.max(total);
            return Ok(EngineResult::new(EngineStatus::InputIncomplete, 0, 0));
        }
        if rec_type != REC_HANDSHAKE {
            return Err(self.fail(EngineError::UnexpectedRecord {
                actual: rec_type,
                phase: "handshake",
            }));
        }

        let SessionState::Handshake(hs) = &mut self.state else {
            return Err(EngineError::Terminal("not handshaking".into()));
        };
        let mut payload = [0u8; MAX_HANDSHAKE_BODY];
        let body = &src.unread()[RECORD_HEADER_LEN..total];
        let n = match hs.read_message(body, &mut payload) {
            Ok(n) => n,
            Err(err) => return Err(self.fail(EngineError::Noise(err))),
        };
        let remote_static = hs.get_remote_static().map(|key| {
            let mut out = [0u8; 32];
            out.copy_from_slice(key);
            out
        });
        src.advance(total)?;

        if self.verdict.is_none() {
            if let Some(expected_static) = remote_static {
                // The message that revealed the static key must carry a claim.
                if n != CLAIM_LEN {
                    return Err(self.fail(EngineError::MissingClaim));
                }
                let claim = match PeerClaim::decode(&payload[..n]) {
                    Ok(claim) => claim,
                    Err(err) => return Err(self.fail(EngineError::Claim(err))),
                };
                let cell = Arc::new(OnceLock::new());
                self.pending_task = Some(HandshakeTask::new(
                    claim,
                    expected_static,
                    Arc::clone(&self.trust),
                    Arc::clone(&cell),
                ));
                self.verdict = Some(cell);
                debug!(role = self.role.label(), "peer claim received, validation delegated");
            } else if n != 0 {
                return Err(self.fail(EngineError::UnexpectedPayload));
            }
        }

        Ok(EngineResult::new(EngineStatus::Success, total, 0))
    }

    fn awaiting_verdict(&self) -> bool {
        self.verdict
            .as_ref()
            .is_some_and(|cell| cell.get().is_none())
    }

    fn transport_encrypt(
        &mut self,
        src: &mut ByteBuffer,
        dst: &mut ByteBuffer,
    ) -> Result<EngineResult, EngineError> {
        let SessionState::Transport(transport) = &mut self.state else {
            return Err(EngineError::Terminal("not established".into()));
        };

        if self.close_requested && !self.outbound_done {
            let needed = RECORD_HEADER_LEN + NOISE_TAG_LEN;
            if dst.remaining() < needed {
                self.record_hint = self.record_hint.max(needed);
                return Ok(EngineResult::new(EngineStatus::OutputTooSmall, 0, 0));
            }
            let mut body = [0u8; 2 * NOISE_TAG_LEN];
            let n = match transport.write_message(&[], &mut body) {
                Ok(n) => n,
                Err(err) => return Err(self.fail(EngineError::Noise(err))),
            };
            put_record(dst, REC_CLOSE, &body[..n])?;
            self.outbound_done = true;
            debug!(role = self.role.label(), "close record produced");
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                0,
                RECORD_HEADER_LEN + n,
            ));
        }

        let take = src.remaining().min(MAX_RECORD_PLAINTEXT);
        if take == 0 {
            return Ok(EngineResult::new(EngineStatus::Success, 0, 0));
        }
        let needed = RECORD_HEADER_LEN + take + NOISE_TAG_LEN;
        if dst.remaining() < needed {
            self.record_hint = self.record_hint.max(needed);
            return Ok(EngineResult::new(EngineStatus::OutputTooSmall, 0, 0));
        }
        let mut body = vec![0u8; take + NOISE_TAG_LEN];
        let n = match transport.write_message(&src.unread()[..take], &mut body) {
            Ok(n) => n,
            Err(err) => return Err(self.fail(EngineError::Noise(err))),
        };
        put_record(dst, REC_DATA, &body[..n])?;
        src.advance(take)?;
        Ok(EngineResult::new(
            EngineStatus::Success,
            take,
            RECORD_HEADER_LEN + n,
        ))
    }

    fn transport_decrypt(
        &mut self,
        src: &mut ByteBuffer,
        dst: &mut ByteBuffer,
    ) -> Result<EngineResult, EngineError> {
        let Some((rec_type, body_len)) = parse_header(src.unread()) else {
            return Ok(EngineResult::new(EngineStatus::InputIncomplete, 0, 0));
        };
        let total = RECORD_HEADER_LEN + body_len;
        if src.remaining() < total {
            self.record_hint = self.record_hint.max(total);
            return Ok(EngineResult::new(EngineStatus::InputIncomplete, 0, 0));
        }

        match rec_type {
            REC_DATA => {
                // Conservative: plaintext is at most body minus the tag.
                // Checked before the Noise call because a nonce, once used,
                // cannot be rewound.
                let upper = body_len.saturating_sub(NOISE_TAG_LEN);
                if dst.remaining() < upper {
                    self.plaintext_hint = self.plaintext_hint.max(upper);
                    return Ok(EngineResult::new(EngineStatus::OutputTooSmall, 0, 0));
                }
                let SessionState::Transport(transport) = &mut self.state else {
                    return Err(EngineError::Terminal("not established".into()));
                };
                let mut plain = vec![0u8; body_len];
                let body = &src.unread()[RECORD_HEADER_LEN..total];
                let n = match transport.read_message(body, &mut plain) {
                    Ok(n) => n,
                    Err(err) => return Err(self.fail(EngineError::Noise(err))),
                };
                dst.put(&plain[..n])?;
                src.advance(total)?;
                Ok(EngineResult::new(EngineStatus::Success, total, n))
            }
            REC_CLOSE => {
                let SessionState::Transport(transport) = &mut self.state else {
                    return Err(EngineError::Terminal("not established".into()));
                };
                let mut plain = vec![0u8; body_len.max(NOISE_TAG_LEN)];
                let body = &src.unread()[RECORD_HEADER_LEN..total];
                if let Err(err) = transport.read_message(body, &mut plain) {
                    return Err(self.fail(EngineError::Noise(err)));
                }
                src.advance(total)?;
                self.inbound_done = true;
                // A peer-initiated close obligates a response close.
                self.close_requested = true;
                debug!(role = self.role.label(), "close record consumed");
                Ok(EngineResult::new(EngineStatus::Closed, total, 0))
            }
            REC_HANDSHAKE => Err(self.fail(EngineError::UnexpectedRecord {
                actual: rec_type,
                phase: "transport",
            })),
            other => Err(self.fail(EngineError::UnknownRecord(other))),
        }
    }
}

impl SessionEngine for NoiseEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.timed_out {
            return HandshakeStatus::TimedOut;
        }
        if self.failed || self.verdict_rejected() {
            return HandshakeStatus::Failed;
        }
        match &self.state {
            SessionState::Handshake(hs) => {
                if self.awaiting_verdict() {
                    return HandshakeStatus::AwaitingTask;
                }
                if hs.is_handshake_finished() {
                    HandshakeStatus::Complete
                } else if hs.is_my_turn() {
                    HandshakeStatus::AwaitingEncrypt
                } else {
                    HandshakeStatus::AwaitingDecrypt
                }
            }
            SessionState::Transport(_) => {
                if !self.close_requested && !self.inbound_done {
                    // Steady state: established, no close in progress.
                    HandshakeStatus::Complete
                } else if !self.outbound_done {
                    HandshakeStatus::AwaitingEncrypt
                } else if !self.inbound_done {
                    HandshakeStatus::AwaitingDecrypt
                } else {
                    HandshakeStatus::Complete
                }
            }
            SessionState::Poisoned => HandshakeStatus::Failed,
        }
    }

    fn encrypt(
        &mut self,
        src: &mut ByteBuffer,
        dst: &mut ByteBuffer,
    ) -> Result<EngineResult, EngineError> {
        self.check_usable()?;
        self.promote()?;
        match self.state {
            SessionState::Handshake(_) => self.handshake_encrypt(dst),
            SessionState::Transport(_) => self.transport_encrypt(src, dst),
            SessionState::Poisoned => Err(EngineError::Terminal("engine poisoned".into())),
        }
    }

    fn decrypt(
        &mut self,
        src: &mut ByteBuffer,
        dst: &mut ByteBuffer,
    ) -> Result<EngineResult, EngineError> {
        self.check_usable()?;
        self.promote()?;
        match self.state {
            SessionState::Handshake(_) => self.handshake_decrypt(src, dst),
            SessionState::Transport(_) => self.transport_decrypt(src, dst),
            SessionState::Poisoned => Err(EngineError::Terminal("engine poisoned".into())),
        }
    }

    fn take_task(&mut self) -> Option<HandshakeTask> {
        self.pending_task.take()
    }

    fn close_outbound(&mut self) {
        match self.state {
            SessionState::Transport(_) => self.close_requested = true,
            // No clean close exists mid-handshake.
            _ => self.failed = true,
        }
    }

    fn on_peer_eof(&mut self) {
        match self.state {
            SessionState::Transport(_) => {
                self.inbound_done = true;
                if !self.outbound_done {
                    self.close_requested = true;
                }
            }
            _ => self.failed = true,
        }
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn record_capacity_hint(&self) -> usize {
        self.record_hint
    }

    fn plaintext_capacity_hint(&self) -> usize {
        self.plaintext_hint
    }

    fn peer(&self) -> Option<&VerifiedPeer> {
        match self.verdict.as_ref()?.get()? {
            TaskVerdict::Accepted(peer) => Some(peer),
            TaskVerdict::Rejected(_) => None,
        }
    }

    fn mark_timed_out(&mut self) {
        self.timed_out = true;
    }
}

impl std::fmt::Debug for NoiseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseEngine")
            .field("role", &self.role)
            .field("status", &self.handshake_status())
            .field("outbound_done", &self.outbound_done)
            .field("inbound_done", &self.inbound_done)
            .finish_non_exhaustive()
    }
}

fn parse_header(bytes: &[u8]) -> Option<(u8, usize)> {
    if bytes.len() < RECORD_HEADER_LEN {
        return None;
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    Some((bytes[2], len))
}

fn put_record(dst: &mut ByteBuffer, rec_type: u8, body: &[u8]) -> Result<(), EngineError> {
    debug_assert!(body.len() <= MAX_RECORD_BODY);
    let len = u16::try_from(body.len()).unwrap_or(u16::MAX);
    dst.put(&len.to_be_bytes())?;
    dst.put(&[rec_type])?;
    dst.put(body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{PinnedIdentities, TrustAnyVerified};

    const ITERATION_CAP: usize = 64;

    fn engine(role: Role, identity: &Identity) -> NoiseEngine {
        NoiseEngine::new(role, identity, Arc::new(TrustAnyVerified)).unwrap()
    }

    fn buf() -> ByteBuffer {
        ByteBuffer::with_capacity(4096)
    }

    /// Shuttle records between two engines, running tasks inline, until both
    /// report `Complete` or a failure. Returns the iteration count.
    fn drive(a: &mut NoiseEngine, b: &mut NoiseEngine) -> Result<usize, EngineError> {
        let mut a_inbox: Vec<u8> = Vec::new();
        let mut b_inbox: Vec<u8> = Vec::new();
        for iter in 0..ITERATION_CAP {
            if a.handshake_status() == HandshakeStatus::Complete
                && b.handshake_status() == HandshakeStatus::Complete
            {
                return Ok(iter);
            }
            step(a, &mut a_inbox, &mut b_inbox)?;
            step(b, &mut b_inbox, &mut a_inbox)?;
        }
        panic!("handshake did not terminate within {ITERATION_CAP} iterations");
    }

    fn step(
        engine: &mut NoiseEngine,
        inbox: &mut Vec<u8>,
        outbox: &mut Vec<u8>,
    ) -> Result<(), EngineError> {
        match engine.handshake_status() {
            HandshakeStatus::AwaitingEncrypt => {
                let mut src = buf();
                src.flip();
                let mut dst = buf();
                let result = engine.encrypt(&mut src, &mut dst)?;
                dst.flip();
                outbox.extend_from_slice(dst.unread());
                assert_ne!(result.status, EngineStatus::OutputTooSmall);
            }
            HandshakeStatus::AwaitingDecrypt => {
                if inbox.is_empty() {
                    return Ok(());
                }
                let mut src = ByteBuffer::with_capacity(inbox.len().max(64));
                src.put(inbox).unwrap();
                src.flip();
                let mut dst = buf();
                let result = engine.decrypt(&mut src, &mut dst)?;
                inbox.drain(..result.consumed);
            }
            HandshakeStatus::AwaitingTask => {
                if let Some(task) = engine.take_task() {
                    task.run();
                }
            }
            HandshakeStatus::Complete => {}
            status => panic!("unexpected status {status:?}"),
        }
        Ok(())
    }

    fn established_pair() -> (NoiseEngine, NoiseEngine) {
        let client_id = Identity::generate().unwrap();
        let server_id = Identity::generate().unwrap();
        let mut client = engine(Role::Initiator, &client_id);
        let mut server = engine(Role::Responder, &server_id);
        drive(&mut client, &mut server).unwrap();
        (client, server)
    }

    /// One full encrypt -> wire -> decrypt pass between established engines.
    fn relay(
        from: &mut NoiseEngine,
        to: &mut NoiseEngine,
        payload: &[u8],
    ) -> (Vec<u8>, EngineStatus) {
        let mut src = ByteBuffer::with_capacity(payload.len().max(16));
        src.put(payload).unwrap();
        src.flip();
        let mut wire = ByteBuffer::with_capacity(payload.len() + 64);
        from.encrypt(&mut src, &mut wire).unwrap();
        wire.flip();
        let mut out = ByteBuffer::with_capacity(payload.len().max(64));
        let result = to.decrypt(&mut wire, &mut out).unwrap();
        out.flip();
        (out.unread().to_vec(), result.status)
    }

    #[test]
    fn test_handshake_completes_within_bound() {
        let (client, server) = established_pair();
        assert_eq!(client.handshake_status(), HandshakeStatus::Complete);
        assert_eq!(server.handshake_status(), HandshakeStatus::Complete);
    }

    #[test]
    fn test_both_sides_learn_verified_peer() {
        let client_id = Identity::generate().unwrap();
        let server_id = Identity::generate().unwrap();
        let mut client = engine(Role::Initiator, &client_id);
        let mut server = engine(Role::Responder, &server_id);
        drive(&mut client, &mut server).unwrap();
        assert_eq!(
            client.peer().unwrap().identity_key(),
            &server_id.verifying_key()
        );
        assert_eq!(
            server.peer().unwrap().identity_key(),
            &client_id.verifying_key()
        );
    }

    #[test]
    fn test_data_roundtrip_after_handshake() {
        let (mut client, mut server) = established_pair();
        let (plain, status) = relay(&mut client, &mut server, b"AUTH alice=alicev^");
        assert_eq!(status, EngineStatus::Success);
        assert_eq!(plain, b"AUTH alice=alicev^");

        let (plain, _) = relay(&mut server, &mut client, b"AUTH_SUCCESS:alicev^");
        assert_eq!(plain, b"AUTH_SUCCESS:alicev^");
    }

    #[test]
    fn test_record_order_is_preserved() {
        let (mut client, mut server) = established_pair();
        let mut all = Vec::new();
        for chunk in [&b"one"[..], b"two", b"three"] {
            let (plain, _) = relay(&mut client, &mut server, chunk);
            all.extend_from_slice(&plain);
        }
        assert_eq!(all, b"onetwothree");
    }

    #[test]
    fn test_decrypt_partial_record_is_input_incomplete() {
        let (mut client, mut server) = established_pair();
        let mut src = ByteBuffer::with_capacity(16);
        src.put(b"hi").unwrap();
        src.flip();
        let mut wire = buf();
        client.encrypt(&mut src, &mut wire).unwrap();
        wire.flip();
        let record = wire.unread().to_vec();

        // Feed only part of the record
        let mut partial = ByteBuffer::with_capacity(64);
        partial.put(&record[..record.len() - 1]).unwrap();
        partial.flip();
        let before = partial.remaining();
        let mut out = buf();
        let result = server.decrypt(&mut partial, &mut out).unwrap();
        assert_eq!(result.status, EngineStatus::InputIncomplete);
        assert_eq!(result.consumed, 0);
        assert_eq!(partial.remaining(), before);

        // The full record still decrypts afterwards
        let mut full = ByteBuffer::with_capacity(64);
        full.put(&record).unwrap();
        full.flip();
        let result = server.decrypt(&mut full, &mut out).unwrap();
        assert_eq!(result.status, EngineStatus::Success);
    }

    #[test]
    fn test_encrypt_output_too_small_consumes_nothing() {
        let (mut client, _server) = established_pair();
        let mut src = ByteBuffer::with_capacity(64);
        src.put(b"payload that will not fit").unwrap();
        src.flip();
        let mut tiny = ByteBuffer::new(4, 4096);
        let result = client.encrypt(&mut src, &mut tiny).unwrap();
        assert_eq!(result.status, EngineStatus::OutputTooSmall);
        assert_eq!(result.consumed, 0);
        assert_eq!(src.remaining(), 25);
        assert!(client.record_capacity_hint() >= RECORD_HEADER_LEN + 25 + 16);

        // Growing to the hint makes the retry succeed
        tiny.grow(client.record_capacity_hint()).unwrap();
        let result = client.encrypt(&mut src, &mut tiny).unwrap();
        assert_eq!(result.status, EngineStatus::Success);
        assert_eq!(result.consumed, 25);
    }

    #[test]
    fn test_close_handshake_symmetric() {
        let (mut client, mut server) = established_pair();
        client.close_outbound();
        assert_eq!(client.handshake_status(), HandshakeStatus::AwaitingEncrypt);

        // Client emits its close
        let mut empty = buf();
        empty.flip();
        let mut wire = buf();
        let result = client.encrypt(&mut empty, &mut wire).unwrap();
        assert_eq!(result.status, EngineStatus::Closed);
        assert!(client.is_outbound_done());
        assert_eq!(client.handshake_status(), HandshakeStatus::AwaitingDecrypt);

        // Server consumes it and owes a response close
        wire.flip();
        let mut out = buf();
        let result = server.decrypt(&mut wire, &mut out).unwrap();
        assert_eq!(result.status, EngineStatus::Closed);
        assert!(server.is_inbound_done());
        assert_eq!(server.handshake_status(), HandshakeStatus::AwaitingEncrypt);

        // Server's response close completes both sides
        let mut empty = buf();
        empty.flip();
        let mut wire = buf();
        let result = server.encrypt(&mut empty, &mut wire).unwrap();
        assert_eq!(result.status, EngineStatus::Closed);
        assert_eq!(server.handshake_status(), HandshakeStatus::Complete);

        wire.flip();
        let result = client.decrypt(&mut wire, &mut out).unwrap();
        assert_eq!(result.status, EngineStatus::Closed);
        assert_eq!(client.handshake_status(), HandshakeStatus::Complete);
        assert!(client.is_inbound_done() && client.is_outbound_done());
    }

    #[test]
    fn test_closed_engine_is_terminal() {
        let (mut client, mut server) = established_pair();
        client.close_outbound();
        let mut empty = buf();
        empty.flip();
        let mut wire = buf();
        client.encrypt(&mut empty, &mut wire).unwrap();
        wire.flip();
        let mut out = buf();
        server.decrypt(&mut wire, &mut out).unwrap();
        let mut empty = buf();
        empty.flip();
        let mut wire = buf();
        server.encrypt(&mut empty, &mut wire).unwrap();
        wire.flip();
        client.decrypt(&mut wire, &mut out).unwrap();

        let mut src = buf();
        src.flip();
        let mut dst = buf();
        assert!(matches!(
            client.encrypt(&mut src, &mut dst),
            Err(EngineError::Terminal(_))
        ));
        assert!(matches!(
            client.decrypt(&mut src, &mut dst),
            Err(EngineError::Terminal(_))
        ));
    }

    #[test]
    fn test_timed_out_engine_is_terminal() {
        let identity = Identity::generate().unwrap();
        let mut engine = engine(Role::Initiator, &identity);
        engine.mark_timed_out();
        assert_eq!(engine.handshake_status(), HandshakeStatus::TimedOut);
        let mut src = buf();
        src.flip();
        let mut dst = buf();
        assert!(matches!(
            engine.encrypt(&mut src, &mut dst),
            Err(EngineError::Terminal(_))
        ));
    }

    #[test]
    fn test_eof_during_handshake_fails_engine() {
        let identity = Identity::generate().unwrap();
        let mut engine = engine(Role::Initiator, &identity);
        engine.on_peer_eof();
        assert_eq!(engine.handshake_status(), HandshakeStatus::Failed);
    }

    #[test]
    fn test_eof_after_establishment_forces_close() {
        let (mut client, _server) = established_pair();
        client.on_peer_eof();
        assert!(client.is_inbound_done());
        assert_eq!(client.handshake_status(), HandshakeStatus::AwaitingEncrypt);

        // The forced outbound close still goes out
        let mut empty = buf();
        empty.flip();
        let mut wire = buf();
        let result = client.encrypt(&mut empty, &mut wire).unwrap();
        assert_eq!(result.status, EngineStatus::Closed);
        assert_eq!(client.handshake_status(), HandshakeStatus::Complete);
    }

    #[test]
    fn test_trust_rejection_fails_handshake() {
        let client_id = Identity::generate().unwrap();
        let server_id = Identity::generate().unwrap();
        // Server pins nobody, so the client's identity is rejected.
        let mut client = engine(Role::Initiator, &client_id);
        let mut server = NoiseEngine::new(
            Role::Responder,
            &server_id,
            Arc::new(PinnedIdentities::new()),
        )
        .unwrap();

        let mut client_inbox: Vec<u8> = Vec::new();
        let mut server_inbox: Vec<u8> = Vec::new();
        for _ in 0..ITERATION_CAP {
            if server.handshake_status() == HandshakeStatus::Failed {
                return;
            }
            step(&mut client, &mut client_inbox, &mut server_inbox).unwrap();
            if step(&mut server, &mut server_inbox, &mut client_inbox).is_err() {
                return;
            }
        }
        panic!("trust rejection never surfaced");
    }

    #[test]
    fn test_tampered_handshake_record_fails() {
        let client_id = Identity::generate().unwrap();
        let server_id = Identity::generate().unwrap();
        let mut client = engine(Role::Initiator, &client_id);
        let mut server = engine(Role::Responder, &server_id);

        // Client's first message
        let mut empty = buf();
        empty.flip();
        let mut wire = buf();
        client.encrypt(&mut empty, &mut wire).unwrap();
        wire.flip();
        let msg1 = wire.unread().to_vec();

        // Server answers with message 2; tamper with its body
        let mut src = ByteBuffer::with_capacity(msg1.len());
        src.put(&msg1).unwrap();
        src.flip();
        let mut out = buf();
        server.decrypt(&mut src, &mut out).unwrap();
        let mut empty = buf();
        empty.flip();
        let mut wire = buf();
        server.encrypt(&mut empty, &mut wire).unwrap();
        wire.flip();
        let mut msg2 = wire.unread().to_vec();
        let last = msg2.len() - 1;
        msg2[last] ^= 0xFF;

        let mut src = ByteBuffer::with_capacity(msg2.len());
        src.put(&msg2).unwrap();
        src.flip();
        let mut dst = buf();
        assert!(matches!(
            client.decrypt(&mut src, &mut dst),
            Err(EngineError::Noise(_))
        ));
        assert_eq!(client.handshake_status(), HandshakeStatus::Failed);
    }

    #[test]
    fn test_unknown_record_type_rejected() {
        let (_client, mut server) = established_pair();
        let mut src = ByteBuffer::with_capacity(16);
        src.put(&[0x00, 0x01, 0x7F, 0xAA]).unwrap();
        src.flip();
        let mut dst = buf();
        assert!(matches!(
            server.decrypt(&mut src, &mut dst),
            Err(EngineError::UnknownRecord(0x7F))
        ));
        assert_eq!(server.handshake_status(), HandshakeStatus::Failed);
    }

    #[test]
    fn test_handshake_record_in_transport_rejected() {
        let (_client, mut server) = established_pair();
        let mut src = ByteBuffer::with_capacity(16);
        src.put(&[0x00, 0x01, REC_HANDSHAKE, 0x00]).unwrap();
        src.flip();
        let mut dst = buf();
        assert!(matches!(
            server.decrypt(&mut src, &mut dst),
            Err(EngineError::UnexpectedRecord {
                actual: REC_HANDSHAKE,
                phase: "transport"
            })
        ));
    }
}
