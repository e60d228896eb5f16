//! Key material of a single pairing attempt.

use super::{
    toolbox::{self, Key},
    Role,
};
use crate::ecdh::{self, EcdhProvider, PublicKey, SecretKey, SharedSecret};
use core::fmt;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Errors raised by [`CryptoSession`].
///
/// `KeyMaterialMissing` and `SharedSecretAlreadyComputed` indicate a bug in the caller.
/// `InvalidPublicKey` and the two verification failures are protocol failures of the peer. `Rng`
/// is fatal.
///
/// [`CryptoSession`]: struct.CryptoSession.html
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A derivation was requested before its inputs were available.
    KeyMaterialMissing(&'static str),
    /// The shared secret was already computed. Call `reset` to start over.
    SharedSecretAlreadyComputed,
    /// The peer's public key is not a valid P-256 point.
    InvalidPublicKey,
    /// The peer's confirm value does not match its nonce.
    ConfirmationMismatch,
    /// The peer's DHKey check value is wrong.
    DhKeyCheckFailed,
    /// The random number generator failed.
    Rng,
}

impl SessionError {
    /// Returns whether this error must abort the whole relay instead of one pairing.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Rng
            | SessionError::KeyMaterialMissing(_)
            | SessionError::SharedSecretAlreadyComputed => true,
            _ => false,
        }
    }
}

impl From<ecdh::InvalidPublicKey> for SessionError {
    fn from(_: ecdh::InvalidPublicKey) -> Self {
        SessionError::InvalidPublicKey
    }
}

impl From<ecdh::RngFailure> for SessionError {
    fn from(_: ecdh::RngFailure) -> Self {
        SessionError::Rng
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::KeyMaterialMissing(what) => write!(f, "{} not available yet", what),
            SessionError::SharedSecretAlreadyComputed => {
                f.write_str("shared secret already computed for this session")
            }
            SessionError::InvalidPublicKey => f.write_str("invalid public key"),
            SessionError::ConfirmationMismatch => f.write_str("confirm value mismatch"),
            SessionError::DhKeyCheckFailed => f.write_str("DHKey check failed"),
            SessionError::Rng => f.write_str("random number generation failed"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One side's ECDH key pair, shared secret, nonces and derived keys.
///
/// A session belongs to exactly one pairing state machine. Secrets are wiped when the session is
/// dropped or reset.
pub struct CryptoSession<E: EcdhProvider> {
    provider: E,
    secret: Option<E::SecretKey>,
    local_key: PublicKey,
    /// The key sent to the peer. Differs from `local_key` only when reflecting.
    presented_key: PublicKey,
    remote_key: Option<PublicKey>,
    shared_secret: Option<SharedSecret>,
    local_nonce: Option<[u8; 16]>,
    remote_nonce: Option<[u8; 16]>,
    mac_key: Option<Key>,
    ltk: Option<Key>,
}

impl<E: EcdhProvider> CryptoSession<E> {
    /// Creates a session with a fresh key pair.
    pub fn new<R>(mut provider: E, rng: &mut R) -> Result<Self, SessionError>
    where
        R: RngCore + CryptoRng,
    {
        let (secret, local_key) = provider.generate_keypair(rng)?;
        Ok(Self {
            provider,
            secret: Some(secret),
            local_key,
            presented_key: local_key,
            remote_key: None,
            shared_secret: None,
            local_nonce: None,
            remote_nonce: None,
            mac_key: None,
            ltk: None,
        })
    }

    /// Discards all key material and generates a new key pair.
    pub fn reset<R>(&mut self, rng: &mut R) -> Result<(), SessionError>
    where
        R: RngCore + CryptoRng,
    {
        self.wipe();
        let (secret, local_key) = self.provider.generate_keypair(rng)?;
        self.secret = Some(secret);
        self.local_key = local_key;
        self.presented_key = local_key;
        Ok(())
    }

    /// Discards all secret material, including the private key.
    ///
    /// The session can't be used for pairing again until `reset` is called.
    pub fn clear(&mut self) {
        self.wipe();
    }

    fn wipe(&mut self) {
        self.secret = None;
        self.remote_key = None;
        self.shared_secret = None;
        if let Some(nonce) = &mut self.local_nonce {
            nonce.zeroize();
        }
        self.local_nonce = None;
        self.remote_nonce = None;
        self.mac_key = None;
        self.ltk = None;
    }

    /// Returns the public key to send to the peer.
    pub fn local_public_key(&self) -> &PublicKey {
        &self.presented_key
    }

    /// Presents `key` to the peer instead of the generated key.
    ///
    /// All confirm values are then computed with `key`. The shared secret still uses the
    /// generated private key, so the DHKey check can't succeed.
    pub fn present_public_key(&mut self, key: PublicKey) {
        self.presented_key = key;
    }

    /// Returns the peer's public key, if received.
    pub fn remote_public_key(&self) -> Option<&PublicKey> {
        self.remote_key.as_ref()
    }

    /// Performs ECDH with the peer's public key and stores the shared secret.
    ///
    /// A session computes its shared secret once. A second call fails with
    /// `SharedSecretAlreadyComputed` instead of silently reusing old material.
    pub fn compute_shared_secret(&mut self, remote: PublicKey) -> Result<(), SessionError> {
        if self.shared_secret.is_some() {
            return Err(SessionError::SharedSecretAlreadyComputed);
        }
        let secret = self
            .secret
            .take()
            .ok_or(SessionError::KeyMaterialMissing("local key pair"))?;

        // The private key is single-use, so it is gone even if the peer's key is bad.
        let shared = secret.agree(&remote)?;
        self.remote_key = Some(remote);
        self.shared_secret = Some(shared);
        Ok(())
    }

    /// Returns whether the shared secret has been computed.
    pub fn has_shared_secret(&self) -> bool {
        self.shared_secret.is_some()
    }

    /// Generates and stores a fresh local nonce.
    pub fn generate_nonce<R>(&mut self, rng: &mut R) -> Result<[u8; 16], SessionError>
    where
        R: RngCore + CryptoRng,
    {
        let mut nonce = [0; 16];
        rng.try_fill_bytes(&mut nonce)
            .map_err(|_| SessionError::Rng)?;
        self.local_nonce = Some(nonce);
        Ok(nonce)
    }

    /// Uses `nonce` as the local nonce.
    pub fn set_local_nonce(&mut self, nonce: [u8; 16]) {
        self.local_nonce = Some(nonce);
    }

    /// Stores the nonce revealed by the peer.
    pub fn set_remote_nonce(&mut self, nonce: [u8; 16]) {
        self.remote_nonce = Some(nonce);
    }

    pub fn local_nonce(&self) -> Result<[u8; 16], SessionError> {
        self.local_nonce
            .ok_or(SessionError::KeyMaterialMissing("local nonce"))
    }

    pub fn remote_nonce(&self) -> Result<[u8; 16], SessionError> {
        self.remote_nonce
            .ok_or(SessionError::KeyMaterialMissing("remote nonce"))
    }

    fn remote_x(&self) -> Result<[u8; 32], SessionError> {
        self.remote_key
            .as_ref()
            .map(PublicKey::x)
            .ok_or(SessionError::KeyMaterialMissing("remote public key"))
    }

    /// Computes the local confirm value `f4(PKlocal, PKpeer, Nlocal, z)`.
    pub fn confirm_value(&self, z: u8) -> Result<[u8; 16], SessionError> {
        Ok(toolbox::f4(
            &self.presented_key.x(),
            &self.remote_x()?,
            &self.local_nonce()?,
            z,
        ))
    }

    /// Checks the peer's confirm value against its revealed nonce.
    pub fn verify_confirm(&self, confirm: &[u8; 16], z: u8) -> Result<(), SessionError> {
        let expected = toolbox::f4(
            &self.remote_x()?,
            &self.presented_key.x(),
            &self.remote_nonce()?,
            z,
        );
        if toolbox::values_match(&expected, confirm) {
            Ok(())
        } else {
            Err(SessionError::ConfirmationMismatch)
        }
    }

    /// Returns the initiator and responder nonces, in that order.
    fn nonces(&self, role: Role) -> Result<([u8; 16], [u8; 16]), SessionError> {
        let (local, remote) = (self.local_nonce()?, self.remote_nonce()?);
        Ok(match role {
            Role::Initiator => (local, remote),
            Role::Responder => (remote, local),
        })
    }

    /// Derives MacKey and LTK with `f5`.
    ///
    /// `a1` and `a2` are the initiator and responder addresses. Keys are derived once; later calls
    /// leave them unchanged.
    pub fn derive_keys(&mut self, role: Role, a1: &[u8; 7], a2: &[u8; 7]) -> Result<(), SessionError> {
        if self.ltk.is_some() {
            return Ok(());
        }
        let (n1, n2) = self.nonces(role)?;
        let dhkey = self
            .shared_secret
            .as_ref()
            .ok_or(SessionError::KeyMaterialMissing("shared secret"))?;

        let (mac_key, ltk) = toolbox::f5(&dhkey.0, &n1, &n2, a1, a2);
        self.mac_key = Some(mac_key);
        self.ltk = Some(ltk);
        Ok(())
    }

    fn mac_key(&self) -> Result<&Key, SessionError> {
        self.mac_key
            .as_ref()
            .ok_or(SessionError::KeyMaterialMissing("MacKey"))
    }

    /// Computes the local DHKey check value.
    ///
    /// `Ea = f6(MacKey, Na, Nb, rb, IOcapA, A, B)` for the initiator, and symmetrically `Eb` for
    /// the responder.
    pub fn dhkey_check(
        &self,
        r: &[u8; 16],
        local_iocap: &[u8; 3],
        local_addr: &[u8; 7],
        remote_addr: &[u8; 7],
    ) -> Result<[u8; 16], SessionError> {
        Ok(toolbox::f6(
            &self.mac_key()?.0,
            &self.local_nonce()?,
            &self.remote_nonce()?,
            r,
            local_iocap,
            local_addr,
            remote_addr,
        ))
    }

    /// Verifies the DHKey check value received from the peer.
    pub fn verify_dhkey_check(
        &self,
        check: &[u8; 16],
        r: &[u8; 16],
        remote_iocap: &[u8; 3],
        remote_addr: &[u8; 7],
        local_addr: &[u8; 7],
    ) -> Result<(), SessionError> {
        let expected = toolbox::f6(
            &self.mac_key()?.0,
            &self.remote_nonce()?,
            &self.local_nonce()?,
            r,
            remote_iocap,
            remote_addr,
            local_addr,
        );
        if toolbox::values_match(&expected, check) {
            Ok(())
        } else {
            Err(SessionError::DhKeyCheckFailed)
        }
    }

    /// Computes the 6-digit Numeric Comparison value.
    ///
    /// Both sides feed the initiator's values first, so both arrive at the same number.
    pub fn numeric_value(&self, role: Role) -> Result<u32, SessionError> {
        let (local, remote) = (self.presented_key.x(), self.remote_x()?);
        let (na, nb) = self.nonces(role)?;
        let value = match role {
            Role::Initiator => toolbox::g2(&local, &remote, &na, &nb),
            Role::Responder => toolbox::g2(&remote, &local, &na, &nb),
        };
        Ok(value % 1_000_000)
    }

    /// Returns the derived LTK.
    pub fn ltk(&self) -> Result<&Key, SessionError> {
        self.ltk
            .as_ref()
            .ok_or(SessionError::KeyMaterialMissing("LTK"))
    }
}

impl<E: EcdhProvider> Drop for CryptoSession<E> {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl<E: EcdhProvider> fmt::Debug for CryptoSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("local_key", &self.local_key)
            .field("presented_key", &self.presented_key)
            .field("remote_key", &self.remote_key)
            .field("shared_secret", &self.shared_secret.is_some())
            .field("ltk", &self.ltk.is_some())
            .finish()
    }
}
