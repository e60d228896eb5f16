//! The per-link LE Secure Connections pairing state machine.
//!
//! The machine does no I/O. It is fed decoded [`Command`]s and Link-Layer encryption events, and
//! answers with a list of [`Action`]s for the caller to carry out: PDUs to send, encryption
//! requests, and notifications.
//!
//! ```notrust
//! Idle -> RequestExchanged -> PublicKeyExchanged -> (PasskeyRounds) -> Confirmed
//!      -> NoncesExchanged -> DhKeyChecked -> Encrypting -> (DistributingKeys) -> Complete
//! ```
//!
//! Any state but `Complete` can move to `Failed`. Protocol failures are reported as
//! `Action::Failed`; only fatal errors (RNG failure, misuse of the session) are returned as `Err`.
//!
//! [`Command`]: ../pdu/enum.Command.html
//! [`Action`]: enum.Action.html

use super::{
    method::{PairingMethod, PairingParameters, PasskeyRole, MAX_KEY_SIZE},
    passkey::{Passkey, PasskeyBitExchange, Reflector, ROUNDS},
    pdu::{Command, PairingFeatures, Reason},
    session::{CryptoSession, SessionError},
    toolbox::Key,
    AuthReq, IoCapabilities, KeyDistribution, Role,
};
use crate::{
    ecdh::{EcdhProvider, PublicKey},
    link::{DeviceAddress, LinkControl, LinkId},
};
use core::fmt;
use rand_core::{CryptoRng, RngCore};

/// Pairing progress of one link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    RequestExchanged,
    PublicKeyExchanged,
    PasskeyRounds,
    Confirmed,
    NoncesExchanged,
    DhKeyChecked,
    Encrypting,
    DistributingKeys,
    Complete,
    Failed,
}

impl State {
    /// Returns whether pairing has ended, successfully or not.
    pub fn is_terminal(self) -> bool {
        self == State::Complete || self == State::Failed
    }

    /// Returns whether both public keys have been exchanged.
    pub fn has_public_keys(self) -> bool {
        match self {
            State::Idle | State::RequestExchanged | State::Failed => false,
            _ => true,
        }
    }
}

/// Where the passkey for *Passkey Entry* comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PasskeyPolicy {
    /// Use this passkey, whether we display it or the user is supposed to type it in.
    Fixed(Passkey),
    /// Generate a random passkey if we are the displaying side. Fails pairing if we would have
    /// to input one.
    Random,
    /// Reflect the peer's commitments to learn its passkey. Responder only.
    Reflect,
    /// Bits are supplied one per round through `inject_passkey_bit`. Initiator only.
    Injected,
}

/// Identity Address and Identity Resolving Key distributed with `ID_KEY`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Identity {
    pub irk: [u8; 16],
    pub address: DeviceAddress,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish()
    }
}

/// Our side of the pairing feature exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFeatures {
    pub io: IoCapabilities,
    pub auth_req: AuthReq,
    /// Whether OOB data is claimed. There is no OOB channel, so this makes pairing fail with
    /// `OobNotAvailable` if the peer has OOB data too.
    pub oob: bool,
    pub max_key_size: u8,
    /// Keys we are willing to distribute.
    pub local_keys: KeyDistribution,
    /// Keys we ask the peer to distribute.
    pub remote_keys: KeyDistribution,
    /// Distributed for `ID_KEY`.
    pub identity: Option<Identity>,
    /// Distributed for `SIGN_KEY`.
    pub csrk: Option<[u8; 16]>,
}

impl LocalFeatures {
    /// Default features for the given IO capabilities: bonding with MITM protection, no keys
    /// offered, identity and signing keys requested.
    pub fn new(io: IoCapabilities) -> Self {
        Self {
            io,
            auth_req: AuthReq::secure_default(),
            oob: false,
            max_key_size: MAX_KEY_SIZE,
            local_keys: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
            remote_keys: KeyDistribution::ENC_KEY
                | KeyDistribution::ID_KEY
                | KeyDistribution::SIGN_KEY,
            identity: None,
            csrk: None,
        }
    }

    /// Copies the features a real central requested, so that the relay asks the real peripheral
    /// for the same thing.
    pub fn mirror(request: &PairingFeatures) -> Self {
        Self {
            io: request.io,
            auth_req: request.auth_req,
            oob: request.oob,
            max_key_size: request.max_key_size,
            local_keys: request.initiator_dist,
            remote_keys: request.responder_dist,
            identity: None,
            csrk: None,
        }
    }

    /// Returns the keys we can actually distribute.
    fn offered_keys(&self) -> KeyDistribution {
        let mut keys = KeyDistribution::ENC_KEY | KeyDistribution::LINK_KEY;
        if self.identity.is_some() {
            keys |= KeyDistribution::ID_KEY;
        }
        if self.csrk.is_some() {
            keys |= KeyDistribution::SIGN_KEY;
        }
        keys & self.local_keys
    }

    fn to_features(&self, initiator_dist: KeyDistribution, responder_dist: KeyDistribution) -> PairingFeatures {
        PairingFeatures {
            io: self.io,
            oob: self.oob,
            auth_req: self.auth_req,
            max_key_size: self.max_key_size,
            initiator_dist,
            responder_dist,
        }
    }
}

/// Keys received from the peer during key distribution.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct PeerKeys {
    pub irk: Option<[u8; 16]>,
    pub identity_address: Option<DeviceAddress>,
    pub csrk: Option<[u8; 16]>,
}

impl fmt::Debug for PeerKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerKeys")
            .field("irk", &self.irk.is_some())
            .field("identity_address", &self.identity_address)
            .field("csrk", &self.csrk.is_some())
            .finish()
    }
}

/// A pairing failure: which link, how far it got, and why.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Failure {
    pub link: LinkId,
    /// The last state reached before failing.
    pub state: State,
    pub reason: Reason,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pairing on {} link failed in state {:?}: {}",
            self.link, self.state, self.reason
        )
    }
}

/// Output of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send this command to the peer.
    Send(Command),
    /// Pass this request to the Link-Layer.
    Control(LinkControl),
    /// The machine entered a new state.
    StateChanged(State),
    /// The 6-digit Numeric Comparison value. It is confirmed automatically.
    NumericComparison(u32),
    /// The passkey to show to the user.
    PasskeyDisplay(Passkey),
    /// A passkey bit the peer committed to, learned by reflection.
    PasskeyBit { round: u8, bit: bool },
    /// The complete passkey learned by reflection.
    PasskeyRecovered(Passkey),
    /// The peer asks us to start pairing.
    SecurityRequest(AuthReq),
    /// Pairing completed successfully.
    Complete,
    /// Pairing failed.
    Failed(Failure),
}

/// Why the current command could not be processed.
enum Abort {
    /// The peer did something wrong (or we can't do what it wants). Fail this pairing.
    Protocol(Reason),
    /// Give up on the whole relay.
    Fatal(SessionError),
}

impl From<SessionError> for Abort {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::ConfirmationMismatch => Abort::Protocol(Reason::ConfirmValueFailed),
            SessionError::DhKeyCheckFailed | SessionError::InvalidPublicKey => {
                Abort::Protocol(Reason::DhKeyCheckFailed)
            }
            e => Abort::Fatal(e),
        }
    }
}

/// What we are waiting for in a Passkey Entry round.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RoundStep {
    /// Round not started. The initiator still has to send its confirm value (and may be waiting
    /// for an injected bit); the responder waits for the initiator's.
    Start,
    /// The initiator has sent its confirm value.
    AwaitConfirm,
    /// Confirm values are exchanged, waiting for the peer's nonce.
    AwaitRandom,
}

#[derive(Debug)]
enum Rounds {
    Inactive,
    Exchange {
        exchange: PasskeyBitExchange,
        step: RoundStep,
    },
    /// Reflection selected, but the peer's public key has not arrived yet.
    ReflectPending,
    Reflect(Reflector),
}

/// Drives LE Secure Connections pairing on one link.
pub struct PairingStateMachine<E: EcdhProvider, R: RngCore + CryptoRng> {
    link: LinkId,
    role: Role,
    features: LocalFeatures,
    policy: PasskeyPolicy,
    local_address: DeviceAddress,
    peer_address: DeviceAddress,
    rng: R,
    session: CryptoSession<E>,
    state: State,
    request: Option<PairingFeatures>,
    params: Option<PairingParameters>,
    public_key_sent: bool,
    remote_confirm: Option<[u8; 16]>,
    passkey: Option<Passkey>,
    rounds: Rounds,
    keys_expected: KeyDistribution,
    peer_keys: PeerKeys,
}

impl<E: EcdhProvider, R: RngCore + CryptoRng> PairingStateMachine<E, R> {
    /// Creates a machine in the `Idle` state, generating a fresh key pair.
    pub fn new(
        link: LinkId,
        role: Role,
        features: LocalFeatures,
        policy: PasskeyPolicy,
        local_address: DeviceAddress,
        peer_address: DeviceAddress,
        provider: E,
        mut rng: R,
    ) -> Result<Self, SessionError> {
        let session = CryptoSession::new(provider, &mut rng)?;
        Ok(Self {
            link,
            role,
            features,
            policy,
            local_address,
            peer_address,
            rng,
            session,
            state: State::Idle,
            request: None,
            params: None,
            public_key_sent: false,
            remote_confirm: None,
            passkey: None,
            rounds: Rounds::Inactive,
            keys_expected: KeyDistribution::empty(),
            peer_keys: PeerKeys::default(),
        })
    }

    /// Aborts the current attempt and returns to `Idle` with fresh key material.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.session.reset(&mut self.rng)?;
        self.state = State::Idle;
        self.request = None;
        self.params = None;
        self.public_key_sent = false;
        self.remote_confirm = None;
        self.passkey = None;
        self.rounds = Rounds::Inactive;
        self.keys_expected = KeyDistribution::empty();
        self.peer_keys = PeerKeys::default();
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn passkey_policy(&self) -> PasskeyPolicy {
        self.policy
    }

    /// Returns the negotiated parameters, once the feature exchange is done.
    pub fn parameters(&self) -> Option<&PairingParameters> {
        self.params.as_ref()
    }

    /// Returns the passkey in use, or the one recovered by reflection.
    pub fn passkey(&self) -> Option<Passkey> {
        self.passkey
    }

    /// Returns the current Passkey Entry round number (0 for the first round).
    pub fn passkey_round(&self) -> Option<u8> {
        match &self.rounds {
            Rounds::Exchange { exchange, .. } => exchange.round(),
            Rounds::Reflect(reflector) => reflector.round(),
            _ => None,
        }
    }

    /// Returns the LTK, once derived.
    pub fn long_term_key(&self) -> Option<&Key> {
        self.session.ltk().ok()
    }

    /// Returns the public key sent (or to be sent) to the peer.
    pub fn local_public_key(&self) -> &PublicKey {
        self.session.local_public_key()
    }

    /// Returns the keys distributed by the peer.
    pub fn peer_keys(&self) -> &PeerKeys {
        &self.peer_keys
    }

    /// Replaces the local features. Only possible before pairing started.
    pub fn set_features(&mut self, features: LocalFeatures) -> bool {
        if self.state == State::Idle {
            self.features = features;
            true
        } else {
            false
        }
    }

    /// Replaces the passkey policy. Only possible before pairing started.
    pub fn set_passkey_policy(&mut self, policy: PasskeyPolicy) -> bool {
        if self.state == State::Idle {
            self.policy = policy;
            true
        } else {
            false
        }
    }

    /// Starts pairing by sending a Pairing Request. Initiator only.
    pub fn initiate(&mut self) -> Result<Vec<Action>, SessionError> {
        let mut out = Vec::new();
        if self.role != Role::Initiator || self.state != State::Idle {
            warn!(
                [self.link] "can't initiate pairing as {:?} in {:?}", self.role, self.state
            );
            return Ok(out);
        }

        let request = self
            .features
            .to_features(self.features.offered_keys(), self.features.remote_keys);
        self.request = Some(request);
        self.send(&mut out, Command::PairingRequest(request));
        self.transition(&mut out, State::RequestExchanged);
        Ok(out)
    }

    /// Processes a command received from the peer.
    pub fn handle(&mut self, cmd: Command) -> Result<Vec<Action>, SessionError> {
        trace!([self.link] "<- {:?}", cmd);
        let mut out = Vec::new();
        let result = self.dispatch(cmd, &mut out);
        self.finish(out, result)
    }

    /// Supplies the passkey bit for `round` to an initiator using `PasskeyPolicy::Injected`.
    pub fn inject_passkey_bit(&mut self, round: u8, bit: bool) -> Result<Vec<Action>, SessionError> {
        let mut out = Vec::new();
        let accepted = match &mut self.rounds {
            Rounds::Exchange { exchange, .. } => exchange.inject(round, bit),
            _ => false,
        };
        if !accepted {
            warn!([self.link] "passkey bit for round {} not accepted", round);
            return Ok(out);
        }

        let result = if self.state == State::PasskeyRounds && self.role == Role::Initiator {
            self.start_round(&mut out)
        } else {
            Ok(())
        };
        self.finish(out, result)
    }

    /// The Link-Layer asks for the LTK because the peer started encryption.
    pub fn long_term_key_requested(&mut self) -> Result<Vec<Action>, SessionError> {
        let mut out = Vec::new();
        if self.state != State::DhKeyChecked || self.role != Role::Responder {
            warn!([self.link] "LTK requested in {:?}", self.state);
            out.push(Action::Control(LinkControl::LongTermKeyNegativeReply));
            return Ok(out);
        }

        let ltk = self.session.ltk()?.to_le_bytes();
        out.push(Action::Control(LinkControl::LongTermKeyReply { ltk }));
        self.transition(&mut out, State::Encrypting);
        Ok(out)
    }

    /// The Link-Layer reports the result of enabling encryption.
    pub fn encryption_changed(&mut self, status: u8) -> Result<Vec<Action>, SessionError> {
        let mut out = Vec::new();
        if self.state != State::Encrypting {
            warn!(
                [self.link] "encryption change (status {:#04x}) in {:?}", status, self.state
            );
            return Ok(out);
        }

        let result = if status == 0 {
            self.start_distribution(&mut out)
        } else {
            error!([self.link] "encryption failed with status {:#04x}", status);
            Err(Abort::Protocol(Reason::UnspecifiedReason))
        };
        self.finish(out, result)
    }

    fn finish(&mut self, mut out: Vec<Action>, result: Result<(), Abort>) -> Result<Vec<Action>, SessionError> {
        match result {
            Ok(()) => Ok(out),
            Err(Abort::Protocol(reason)) => {
                self.fail(&mut out, reason, true);
                Ok(out)
            }
            Err(Abort::Fatal(e)) => {
                error!([self.link] "fatal: {}", e);
                self.session.clear();
                Err(e)
            }
        }
    }

    fn dispatch(&mut self, cmd: Command, out: &mut Vec<Action>) -> Result<(), Abort> {
        if self.state.is_terminal() {
            warn!([self.link] "ignoring {:?} in {:?}", cmd.code(), self.state);
            return Ok(());
        }

        match (self.state, self.role, cmd) {
            (_, _, Command::PairingFailed(reason)) => {
                self.fail(out, reason, false);
                Ok(())
            }
            (_, _, Command::KeypressNotification(kind)) => {
                debug!([self.link] "keypress {:?}", kind);
                Ok(())
            }
            (_, _, Command::Unsupported(code)) => {
                warn!([self.link] "unsupported SMP command {:#04x}", code);
                Err(Abort::Protocol(Reason::CommandNotSupported))
            }
            (State::Idle, Role::Initiator, Command::SecurityRequest(auth_req)) => {
                out.push(Action::SecurityRequest(auth_req));
                Ok(())
            }
            (_, Role::Initiator, Command::SecurityRequest(_)) => {
                debug!([self.link] "security request while pairing, ignored");
                Ok(())
            }
            (State::Idle, Role::Responder, Command::PairingRequest(request)) => {
                self.on_pairing_request(out, request)
            }
            (State::RequestExchanged, Role::Initiator, Command::PairingResponse(response))
                if self.params.is_none() =>
            {
                self.on_pairing_response(out, response)
            }
            (State::RequestExchanged, Role::Responder, Command::PairingPublicKey(key)) => {
                self.on_responder_public_key(out, key)
            }
            (State::RequestExchanged, Role::Initiator, Command::PairingPublicKey(key))
                if self.public_key_sent =>
            {
                self.session.compute_shared_secret(key)?;
                self.transition(out, State::PublicKeyExchanged);
                self.begin_authentication(out)
            }
            (State::PasskeyRounds, _, cmd) => self.on_round_command(out, cmd),
            (State::PublicKeyExchanged, Role::Initiator, Command::PairingConfirm(confirm)) => {
                self.remote_confirm = Some(confirm);
                self.transition(out, State::Confirmed);
                let nonce = self.session.local_nonce()?;
                self.send(out, Command::PairingRandom(nonce));
                Ok(())
            }
            (State::Confirmed, Role::Responder, Command::PairingRandom(nonce)) => {
                self.session.set_remote_nonce(nonce);
                let local = self.session.local_nonce()?;
                self.send(out, Command::PairingRandom(local));
                self.transition(out, State::NoncesExchanged);
                self.numeric_comparison(out)
            }
            (State::Confirmed, Role::Initiator, Command::PairingRandom(nonce)) => {
                self.session.set_remote_nonce(nonce);
                let confirm = self.expect_remote_confirm()?;
                self.session.verify_confirm(&confirm, 0)?;
                self.transition(out, State::NoncesExchanged);
                self.numeric_comparison(out)?;
                self.send_dhkey_check(out)
            }
            (State::NoncesExchanged, Role::Responder, Command::PairingDhKeyCheck(check)) => {
                self.on_responder_dhkey_check(out, check)
            }
            (State::NoncesExchanged, Role::Initiator, Command::PairingDhKeyCheck(check)) => {
                self.on_initiator_dhkey_check(out, check)
            }
            (State::DistributingKeys, _, cmd) => self.on_key(out, cmd),
            (state, role, cmd) => {
                warn!(
                    [self.link] "unexpected {:?} as {:?} in {:?}",
                    cmd.code(),
                    role,
                    state
                );
                Err(Abort::Protocol(Reason::UnspecifiedReason))
            }
        }
    }

    fn on_pairing_request(&mut self, out: &mut Vec<Action>, request: PairingFeatures) -> Result<(), Abort> {
        let response = self.features.to_features(
            request.initiator_dist & self.features.remote_keys,
            request.responder_dist & self.features.offered_keys(),
        );
        self.negotiate(out, request, response)?;
        self.request = Some(request);
        self.send(out, Command::PairingResponse(response));
        self.transition(out, State::RequestExchanged);
        Ok(())
    }

    fn on_pairing_response(&mut self, out: &mut Vec<Action>, response: PairingFeatures) -> Result<(), Abort> {
        let request = self
            .request
            .ok_or(Abort::Fatal(SessionError::KeyMaterialMissing("pairing request")))?;
        self.negotiate(out, request, response)?;

        let key = *self.session.local_public_key();
        self.send(out, Command::PairingPublicKey(key));
        self.public_key_sent = true;
        Ok(())
    }

    fn negotiate(
        &mut self,
        out: &mut Vec<Action>,
        request: PairingFeatures,
        response: PairingFeatures,
    ) -> Result<(), Abort> {
        let (initiator, responder) = match self.role {
            Role::Initiator => (self.local_address, self.peer_address),
            Role::Responder => (self.peer_address, self.local_address),
        };
        let params = PairingParameters::negotiate(request, response, initiator, responder)
            .map_err(Abort::Protocol)?;
        debug!(
            [self.link] "method {:?}, key size {}", params.method, params.key_size
        );

        match params.method {
            PairingMethod::OutOfBand => return Err(Abort::Protocol(Reason::OobNotAvailable)),
            PairingMethod::PasskeyEntry { .. } => {
                let role = params.method.passkey_role(self.role);
                self.prepare_passkey(out, role)?;
            }
            _ => {}
        }

        self.params = Some(params);
        Ok(())
    }

    fn prepare_passkey(&mut self, out: &mut Vec<Action>, role: Option<PasskeyRole>) -> Result<(), Abort> {
        let passkey = match (self.policy, self.role) {
            (PasskeyPolicy::Fixed(passkey), _) => passkey,
            (PasskeyPolicy::Random, _) if role == Some(PasskeyRole::Display) => {
                Passkey::random(&mut self.rng).map_err(|_| Abort::Fatal(SessionError::Rng))?
            }
            (PasskeyPolicy::Reflect, Role::Responder) => {
                self.rounds = Rounds::ReflectPending;
                return Ok(());
            }
            (PasskeyPolicy::Injected, Role::Initiator) => {
                self.rounds = Rounds::Exchange {
                    exchange: PasskeyBitExchange::injected(),
                    step: RoundStep::Start,
                };
                return Ok(());
            }
            (policy, _) => {
                warn!(
                    [self.link] "no passkey available ({:?} as {:?})", policy, role
                );
                return Err(Abort::Protocol(Reason::PasskeyEntryFailed));
            }
        };

        if role == Some(PasskeyRole::Display) {
            out.push(Action::PasskeyDisplay(passkey));
        }
        self.passkey = Some(passkey);
        self.rounds = Rounds::Exchange {
            exchange: PasskeyBitExchange::new(passkey),
            step: RoundStep::Start,
        };
        Ok(())
    }

    fn on_responder_public_key(&mut self, out: &mut Vec<Action>, key: PublicKey) -> Result<(), Abort> {
        self.session.compute_shared_secret(key)?;

        if let Rounds::ReflectPending = self.rounds {
            info!([self.link] "reflecting passkey commitments");
            self.session.present_public_key(key);
            self.rounds = Rounds::Reflect(Reflector::new(key));
        }

        let local = *self.session.local_public_key();
        self.send(out, Command::PairingPublicKey(local));
        self.public_key_sent = true;
        self.transition(out, State::PublicKeyExchanged);
        self.begin_authentication(out)
    }

    fn begin_authentication(&mut self, out: &mut Vec<Action>) -> Result<(), Abort> {
        let method = self.params()?.method;
        match method {
            PairingMethod::JustWorks | PairingMethod::NumericComparison => {
                self.session.generate_nonce(&mut self.rng)?;
                if self.role == Role::Responder {
                    let confirm = self.session.confirm_value(0)?;
                    self.send(out, Command::PairingConfirm(confirm));
                    self.transition(out, State::Confirmed);
                }
                Ok(())
            }
            PairingMethod::PasskeyEntry { .. } => {
                self.transition(out, State::PasskeyRounds);
                if self.role == Role::Initiator {
                    self.start_round(out)
                } else {
                    Ok(())
                }
            }
            PairingMethod::OutOfBand => Err(Abort::Protocol(Reason::OobNotAvailable)),
        }
    }

    /// Sends the initiator's confirm value for the current round, if its bit is known.
    fn start_round(&mut self, out: &mut Vec<Action>) -> Result<(), Abort> {
        let z = match &self.rounds {
            Rounds::Exchange {
                exchange,
                step: RoundStep::Start,
            } => match exchange.current_commitment() {
                Some(z) => z,
                None => {
                    debug!(
                        [self.link] "waiting for passkey bit of round {:?}",
                        exchange.round()
                    );
                    return Ok(());
                }
            },
            _ => return Ok(()),
        };

        self.session.generate_nonce(&mut self.rng)?;
        let confirm = self.session.confirm_value(z)?;
        self.send(out, Command::PairingConfirm(confirm));
        self.set_round_step(RoundStep::AwaitConfirm);
        Ok(())
    }

    fn set_round_step(&mut self, next: RoundStep) {
        if let Rounds::Exchange { step, .. } = &mut self.rounds {
            *step = next;
        }
    }

    fn on_round_command(&mut self, out: &mut Vec<Action>, cmd: Command) -> Result<(), Abort> {
        if let Rounds::Reflect(reflector) = &mut self.rounds {
            return match cmd {
                Command::PairingConfirm(confirm) => {
                    let answer = reflector.on_confirm(confirm);
                    self.send(out, Command::PairingConfirm(answer));
                    Ok(())
                }
                Command::PairingRandom(nonce) => self.on_reflected_nonce(out, nonce),
                _ => Err(Abort::Protocol(Reason::UnspecifiedReason)),
            };
        }

        let (z, step) = match &self.rounds {
            Rounds::Exchange { exchange, step } => (exchange.current_commitment(), *step),
            _ => return Err(Abort::Protocol(Reason::UnspecifiedReason)),
        };

        match (self.role, step, cmd) {
            (Role::Initiator, RoundStep::AwaitConfirm, Command::PairingConfirm(confirm)) => {
                self.remote_confirm = Some(confirm);
                let nonce = self.session.local_nonce()?;
                self.send(out, Command::PairingRandom(nonce));
                self.set_round_step(RoundStep::AwaitRandom);
                Ok(())
            }
            (Role::Responder, RoundStep::Start, Command::PairingConfirm(confirm)) => {
                let z = z.ok_or(Abort::Protocol(Reason::PasskeyEntryFailed))?;
                self.remote_confirm = Some(confirm);
                self.session.generate_nonce(&mut self.rng)?;
                let local = self.session.confirm_value(z)?;
                self.send(out, Command::PairingConfirm(local));
                self.set_round_step(RoundStep::AwaitRandom);
                Ok(())
            }
            (_, RoundStep::AwaitRandom, Command::PairingRandom(nonce)) => {
                let z = z.ok_or(Abort::Protocol(Reason::PasskeyEntryFailed))?;
                self.session.set_remote_nonce(nonce);
                let confirm = self.expect_remote_confirm()?;
                self.session.verify_confirm(&confirm, z)?;
                if self.role == Role::Responder {
                    let local = self.session.local_nonce()?;
                    self.send(out, Command::PairingRandom(local));
                }
                self.complete_round(out)
            }
            (role, step, cmd) => {
                warn!(
                    [self.link] "unexpected {:?} as {:?} in passkey round step {:?}",
                    cmd.code(),
                    role,
                    step
                );
                Err(Abort::Protocol(Reason::UnspecifiedReason))
            }
        }
    }

    fn complete_round(&mut self, out: &mut Vec<Action>) -> Result<(), Abort> {
        let finished = match &mut self.rounds {
            Rounds::Exchange { exchange, step } => {
                exchange.complete_round();
                *step = RoundStep::Start;
                exchange.is_finished()
            }
            _ => false,
        };

        if finished {
            if self.passkey.is_none() {
                let injected = match &self.rounds {
                    Rounds::Exchange { exchange, .. } => exchange.passkey(),
                    _ => None,
                };
                match injected {
                    Some(passkey) => self.passkey = Some(passkey),
                    None => {
                        warn!([self.link] "injected bits don't form a valid passkey");
                        return Err(Abort::Protocol(Reason::PasskeyEntryFailed));
                    }
                }
            }
            self.finish_rounds(out)
        } else if self.role == Role::Initiator {
            self.start_round(out)
        } else {
            Ok(())
        }
    }

    fn on_reflected_nonce(&mut self, out: &mut Vec<Action>, nonce: [u8; 16]) -> Result<(), Abort> {
        let (round, bit, recovered) = match &mut self.rounds {
            Rounds::Reflect(reflector) => match reflector.on_nonce(&nonce) {
                Some((round, bit)) => (round, bit, reflector.passkey()),
                None => return Err(Abort::Protocol(Reason::ConfirmValueFailed)),
            },
            _ => return Err(Abort::Protocol(Reason::UnspecifiedReason)),
        };

        // 20 bits can encode more than 999999, which no real passkey does.
        if round == ROUNDS - 1 && recovered.is_none() {
            warn!([self.link] "reflected bits don't form a valid passkey");
            return Err(Abort::Protocol(Reason::PasskeyEntryFailed));
        }

        debug!([self.link] "reflected round {}, bit {}", round, bit as u8);
        self.session.set_remote_nonce(nonce);
        self.session.set_local_nonce(nonce);
        out.push(Action::PasskeyBit { round, bit });
        self.send(out, Command::PairingRandom(nonce));

        if let Some(passkey) = recovered {
            info!([self.link] "passkey recovered: {}", passkey);
            self.passkey = Some(passkey);
            out.push(Action::PasskeyRecovered(passkey));
            self.finish_rounds(out)?;
        }
        Ok(())
    }

    fn finish_rounds(&mut self, out: &mut Vec<Action>) -> Result<(), Abort> {
        self.transition(out, State::Confirmed);
        self.transition(out, State::NoncesExchanged);
        if self.role == Role::Initiator {
            self.send_dhkey_check(out)
        } else {
            Ok(())
        }
    }

    fn numeric_comparison(&mut self, out: &mut Vec<Action>) -> Result<(), Abort> {
        if self.params()?.method == PairingMethod::NumericComparison {
            let value = self.session.numeric_value(self.role)?;
            info!([self.link] "numeric comparison value {:06}", value);
            out.push(Action::NumericComparison(value));
        }
        Ok(())
    }

    /// `r` input of `f6`.
    fn check_r(&self) -> [u8; 16] {
        match self.passkey {
            Some(passkey) if self.rounds_used() => passkey.to_r(),
            _ => [0; 16],
        }
    }

    fn rounds_used(&self) -> bool {
        match self.params.as_ref().map(|p| p.method) {
            Some(PairingMethod::PasskeyEntry { .. }) => true,
            _ => false,
        }
    }

    fn send_dhkey_check(&mut self, out: &mut Vec<Action>) -> Result<(), Abort> {
        let params = *self.params()?;
        self.session
            .derive_keys(Role::Initiator, &params.a1(), &params.a2())?;
        let check = self.session.dhkey_check(
            &self.check_r(),
            &params.iocap(Role::Initiator),
            &params.a1(),
            &params.a2(),
        )?;
        self.send(out, Command::PairingDhKeyCheck(check));
        Ok(())
    }

    fn on_responder_dhkey_check(&mut self, out: &mut Vec<Action>, check: [u8; 16]) -> Result<(), Abort> {
        let params = *self.params()?;
        let r = self.check_r();
        self.session
            .derive_keys(Role::Responder, &params.a1(), &params.a2())?;
        self.session.verify_dhkey_check(
            &check,
            &r,
            &params.iocap(Role::Initiator),
            &params.a1(),
            &params.a2(),
        )?;

        let local = self.session.dhkey_check(
            &r,
            &params.iocap(Role::Responder),
            &params.a2(),
            &params.a1(),
        )?;
        self.send(out, Command::PairingDhKeyCheck(local));
        self.transition(out, State::DhKeyChecked);
        Ok(())
    }

    fn on_initiator_dhkey_check(&mut self, out: &mut Vec<Action>, check: [u8; 16]) -> Result<(), Abort> {
        let params = *self.params()?;
        self.session.verify_dhkey_check(
            &check,
            &self.check_r(),
            &params.iocap(Role::Responder),
            &params.a2(),
            &params.a1(),
        )?;
        self.transition(out, State::DhKeyChecked);

        let ltk = self.session.ltk()?.to_le_bytes();
        out.push(Action::Control(LinkControl::StartEncryption {
            ltk,
            ediv: 0,
            rand: 0,
        }));
        self.transition(out, State::Encrypting);
        Ok(())
    }

    fn start_distribution(&mut self, out: &mut Vec<Action>) -> Result<(), Abort> {
        let params = *self.params()?;
        let peer_role = match self.role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        let ours = params.keys_sent_by(self.role);
        self.keys_expected = params.keys_sent_by(peer_role);

        if ours.is_empty() && self.keys_expected.is_empty() {
            self.complete(out);
            return Ok(());
        }

        self.transition(out, State::DistributingKeys);
        // The responder distributes first.
        if self.role == Role::Responder {
            self.send_keys(out, ours);
        }
        self.check_distribution_done(out);
        Ok(())
    }

    fn on_key(&mut self, out: &mut Vec<Action>, cmd: Command) -> Result<(), Abort> {
        let expected = self.keys_expected;
        match cmd {
            Command::IdentityInformation(irk)
                if expected.contains(KeyDistribution::ID_KEY) && self.peer_keys.irk.is_none() =>
            {
                self.peer_keys.irk = Some(irk);
            }
            Command::IdentityAddressInformation(address)
                if expected.contains(KeyDistribution::ID_KEY) && self.peer_keys.irk.is_some() =>
            {
                debug!([self.link] "peer identity address {}", address);
                self.peer_keys.identity_address = Some(address);
                self.keys_expected.remove(KeyDistribution::ID_KEY);
            }
            Command::SigningInformation(csrk) if expected.contains(KeyDistribution::SIGN_KEY) => {
                self.peer_keys.csrk = Some(csrk);
                self.keys_expected.remove(KeyDistribution::SIGN_KEY);
            }
            cmd => {
                warn!(
                    [self.link] "unexpected {:?} during key distribution (expecting {:?})",
                    cmd.code(),
                    expected
                );
                return Err(Abort::Protocol(Reason::UnspecifiedReason));
            }
        }

        self.check_distribution_done(out);
        Ok(())
    }

    fn check_distribution_done(&mut self, out: &mut Vec<Action>) {
        if !self.keys_expected.is_empty() {
            return;
        }
        if self.role == Role::Initiator {
            let ours = self
                .params
                .map(|p| p.keys_sent_by(Role::Initiator))
                .unwrap_or_else(KeyDistribution::empty);
            self.send_keys(out, ours);
        }
        self.complete(out);
    }

    fn send_keys(&mut self, out: &mut Vec<Action>, keys: KeyDistribution) {
        if keys.contains(KeyDistribution::ID_KEY) {
            match self.features.identity {
                Some(identity) => {
                    self.send(out, Command::IdentityInformation(identity.irk));
                    self.send(out, Command::IdentityAddressInformation(identity.address));
                }
                None => warn!([self.link] "identity key negotiated but not configured"),
            }
        }
        if keys.contains(KeyDistribution::SIGN_KEY) {
            match self.features.csrk {
                Some(csrk) => self.send(out, Command::SigningInformation(csrk)),
                None => warn!([self.link] "signing key negotiated but not configured"),
            }
        }
    }

    fn complete(&mut self, out: &mut Vec<Action>) {
        info!([self.link] "pairing complete");
        self.transition(out, State::Complete);
        out.push(Action::Complete);
    }

    fn fail(&mut self, out: &mut Vec<Action>, reason: Reason, local: bool) {
        let failure = Failure {
            link: self.link,
            state: self.state,
            reason,
        };
        if local {
            self.send(out, Command::PairingFailed(reason));
            warn!([self.link] "{}", failure);
        } else {
            warn!([self.link] "peer aborted pairing: {}", failure);
        }
        self.session.clear();
        self.transition(out, State::Failed);
        out.push(Action::Failed(failure));
    }

    fn params(&self) -> Result<&PairingParameters, Abort> {
        self.params
            .as_ref()
            .ok_or(Abort::Fatal(SessionError::KeyMaterialMissing("pairing parameters")))
    }

    fn expect_remote_confirm(&mut self) -> Result<[u8; 16], Abort> {
        self.remote_confirm
            .take()
            .ok_or(Abort::Protocol(Reason::UnspecifiedReason))
    }

    fn send(&self, out: &mut Vec<Action>, cmd: Command) {
        trace!([self.link] "-> {:?}", cmd);
        out.push(Action::Send(cmd));
    }

    fn transition(&mut self, out: &mut Vec<Action>, state: State) {
        debug!([self.link] "{:?} -> {:?}", self.state, state);
        self.state = state;
        out.push(Action::StateChanged(state));
    }
}

impl<E: EcdhProvider, R: RngCore + CryptoRng> fmt::Debug for PairingStateMachine<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingStateMachine")
            .field("link", &self.link)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("params", &self.params)
            .field("rounds", &self.rounds)
            .finish()
    }
}
