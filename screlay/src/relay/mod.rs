//! The dual-link relay.
//!
//! A [`Relay`] sits between a real central and a real peripheral and pairs with each of them on its
//! own. Application traffic is held back until both pairings are complete, then forwarded.
//!
//! ```notrust
//!                     master-facing link                 slave-facing link
//!  real central  <------------------------->  Relay  <------------------------->  real peripheral
//!                 PairingStateMachine (resp)        PairingStateMachine (init)
//!                 PendingQueue (from master)        PendingQueue (from slave)
//! ```
//!
//! Each link is driven by its own event source, typically a thread running [`Relay::run_link`].
//! Events of one link are processed in order under that link's lock. Effects on the other link
//! (mirroring a Pairing Request, injecting reflected passkey bits, releasing held commands) are
//! applied only after that lock has been released, so the two link locks are never held at the
//! same time. The stage, completion flags and both queues live behind a single lock which is held
//! across "mark complete, check both, activate, drain".
//!
//! [`Relay`]: struct.Relay.html
//! [`Relay::run_link`]: struct.Relay.html#method.run_link

mod hooks;
mod queue;
mod stage;
mod wait;

#[cfg(test)]
mod tests;

pub use self::hooks::{Event, EventKind, Flow, Handler, Hooks};
pub use self::queue::{Pending, PendingQueue};
pub use self::stage::Stage;
pub use self::wait::{inbox, Cancel, Inbox, WaitResult};

use self::{
    queue::drain_in_order,
    wait::{wait_for, Watchers},
};
use crate::{
    config::{Config, RelayConfig, Strategy},
    l2cap::{Channel, Frame},
    link::{
        AdvertisingKind, AdvertisingParameters, AdvertisingReport, DeviceAddress, Link, LinkError,
        LinkEvent, LinkId,
    },
    security::{
        Action, Command, Failure, LocalFeatures, PairingStateMachine, Passkey, PasskeyPolicy,
        PeerKeys, Role, SessionError, State,
    },
    Error,
};
use core::fmt;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

/// Passes application traffic between the links once the relay is active.
pub trait Forwarder: Send + Sync {
    /// Forwards `frame`, received on `source`, to `target` (the other link).
    ///
    /// Implementations may modify or drop the frame.
    fn forward(&self, frame: &Frame, source: LinkId, target: &dyn Link) -> Result<(), LinkError>;
}

/// A `Forwarder` sending every frame unmodified.
#[derive(Debug, Default, Copy, Clone)]
pub struct PassThrough;

impl Forwarder for PassThrough {
    fn forward(&self, frame: &Frame, _source: LinkId, target: &dyn Link) -> Result<(), LinkError> {
        target.send(frame)
    }
}

/// Errors returned by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A received PDU could not be decoded. The relay keeps running.
    Codec(Error),
    /// Key generation or randomness failed. The relay has stopped.
    Fatal(SessionError),
    /// A link operation failed.
    Link(LinkError),
    /// The relay has stopped and doesn't process events anymore.
    Stopped,
}

impl From<Error> for RelayError {
    fn from(e: Error) -> Self {
        RelayError::Codec(e)
    }
}

impl From<LinkError> for RelayError {
    fn from(e: LinkError) -> Self {
        RelayError::Link(e)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Codec(e) => write!(f, "malformed PDU: {}", e),
            RelayError::Fatal(e) => write!(f, "fatal error: {}", e),
            RelayError::Link(e) => e.fmt(f),
            RelayError::Stopped => f.write_str("relay stopped"),
        }
    }
}

impl std::error::Error for RelayError {}

type Machine<C> = PairingStateMachine<<C as Config>::Ecdh, <C as Config>::Rng>;

/// Per-link state, guarded by the link's lock.
struct Slot<C: Config> {
    /// Exists while the link is connected.
    machine: Option<Machine<C>>,
    /// Master-facing only: commands held back until the slave-facing key exchange is done.
    held: VecDeque<Command>,
    /// Slave-facing only: mirrored features waiting for the connection to the real peripheral.
    mirrored: Option<LocalFeatures>,
}

impl<C: Config> Slot<C> {
    fn new() -> Self {
        Self {
            machine: None,
            held: VecDeque::new(),
            mirrored: None,
        }
    }
}

/// State shared by both links.
struct Shared {
    stage: Stage,
    complete: [bool; 2],
    queues: [PendingQueue; 2],
    next_seq: u64,
    failures: Vec<Failure>,
    advertising: Option<Vec<u8>>,
    scan_response: Option<Vec<u8>>,
    /// Configured, or learned by reflection.
    passkey: Option<Passkey>,
}

/// Work on another link (or a later step on the same one), done without holding a link lock.
enum Followup {
    Initiate(LinkId),
    Mirror(LocalFeatures),
    InjectBit { round: u8, bit: bool },
    ReleaseHeld,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The relay orchestrator.
///
/// Shared between the link threads by reference (or `Arc`). Register hooks with `hooks_mut`
/// before sharing it.
pub struct Relay<C: Config> {
    config: RelayConfig,
    factory: Mutex<(C::Ecdh, C::Rng)>,
    links: [C::Link; 2],
    forwarder: C::Forwarder,
    hooks: Hooks,
    slots: [Mutex<Slot<C>>; 2],
    shared: Mutex<Shared>,
    stage_watchers: Watchers<Stage>,
    slave_keys_exchanged: AtomicBool,
}

impl<C: Config> Relay<C> {
    /// Creates a relay in the `Scanning` stage.
    ///
    /// `rng` is cloned for every pairing attempt, so clones must produce independent output (like
    /// handles to the OS generator do).
    pub fn new(
        config: RelayConfig,
        provider: C::Ecdh,
        rng: C::Rng,
        slave: C::Link,
        master: C::Link,
        forwarder: C::Forwarder,
    ) -> Self {
        let passkey = config.passkey;
        Self {
            config,
            factory: Mutex::new((provider, rng)),
            links: [slave, master],
            forwarder,
            hooks: Hooks::new(),
            slots: [Mutex::new(Slot::new()), Mutex::new(Slot::new())],
            shared: Mutex::new(Shared {
                stage: Stage::Scanning,
                complete: [false; 2],
                queues: [
                    PendingQueue::new(LinkId::SlaveFacing),
                    PendingQueue::new(LinkId::MasterFacing),
                ],
                next_seq: 0,
                failures: Vec::new(),
                advertising: None,
                scan_response: None,
                passkey,
            }),
            stage_watchers: Watchers::new(),
            slave_keys_exchanged: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn link(&self, link: LinkId) -> &C::Link {
        &self.links[link.index()]
    }

    pub fn stage(&self) -> Stage {
        self.shared().stage
    }

    /// Returns all pairing failures seen so far, on both links.
    pub fn failures(&self) -> Vec<Failure> {
        self.shared().failures.clone()
    }

    /// Returns the passkey learned by reflection (or configured).
    pub fn learned_passkey(&self) -> Option<Passkey> {
        self.shared().passkey
    }

    /// Returns the LTK of `link` in controller byte order, once pairing on it is complete.
    pub fn long_term_key(&self, link: LinkId) -> Option<[u8; 16]> {
        let slot = self.slot(link);
        let machine = slot.machine.as_ref()?;
        if machine.state() == State::Complete {
            machine.long_term_key().map(|key| key.to_le_bytes())
        } else {
            None
        }
    }

    /// Returns the keys the peer on `link` distributed.
    pub fn peer_keys(&self, link: LinkId) -> Option<PeerKeys> {
        self.slot(link)
            .machine
            .as_ref()
            .map(|machine| machine.peer_keys().clone())
    }

    /// Returns the pairing state of `link`, or `None` if it is not connected.
    pub fn machine_state(&self, link: LinkId) -> Option<State> {
        self.slot(link).machine.as_ref().map(|machine| machine.state())
    }

    /// Returns the number of frames received on `link` that wait for the relay to become active.
    pub fn pending(&self, link: LinkId) -> usize {
        self.shared().queues[link.index()].len()
    }

    /// Stops the relay. All further events are rejected.
    pub fn stop(&self) {
        let mut shared = self.shared();
        self.set_stage(&mut shared, Stage::Stopped);
    }

    /// Starts pairing with the real peripheral, if it hasn't started yet.
    pub fn pair_slave(&self) -> Result<(), RelayError> {
        self.ensure_running()?;
        let mut work = VecDeque::new();
        work.push_back(Followup::Initiate(LinkId::SlaveFacing));
        self.run_followups(work)
    }

    /// Blocks until the relay reaches `target` (or `Stopped`).
    pub fn wait_for_stage(&self, target: Stage, timeout: Duration, cancel: &Cancel) -> WaitResult<Stage> {
        let reached = |stage: Stage| {
            if stage == target || stage == Stage::Stopped {
                Some(stage)
            } else {
                None
            }
        };
        // Subscribe first, so no transition is missed between the check and the wait.
        let updates = self.stage_watchers.subscribe();
        if let Some(stage) = reached(self.stage()) {
            return WaitResult::Ready(stage);
        }
        wait_for(&updates, timeout, cancel, reached)
    }

    /// Processes events of `link` from `inbox` until `cancel` fires or the relay stops.
    ///
    /// Malformed PDUs and link errors are logged and skipped. Returns `Ok` when cancelled, or when
    /// every sender of `inbox` is gone.
    pub fn run_link(&self, link: LinkId, inbox: &mut Inbox<LinkEvent>, cancel: &Cancel) -> Result<(), RelayError> {
        debug!([link] "event loop started");
        loop {
            self.ensure_running()?;
            match inbox.recv(self.config.stage_poll_interval, cancel) {
                WaitResult::Ready(event) => match self.handle_event(link, event) {
                    Ok(()) => {}
                    Err(RelayError::Codec(e)) => warn!([link] "dropping malformed PDU: {}", e),
                    Err(RelayError::Link(e)) => error!([link] "{}", e),
                    Err(e) => return Err(e),
                },
                WaitResult::TimedOut => {}
                WaitResult::Cancelled => {
                    debug!([link] "event loop cancelled");
                    return Ok(());
                }
            }
        }
    }

    /// Processes a single event of `link`.
    pub fn handle_event(&self, link: LinkId, event: LinkEvent) -> Result<(), RelayError> {
        self.ensure_running()?;
        match event {
            LinkEvent::Advertisement(report) => {
                if link == LinkId::SlaveFacing {
                    self.on_advertisement(report)
                } else {
                    Ok(())
                }
            }
            LinkEvent::Connected { peer } => self.on_connected(link, peer),
            LinkEvent::Disconnected => self.on_disconnected(link),
            LinkEvent::Pdu(raw) => {
                let frame = Frame::parse(&raw)?;
                trace!([link] "<- {:?}", frame);
                self.on_frame(link, frame)
            }
            LinkEvent::LongTermKeyRequest { .. } => {
                self.drive(link, |machine| machine.long_term_key_requested())
            }
            LinkEvent::EncryptionChanged { status } => {
                self.drive(link, |machine| machine.encryption_changed(status))
            }
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn slot(&self, link: LinkId) -> MutexGuard<'_, Slot<C>> {
        lock(&self.slots[link.index()])
    }

    fn ensure_running(&self) -> Result<(), RelayError> {
        if self.stage() == Stage::Stopped {
            Err(RelayError::Stopped)
        } else {
            Ok(())
        }
    }

    fn set_stage(&self, shared: &mut Shared, to: Stage) -> bool {
        let from = shared.stage;
        if !from.can_advance_to(to) {
            debug!("not moving from stage {} to {}", from, to);
            return false;
        }
        shared.stage = to;
        info!("stage: {} -> {}", from, to);
        self.hooks.dispatch(&Event::StageChanged { from, to });
        self.stage_watchers.publish(to);
        true
    }

    fn fatal(&self, e: SessionError) -> RelayError {
        error!("stopping relay: {}", e);
        let mut shared = self.shared();
        self.set_stage(&mut shared, Stage::Stopped);
        RelayError::Fatal(e)
    }

    fn advertising_parameters(&self, shared: &Shared) -> Option<AdvertisingParameters> {
        Some(AdvertisingParameters {
            data: shared.advertising.clone()?,
            scan_data: shared.scan_response.clone()?,
            interval: self.config.advertising_interval,
            address_kind: self.config.master_facing_address().kind(),
        })
    }

    fn on_advertisement(&self, report: AdvertisingReport) -> Result<(), RelayError> {
        if report.address != self.config.target {
            return Ok(());
        }

        let params = {
            let mut shared = self.shared();
            if shared.stage != Stage::Scanning {
                return Ok(());
            }
            debug!("captured {:?} data of {}", report.kind, report.address);
            match report.kind {
                AdvertisingKind::Primary => shared.advertising = Some(report.data),
                AdvertisingKind::ScanResponse => shared.scan_response = Some(report.data),
            }
            let params = match self.advertising_parameters(&shared) {
                Some(params) => params,
                None => return Ok(()),
            };
            self.set_stage(&mut shared, Stage::Cloning);
            params
        };

        let slave = self.link(LinkId::SlaveFacing);
        let master = self.link(LinkId::MasterFacing);
        master.set_address(self.config.master_facing_address())?;
        slave.set_address(self.config.slave_facing_address())?;
        master.set_advertising_parameters(&params)?;
        if self.config.strategy == Strategy::Preconnect {
            slave.connect(self.config.target)?;
        }

        let mut shared = self.shared();
        self.set_stage(&mut shared, Stage::WaitingForMaster);
        Ok(())
    }

    fn passkey_policy(&self, link: LinkId) -> PasskeyPolicy {
        let known = self.shared().passkey;
        match (known, link) {
            (Some(passkey), _) => PasskeyPolicy::Fixed(passkey),
            (None, LinkId::MasterFacing) if self.config.reflect_passkey => PasskeyPolicy::Reflect,
            (None, LinkId::SlaveFacing) if self.config.reflect_passkey => PasskeyPolicy::Injected,
            (None, _) => PasskeyPolicy::Random,
        }
    }

    fn features(&self, link: LinkId) -> LocalFeatures {
        match link {
            LinkId::SlaveFacing => self.config.slave_features.clone(),
            LinkId::MasterFacing => self.config.master_features.clone(),
        }
    }

    fn new_machine(&self, link: LinkId, peer: DeviceAddress) -> Result<Machine<C>, RelayError> {
        let (provider, rng) = {
            let factory = lock(&self.factory);
            (factory.0.clone(), factory.1.clone())
        };
        let (role, local) = match link {
            LinkId::SlaveFacing => (Role::Initiator, self.config.slave_facing_address()),
            LinkId::MasterFacing => (Role::Responder, self.config.master_facing_address()),
        };
        let policy = self.passkey_policy(link);
        PairingStateMachine::new(
            link,
            role,
            self.features(link),
            policy,
            local,
            peer,
            provider,
            rng,
        )
        .map_err(|e| self.fatal(e))
    }

    /// Prepares `machine` for another attempt with the current passkey knowledge.
    fn restart(&self, link: LinkId, machine: &mut Machine<C>) -> Result<(), RelayError> {
        machine.reset().map_err(|e| self.fatal(e))?;
        machine.set_features(self.features(link));
        machine.set_passkey_policy(self.passkey_policy(link));
        Ok(())
    }

    fn on_connected(&self, link: LinkId, peer: DeviceAddress) -> Result<(), RelayError> {
        info!([link] "connected to {}", peer);
        let machine = self.new_machine(link, peer)?;
        let mut work = VecDeque::new();
        {
            let mut slot = self.slot(link);
            slot.machine = Some(machine);
            slot.held.clear();
            if link == LinkId::SlaveFacing {
                if let Some(features) = slot.mirrored.take() {
                    work.push_back(Followup::Mirror(features));
                } else if !self.config.mirror_pairing_request {
                    work.push_back(Followup::Initiate(link));
                }
            }
        }

        if link == LinkId::SlaveFacing {
            self.slave_keys_exchanged.store(false, Ordering::SeqCst);
        }

        let connect_slave = {
            let mut shared = self.shared();
            shared.complete[link.index()] = false;
            link == LinkId::MasterFacing
                && self.set_stage(&mut shared, Stage::MasterLinkEstablishing)
                && self.config.strategy == Strategy::Flood
        };
        if connect_slave && !self.link(LinkId::SlaveFacing).is_connected() {
            self.link(LinkId::SlaveFacing).connect(self.config.target)?;
        }

        self.run_followups(work)
    }

    fn on_disconnected(&self, link: LinkId) -> Result<(), RelayError> {
        info!([link] "disconnected");
        match link {
            LinkId::MasterFacing => self.on_master_disconnected(),
            LinkId::SlaveFacing => {
                {
                    let mut slot = self.slot(link);
                    slot.machine = None;
                    slot.mirrored = None;
                }
                self.slave_keys_exchanged.store(false, Ordering::SeqCst);

                let mut shared = self.shared();
                if shared.stage == Stage::ActiveRelay {
                    self.set_stage(&mut shared, Stage::Stopped);
                } else {
                    shared.complete[link.index()] = false;
                    shared.queues[link.index()].clear();
                }
                Ok(())
            }
        }
    }

    fn on_master_disconnected(&self) -> Result<(), RelayError> {
        {
            let mut slot = self.slot(LinkId::MasterFacing);
            slot.machine = None;
            slot.held.clear();
        }

        // The slave-facing pairing only survives if it already completed.
        let slave_reset = {
            let mut slot = self.slot(LinkId::SlaveFacing);
            slot.mirrored = None;
            match slot.machine.as_mut() {
                Some(machine) if machine.state() != State::Complete => {
                    self.restart(LinkId::SlaveFacing, machine)?;
                    true
                }
                _ => false,
            }
        };

        let mut work = VecDeque::new();
        if slave_reset {
            self.slave_keys_exchanged.store(false, Ordering::SeqCst);
            if !self.config.mirror_pairing_request {
                work.push_back(Followup::Initiate(LinkId::SlaveFacing));
            }
        }

        let params = {
            let mut shared = self.shared();
            shared.complete[LinkId::MasterFacing.index()] = false;
            if slave_reset {
                shared.complete[LinkId::SlaveFacing.index()] = false;
            }
            shared.queues[LinkId::MasterFacing.index()].clear();
            self.set_stage(&mut shared, Stage::WaitingForMaster);
            self.advertising_parameters(&shared)
        };
        if let Some(params) = params {
            self.link(LinkId::MasterFacing)
                .set_advertising_parameters(&params)?;
        }

        self.run_followups(work)
    }

    fn on_frame(&self, link: LinkId, frame: Frame) -> Result<(), RelayError> {
        if self.hooks.dispatch(&Event::PduReceived { link, frame: &frame }) == Flow::Skip {
            debug!([link] "hook dropped {:?}", frame);
            return Ok(());
        }

        if frame.channel().is_security_manager() {
            let cmd = Command::decode(frame.payload())?;
            return self.on_command(link, cmd);
        }

        let mut shared = self.shared();
        if shared.stage.is_relaying() {
            self.forward(link, &frame);
        } else {
            let seq = shared.next_seq;
            shared.next_seq += 1;
            shared.queues[link.index()].push(seq, frame);
        }
        Ok(())
    }

    fn on_command(&self, link: LinkId, cmd: Command) -> Result<(), RelayError> {
        let mut work = VecDeque::new();
        {
            let mut guard = self.slot(link);
            let slot = &mut *guard;
            let machine = match slot.machine.as_mut() {
                Some(machine) => machine,
                None => {
                    warn!([link] "{:?} without connection", cmd.code());
                    return Ok(());
                }
            };

            if link == LinkId::MasterFacing {
                if let Command::PairingRequest(request) = cmd {
                    if machine.state() == State::Failed {
                        debug!([link] "new pairing attempt");
                        self.restart(link, machine)?;
                        slot.held.clear();
                    }
                    if self.config.mirror_pairing_request && machine.state() == State::Idle {
                        let mut features = LocalFeatures::mirror(&request);
                        features.identity = self.config.slave_features.identity;
                        features.csrk = self.config.slave_features.csrk;
                        work.push_back(Followup::Mirror(features));
                    }
                }

                if self.must_hold(machine, &slot.held) {
                    debug!(
                        [link] "holding {:?} until the slave-facing key exchange is done",
                        cmd.code()
                    );
                    slot.held.push_back(cmd);
                    return Ok(());
                }
            }

            let actions = machine.handle(cmd).map_err(|e| self.fatal(e))?;
            self.apply(link, actions, &mut work)?;
        }
        self.run_followups(work)
    }

    /// Reflection may only answer the real central once the slave-facing link has exchanged
    /// public keys. Everything after a held command is held too, to keep the order.
    fn must_hold(&self, machine: &Machine<C>, held: &VecDeque<Command>) -> bool {
        machine.passkey_policy() == PasskeyPolicy::Reflect
            && machine.state() == State::PasskeyRounds
            && (!held.is_empty() || !self.slave_keys_exchanged.load(Ordering::SeqCst))
    }

    fn drive<F>(&self, link: LinkId, f: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut Machine<C>) -> Result<Vec<Action>, SessionError>,
    {
        let mut work = VecDeque::new();
        self.with_machine(link, &mut work, f)?;
        self.run_followups(work)
    }

    fn with_machine<F>(&self, link: LinkId, work: &mut VecDeque<Followup>, f: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut Machine<C>) -> Result<Vec<Action>, SessionError>,
    {
        let mut slot = self.slot(link);
        let machine = match slot.machine.as_mut() {
            Some(machine) => machine,
            None => {
                debug!([link] "not connected");
                return Ok(());
            }
        };
        let actions = f(machine).map_err(|e| self.fatal(e))?;
        self.apply(link, actions, work)
    }

    fn run_followups(&self, mut work: VecDeque<Followup>) -> Result<(), RelayError> {
        while let Some(next) = work.pop_front() {
            match next {
                Followup::Initiate(link) => self.with_machine(link, &mut work, |machine| {
                    if machine.state() == State::Idle {
                        machine.initiate()
                    } else {
                        Ok(Vec::new())
                    }
                })?,
                Followup::Mirror(features) => self.mirror(features, &mut work)?,
                Followup::InjectBit { round, bit } => {
                    self.with_machine(LinkId::SlaveFacing, &mut work, |machine| {
                        machine.inject_passkey_bit(round, bit)
                    })?
                }
                Followup::ReleaseHeld => self.release_held(&mut work)?,
            }
        }
        Ok(())
    }

    fn mirror(&self, features: LocalFeatures, work: &mut VecDeque<Followup>) -> Result<(), RelayError> {
        let link = LinkId::SlaveFacing;
        let mut slot = self.slot(link);
        let machine = match slot.machine.as_mut() {
            Some(machine) => machine,
            None => {
                debug!([link] "not connected yet, mirroring later");
                slot.mirrored = Some(features);
                return Ok(());
            }
        };
        if machine.state() != State::Idle {
            debug!([link] "pairing already started, not mirroring");
            return Ok(());
        }
        debug!([link] "mirroring {:?} request", features.io);
        machine.set_features(features);
        let actions = machine.initiate().map_err(|e| self.fatal(e))?;
        self.apply(link, actions, work)
    }

    fn release_held(&self, work: &mut VecDeque<Followup>) -> Result<(), RelayError> {
        let link = LinkId::MasterFacing;
        let mut guard = self.slot(link);
        let slot = &mut *guard;
        while let Some(cmd) = slot.held.pop_front() {
            let machine = match slot.machine.as_mut() {
                Some(machine) => machine,
                None => {
                    slot.held.clear();
                    break;
                }
            };
            debug!([link] "releasing held {:?}", cmd.code());
            let actions = machine.handle(cmd).map_err(|e| self.fatal(e))?;
            self.apply(link, actions, work)?;
        }
        Ok(())
    }

    /// Carries out the actions of `link`'s machine. Called with that link's lock held.
    fn apply(&self, link: LinkId, actions: Vec<Action>, work: &mut VecDeque<Followup>) -> Result<(), RelayError> {
        for action in actions {
            match action {
                Action::Send(cmd) => self.send_command(link, &cmd)?,
                Action::Control(request) => self.link(link).control(request)?,
                Action::StateChanged(state) => {
                    self.hooks
                        .dispatch(&Event::PairingStateChanged { link, state });
                    if link == LinkId::SlaveFacing && state == State::PublicKeyExchanged {
                        self.slave_keys_exchanged.store(true, Ordering::SeqCst);
                        work.push_back(Followup::ReleaseHeld);
                    }
                }
                Action::NumericComparison(value) => {
                    info!([link] "numeric comparison {:06}, confirmed", value);
                    self.hooks
                        .dispatch(&Event::NumericComparison { link, value });
                }
                Action::PasskeyDisplay(passkey) => {
                    info!([link] "passkey {}", passkey);
                    self.hooks.dispatch(&Event::PasskeyDisplay { link, passkey });
                }
                Action::PasskeyBit { round, bit } => {
                    if link == LinkId::MasterFacing {
                        work.push_back(Followup::InjectBit { round, bit });
                    }
                }
                Action::PasskeyRecovered(passkey) => {
                    info!([link] "learned passkey {}", passkey);
                    self.shared().passkey = Some(passkey);
                    self.hooks.dispatch(&Event::PasskeyRecovered { passkey });
                }
                Action::SecurityRequest(auth_req) => {
                    if self.config.pair_on_security_request {
                        debug!([link] "security request {:?}, pairing", auth_req);
                        work.push_back(Followup::Initiate(link));
                    } else {
                        debug!([link] "ignoring security request {:?}", auth_req);
                    }
                }
                Action::Complete => self.on_complete(link),
                Action::Failed(failure) => {
                    self.shared().failures.push(failure);
                    self.hooks.dispatch(&Event::PairingFailed(&failure));
                }
            }
        }
        Ok(())
    }

    fn send_command(&self, link: LinkId, cmd: &Command) -> Result<(), RelayError> {
        if self.hooks.dispatch(&Event::PduSending { link, command: cmd }) == Flow::Skip {
            debug!([link] "hook suppressed {:?}", cmd.code());
            return Ok(());
        }
        let pdu = cmd.encode()?;
        let frame = Frame::new(Channel::LE_SECURITY_MANAGER, pdu.to_vec());
        trace!([link] "-> {:?}", frame);
        self.link(link).send(&frame)?;
        Ok(())
    }

    fn on_complete(&self, link: LinkId) {
        let mut shared = self.shared();
        shared.complete[link.index()] = true;
        self.hooks.dispatch(&Event::PairingComplete { link });

        if shared.complete == [true, true] && shared.stage == Stage::MasterLinkEstablishing {
            self.set_stage(&mut shared, Stage::ActiveRelay);
            let pending = {
                let (slave, master) = shared.queues.split_at_mut(1);
                drain_in_order(&mut slave[0], &mut master[0])
            };
            info!("both links paired, forwarding {} queued frames", pending.len());
            for entry in pending {
                self.forward(entry.source, &entry.frame);
            }
        }
    }

    /// Forwards a frame to the other link. Called with the shared lock held.
    fn forward(&self, source: LinkId, frame: &Frame) {
        if self.hooks.dispatch(&Event::Forwarding { source, frame }) == Flow::Skip {
            debug!([source] "hook dropped {:?}", frame);
            return;
        }
        let target = source.opposite();
        trace!([source] "forwarding {:?}", frame);
        if let Err(e) = self.forwarder.forward(frame, source, self.link(target)) {
            error!([source] "forwarding to {} link failed: {}", target, e);
        }
    }
}

impl<C: Config> fmt::Debug for Relay<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("stage", &self.stage())
            .field("hooks", &self.hooks)
            .finish()
    }
}
