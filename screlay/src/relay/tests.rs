use super::*;
use crate::{
    config::Strategy,
    ecdh::P256Provider,
    link::{AddressKind, LinkControl},
    security::{AuthReq, IoCapabilities, Reason},
};
use rand_core::{CryptoRng, OsRng, RngCore};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

const ADV_DATA: &[u8] = &[0x02, 0x01, 0x06, 0x05, 0x09, b'l', b'o', b'c', b'k'];
const SCAN_DATA: &[u8] = &[0x03, 0x03, 0x0F, 0x18];

fn target() -> DeviceAddress {
    DeviceAddress::from_msb_first([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55], AddressKind::Random)
}

fn central_address() -> DeviceAddress {
    DeviceAddress::from_msb_first([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13], AddressKind::Public)
}

fn passkey(value: u32) -> Passkey {
    Passkey::new(value).unwrap()
}

#[derive(Default)]
struct MockState {
    connected: bool,
    address: Option<DeviceAddress>,
    advertising: Vec<AdvertisingParameters>,
    connects: Vec<DeviceAddress>,
    sent: VecDeque<Frame>,
    controls: VecDeque<LinkControl>,
}

/// Records what the relay asks of a link. The test plays the radio.
#[derive(Clone, Default)]
struct MockLink(Arc<Mutex<MockState>>);

impl MockLink {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }
}

impl Link for MockLink {
    fn connect(&self, peer: DeviceAddress) -> Result<(), LinkError> {
        self.state().connects.push(peer);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        self.state().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn set_address(&self, address: DeviceAddress) -> Result<(), LinkError> {
        self.state().address = Some(address);
        Ok(())
    }

    fn set_advertising_parameters(&self, params: &AdvertisingParameters) -> Result<(), LinkError> {
        self.state().advertising.push(params.clone());
        Ok(())
    }

    fn send(&self, frame: &Frame) -> Result<(), LinkError> {
        let mut state = self.state();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.sent.push_back(frame.clone());
        Ok(())
    }

    fn control(&self, request: LinkControl) -> Result<(), LinkError> {
        self.state().controls.push_back(request);
        Ok(())
    }
}

/// Logs every forwarded frame, then passes it through.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(LinkId, Vec<u8>)>>>);

impl Recorder {
    fn frames(&self) -> Vec<(LinkId, Vec<u8>)> {
        self.0.lock().unwrap().clone()
    }
}

impl Forwarder for Recorder {
    fn forward(&self, frame: &Frame, source: LinkId, target: &dyn Link) -> Result<(), LinkError> {
        self.0
            .lock()
            .unwrap()
            .push((source, frame.payload().to_vec()));
        PassThrough.forward(frame, source, target)
    }
}

struct TestConfig;

impl Config for TestConfig {
    type Ecdh = P256Provider;
    type Rng = OsRng;
    type Link = MockLink;
    type Forwarder = Recorder;
}

type TestRelay = Relay<TestConfig>;

struct Bench {
    relay: Arc<TestRelay>,
    slave: MockLink,
    master: MockLink,
    recorder: Recorder,
}

impl Bench {
    fn new(config: RelayConfig) -> Self {
        Self::with_hooks(config, |_| {})
    }

    fn with_hooks(config: RelayConfig, install: impl FnOnce(&mut Hooks)) -> Self {
        let slave = MockLink::default();
        let master = MockLink::default();
        let recorder = Recorder::default();
        let mut relay = Relay::new(
            config,
            P256Provider::new(),
            OsRng,
            slave.clone(),
            master.clone(),
            recorder.clone(),
        );
        install(relay.hooks_mut());
        Self {
            relay: Arc::new(relay),
            slave,
            master,
            recorder,
        }
    }

    fn discover(&self) {
        for (kind, data) in &[
            (AdvertisingKind::Primary, ADV_DATA),
            (AdvertisingKind::ScanResponse, SCAN_DATA),
        ] {
            let report = AdvertisingReport {
                address: target(),
                kind: *kind,
                data: data.to_vec(),
            };
            self.relay
                .handle_event(LinkId::SlaveFacing, LinkEvent::Advertisement(report))
                .unwrap();
        }
        assert_eq!(self.relay.stage(), Stage::WaitingForMaster);
    }

    /// The real central, connected to the master-facing link.
    fn central(&self, io: IoCapabilities, policy: PasskeyPolicy) -> Peer {
        Peer::new(
            LinkId::MasterFacing,
            Role::Initiator,
            io,
            policy,
            central_address(),
            self.relay.config().master_facing_address(),
            self.master.clone(),
        )
    }

    /// The real peripheral, connected to the slave-facing link.
    fn peripheral(&self, io: IoCapabilities, policy: PasskeyPolicy) -> Peer {
        Peer::new(
            LinkId::SlaveFacing,
            Role::Responder,
            io,
            policy,
            target(),
            self.relay.config().slave_facing_address(),
            self.slave.clone(),
        )
    }
}

/// A real device on the far end of one of the relay's links.
struct Peer {
    link: LinkId,
    machine: PairingStateMachine<P256Provider, OsRng>,
    mock: MockLink,
    /// LTK the peer's controller uses, as central.
    ltk: Option<[u8; 16]>,
    commands: Vec<Command>,
    received: Vec<Vec<u8>>,
    failures: Vec<Failure>,
}

impl Peer {
    fn new(
        link: LinkId,
        role: Role,
        io: IoCapabilities,
        policy: PasskeyPolicy,
        local: DeviceAddress,
        peer: DeviceAddress,
        mock: MockLink,
    ) -> Self {
        let machine = PairingStateMachine::new(
            link,
            role,
            LocalFeatures::new(io),
            policy,
            local,
            peer,
            P256Provider::new(),
            OsRng,
        )
        .unwrap();
        Self {
            link,
            machine,
            mock,
            ltk: None,
            commands: Vec::new(),
            received: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn address(&self) -> DeviceAddress {
        match self.link {
            LinkId::MasterFacing => central_address(),
            LinkId::SlaveFacing => target(),
        }
    }

    fn connect(&mut self, relay: &TestRelay) {
        {
            let mut state = self.mock.state();
            state.connected = true;
            state.sent.clear();
            state.controls.clear();
        }
        relay
            .handle_event(self.link, LinkEvent::Connected { peer: self.address() })
            .unwrap();
        if self.machine.role() == Role::Initiator {
            let actions = self.machine.initiate().unwrap();
            self.deliver(relay, actions);
        }
    }

    fn disconnect(&mut self, relay: &TestRelay) -> Result<(), RelayError> {
        self.mock.state().connected = false;
        relay.handle_event(self.link, LinkEvent::Disconnected)
    }

    fn send_att(&self, relay: &TestRelay, payload: &[u8]) {
        let frame = Frame::new(Channel::ATT, payload.to_vec());
        relay
            .handle_event(self.link, LinkEvent::Pdu(frame.to_vec().unwrap()))
            .unwrap();
    }

    fn send_command(&self, relay: &TestRelay, cmd: Command) {
        let frame = Frame::new(Channel::LE_SECURITY_MANAGER, cmd.encode().unwrap().to_vec());
        relay
            .handle_event(self.link, LinkEvent::Pdu(frame.to_vec().unwrap()))
            .unwrap();
    }

    fn deliver(&mut self, relay: &TestRelay, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(cmd) => self.send_command(relay, cmd),
                Action::Control(LinkControl::StartEncryption { ltk, ediv, rand }) => {
                    self.ltk = Some(ltk);
                    relay
                        .handle_event(self.link, LinkEvent::LongTermKeyRequest { ediv, rand })
                        .unwrap();
                }
                Action::Failed(failure) => self.failures.push(failure),
                _ => {}
            }
        }
    }

    fn encryption_changed(&mut self, relay: &TestRelay, status: u8) {
        let actions = self.machine.encryption_changed(status).unwrap();
        relay
            .handle_event(self.link, LinkEvent::EncryptionChanged { status })
            .unwrap();
        self.deliver(relay, actions);
    }

    /// Handles everything the relay sent this peer. Returns whether there was anything.
    fn pump(&mut self, relay: &TestRelay) -> bool {
        let (frames, controls) = {
            let mut state = self.mock.state();
            (
                state.sent.drain(..).collect::<Vec<_>>(),
                state.controls.drain(..).collect::<Vec<_>>(),
            )
        };
        let progressed = !frames.is_empty() || !controls.is_empty();

        for frame in frames {
            if frame.channel().is_security_manager() {
                let cmd = Command::decode(frame.payload()).unwrap();
                self.commands.push(cmd);
                let actions = self.machine.handle(cmd).unwrap();
                self.deliver(relay, actions);
            } else {
                self.received.push(frame.payload().to_vec());
            }
        }

        for control in controls {
            match control {
                // The relay answers our encryption request.
                LinkControl::LongTermKeyReply { ltk } => {
                    let status = if Some(ltk) == self.ltk.take() { 0 } else { 0x06 };
                    self.encryption_changed(relay, status);
                }
                LinkControl::LongTermKeyNegativeReply => {
                    self.ltk = None;
                    self.encryption_changed(relay, 0x06);
                }
                // The relay encrypts the link towards us.
                LinkControl::StartEncryption { ltk, .. } => {
                    let actions = self.machine.long_term_key_requested().unwrap();
                    let reply = actions.iter().find_map(|a| match a {
                        Action::Control(LinkControl::LongTermKeyReply { ltk }) => Some(*ltk),
                        _ => None,
                    });
                    self.deliver(relay, actions);
                    let status = if reply == Some(ltk) { 0 } else { 0x06 };
                    self.encryption_changed(relay, status);
                }
            }
        }
        progressed
    }

    fn long_term_key(&self) -> Option<[u8; 16]> {
        self.machine.long_term_key().map(|key| key.to_le_bytes())
    }
}

fn settle(relay: &TestRelay, peers: &mut [&mut Peer]) {
    loop {
        let mut progressed = false;
        for peer in peers.iter_mut() {
            progressed |= peer.pump(relay);
        }
        if !progressed {
            break;
        }
    }
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (count.clone(), count)
}

#[test]
fn clones_target_and_pairs_both_links() {
    let bench = Bench::new(RelayConfig::new(target()));
    assert_eq!(bench.relay.stage(), Stage::Scanning);
    bench.discover();

    {
        let master = bench.master.state();
        assert_eq!(master.address, Some(target()));
        assert_eq!(master.advertising.len(), 1);
        assert_eq!(master.advertising[0].data, ADV_DATA);
        assert_eq!(master.advertising[0].scan_data, SCAN_DATA);
        assert_eq!(master.advertising[0].address_kind, AddressKind::Random);
    }
    assert_eq!(bench.slave.state().connects, vec![target()]);

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut peripheral]);
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Complete));
    assert_eq!(bench.relay.stage(), Stage::WaitingForMaster);

    let mut central = bench.central(IoCapabilities::KeyboardDisplay, PasskeyPolicy::Random);
    central.connect(&bench.relay);
    assert_eq!(bench.relay.stage(), Stage::MasterLinkEstablishing);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);
    let master_ltk = bench.relay.long_term_key(LinkId::MasterFacing).unwrap();
    let slave_ltk = bench.relay.long_term_key(LinkId::SlaveFacing).unwrap();
    assert_eq!(Some(master_ltk), central.long_term_key());
    assert_eq!(Some(slave_ltk), peripheral.long_term_key());
    assert_ne!(master_ltk, slave_ltk);
    assert!(bench.relay.failures().is_empty());
}

#[test]
fn traffic_waits_for_both_pairings() {
    let (paired, seen) = counter();
    let (early, early_seen) = counter();
    let bench = Bench::with_hooks(RelayConfig::new(target()), move |hooks| {
        hooks
            .on(EventKind::PairingComplete, move |_| {
                paired.fetch_add(1, Ordering::SeqCst);
                Flow::Continue
            })
            .on(EventKind::Forwarding, move |_| {
                if seen.load(Ordering::SeqCst) < 2 {
                    early.fetch_add(1, Ordering::SeqCst);
                }
                Flow::Continue
            });
    });
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    peripheral.send_att(&bench.relay, &[1]);

    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    central.connect(&bench.relay);
    central.send_att(&bench.relay, &[2]);
    peripheral.send_att(&bench.relay, &[3]);
    central.send_att(&bench.relay, &[4]);
    assert_eq!(bench.relay.pending(LinkId::SlaveFacing), 2);
    assert_eq!(bench.relay.pending(LinkId::MasterFacing), 2);
    assert!(bench.recorder.frames().is_empty());

    settle(&bench.relay, &mut [&mut central, &mut peripheral]);
    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);
    assert_eq!(early_seen.load(Ordering::SeqCst), 0);
    assert_eq!(bench.relay.pending(LinkId::SlaveFacing), 0);
    assert_eq!(bench.relay.pending(LinkId::MasterFacing), 0);
    assert_eq!(
        bench.recorder.frames(),
        vec![
            (LinkId::SlaveFacing, vec![1]),
            (LinkId::MasterFacing, vec![2]),
            (LinkId::SlaveFacing, vec![3]),
            (LinkId::MasterFacing, vec![4]),
        ]
    );
    assert_eq!(central.received, vec![vec![1], vec![3]]);
    assert_eq!(peripheral.received, vec![vec![2], vec![4]]);

    // Once active, frames go straight through.
    central.send_att(&bench.relay, &[5]);
    peripheral.pump(&bench.relay);
    assert_eq!(peripheral.received.last(), Some(&vec![5]));
}

#[test]
fn master_disconnect_during_pairing() {
    let bench = Bench::new(RelayConfig::new(target()));
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut peripheral]);

    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    central.connect(&bench.relay);
    central.send_att(&bench.relay, &[0xDE, 0xAD]);
    assert_eq!(bench.relay.machine_state(LinkId::MasterFacing), Some(State::RequestExchanged));

    central.disconnect(&bench.relay).unwrap();
    assert_eq!(bench.relay.stage(), Stage::WaitingForMaster);
    assert_eq!(bench.relay.machine_state(LinkId::MasterFacing), None);
    assert_eq!(bench.relay.pending(LinkId::MasterFacing), 0);
    // A completed slave-facing pairing survives.
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Complete));
    // Advertising is restarted with the cloned data.
    {
        let master = bench.master.state();
        assert_eq!(master.advertising.len(), 2);
        assert_eq!(master.advertising[1].data, ADV_DATA);
    }

    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);
    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);
    assert!(bench.recorder.frames().is_empty());
    assert_eq!(
        bench.relay.long_term_key(LinkId::MasterFacing),
        central.long_term_key()
    );
}

#[test]
fn master_disconnect_restarts_unfinished_slave_pairing() {
    let bench = Bench::new(RelayConfig::new(target()));
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    // The peripheral hasn't answered yet.
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::RequestExchanged));

    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    central.connect(&bench.relay);
    central.disconnect(&bench.relay).unwrap();

    // The relay started over with a new Pairing Request.
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::RequestExchanged));
    let requests = bench
        .slave
        .state()
        .sent
        .iter()
        .filter(|frame| frame.payload()[0] == 0x01)
        .count();
    assert_eq!(requests, 2);
}

#[test]
fn failure_on_one_link_is_isolated() {
    let mut config = RelayConfig::new(target());
    config.passkey = Some(passkey(111_111));
    config.master_features = LocalFeatures::new(IoCapabilities::DisplayOnly);
    let bench = Bench::new(config);
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    peripheral.send_att(&bench.relay, &[7]);

    let mut central = bench.central(IoCapabilities::KeyboardOnly, PasskeyPolicy::Fixed(passkey(222_222)));
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    assert_eq!(
        bench.relay.failures(),
        vec![Failure {
            link: LinkId::MasterFacing,
            state: State::PasskeyRounds,
            reason: Reason::ConfirmValueFailed,
        }]
    );
    assert_eq!(central.machine.state(), State::Failed);
    assert_eq!(central.failures.len(), 1);
    assert_eq!(central.failures[0].reason, Reason::ConfirmValueFailed);
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Complete));
    assert_eq!(bench.relay.stage(), Stage::MasterLinkEstablishing);
    assert_eq!(bench.relay.pending(LinkId::SlaveFacing), 1);
    assert!(bench.recorder.frames().is_empty());
}

#[test]
fn retry_on_same_connection() {
    let mut config = RelayConfig::new(target());
    config.passkey = Some(passkey(123_456));
    config.master_features = LocalFeatures::new(IoCapabilities::DisplayOnly);
    let bench = Bench::new(config);
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);

    let mut central = bench.central(IoCapabilities::KeyboardOnly, PasskeyPolicy::Fixed(passkey(654_321)));
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);
    assert_eq!(bench.relay.machine_state(LinkId::MasterFacing), Some(State::Failed));

    // The user typed the right passkey this time.
    central.machine.reset().unwrap();
    central.machine.set_passkey_policy(PasskeyPolicy::Fixed(passkey(123_456)));
    let actions = central.machine.initiate().unwrap();
    central.deliver(&bench.relay, actions);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);
    assert_eq!(bench.relay.failures().len(), 1);
}

#[test]
fn reflection_learns_passkey() {
    let key = passkey(314_159);
    let (recovered, recovered_seen) = counter();
    let mut config = RelayConfig::new(target());
    config.reflect_passkey = true;
    config.slave_features = LocalFeatures::new(IoCapabilities::KeyboardOnly);
    config.master_features = LocalFeatures::new(IoCapabilities::DisplayOnly);
    let bench = Bench::with_hooks(config, move |hooks| {
        hooks.on(EventKind::PasskeyRecovered, move |event| {
            if let Event::PasskeyRecovered { .. } = event {
                recovered.fetch_add(1, Ordering::SeqCst);
            }
            Flow::Continue
        });
    });
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::DisplayOnly, PasskeyPolicy::Fixed(key));
    peripheral.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut peripheral]);
    // Waiting for the first passkey bit.
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::PasskeyRounds));

    let mut central = bench.central(IoCapabilities::KeyboardOnly, PasskeyPolicy::Fixed(key));
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    assert_eq!(bench.relay.learned_passkey(), Some(key));
    assert_eq!(recovered_seen.load(Ordering::SeqCst), 1);
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Complete));
    assert_eq!(bench.relay.long_term_key(LinkId::SlaveFacing), peripheral.long_term_key());

    let failures = bench.relay.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].link, LinkId::MasterFacing);
    assert_eq!(failures[0].reason, Reason::DhKeyCheckFailed);
    assert_eq!(bench.relay.stage(), Stage::MasterLinkEstablishing);

    // The central tries again and now the relay knows the passkey.
    central.disconnect(&bench.relay).unwrap();
    assert_eq!(bench.relay.stage(), Stage::WaitingForMaster);
    let mut central = bench.central(IoCapabilities::KeyboardOnly, PasskeyPolicy::Fixed(key));
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);
    assert_eq!(bench.relay.machine_state(LinkId::MasterFacing), Some(State::Complete));
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Complete));

    // Same passkey on both links, yet each link has its own key.
    let master_ltk = bench.relay.long_term_key(LinkId::MasterFacing).unwrap();
    let slave_ltk = bench.relay.long_term_key(LinkId::SlaveFacing).unwrap();
    assert_eq!(Some(master_ltk), central.long_term_key());
    assert_eq!(Some(slave_ltk), peripheral.long_term_key());
    assert_ne!(master_ltk, slave_ltk);
}

#[test]
fn reflection_holds_confirms_until_slave_keys_exchanged() {
    let key = passkey(999_999);
    let mut config = RelayConfig::new(target());
    config.strategy = Strategy::Flood;
    config.reflect_passkey = true;
    config.slave_features = LocalFeatures::new(IoCapabilities::KeyboardOnly);
    config.master_features = LocalFeatures::new(IoCapabilities::DisplayOnly);
    let bench = Bench::new(config);
    bench.discover();
    assert!(bench.slave.state().connects.is_empty());

    let mut central = bench.central(IoCapabilities::KeyboardOnly, PasskeyPolicy::Fixed(key));
    central.connect(&bench.relay);
    assert_eq!(bench.slave.state().connects, vec![target()]);
    settle(&bench.relay, &mut [&mut central]);

    // The central's first commitment is held back.
    assert_eq!(bench.relay.machine_state(LinkId::MasterFacing), Some(State::PasskeyRounds));
    assert!(!central
        .commands
        .iter()
        .any(|cmd| matches!(cmd, Command::PairingConfirm(_))));

    let mut peripheral = bench.peripheral(IoCapabilities::DisplayOnly, PasskeyPolicy::Fixed(key));
    peripheral.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    assert_eq!(bench.relay.learned_passkey(), Some(key));
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Complete));
    assert_eq!(bench.relay.machine_state(LinkId::MasterFacing), Some(State::Failed));
}

#[test]
fn mirrors_pairing_request() {
    let mut config = RelayConfig::new(target());
    config.mirror_pairing_request = true;
    let bench = Bench::new(config);
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::KeyboardDisplay, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    assert!(bench.slave.state().sent.is_empty());
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Idle));

    let mut central = bench.central(IoCapabilities::DisplayYesNo, PasskeyPolicy::Random);
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    let request = peripheral.machine.parameters().unwrap().request;
    assert_eq!(request.io, IoCapabilities::DisplayYesNo);
    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);
}

#[test]
fn security_request_starts_pairing() {
    let mut config = RelayConfig::new(target());
    config.mirror_pairing_request = true;
    let bench = Bench::new(config);
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Idle));

    peripheral.send_command(&bench.relay, Command::SecurityRequest(AuthReq::secure_default()));
    settle(&bench.relay, &mut [&mut peripheral]);
    assert_eq!(bench.relay.machine_state(LinkId::SlaveFacing), Some(State::Complete));
}

#[test]
fn hooks_can_drop_frames() {
    let bench = Bench::with_hooks(RelayConfig::new(target()), |hooks| {
        hooks.on(EventKind::Forwarding, |event| match event {
            Event::Forwarding { frame, .. } if frame.payload() == [0xFF] => Flow::Skip,
            _ => Flow::Continue,
        });
    });
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);

    central.send_att(&bench.relay, &[0xFF]);
    central.send_att(&bench.relay, &[0x01]);
    assert_eq!(bench.recorder.frames(), vec![(LinkId::MasterFacing, vec![0x01])]);
}

#[test]
fn slave_disconnect_stops_active_relay() {
    let bench = Bench::new(RelayConfig::new(target()));
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    central.connect(&bench.relay);
    settle(&bench.relay, &mut [&mut central, &mut peripheral]);
    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);

    peripheral.disconnect(&bench.relay).unwrap();
    assert_eq!(bench.relay.stage(), Stage::Stopped);
    assert_eq!(
        bench.relay.handle_event(LinkId::MasterFacing, LinkEvent::Disconnected),
        Err(RelayError::Stopped)
    );
}

#[test]
fn malformed_pdu_is_rejected() {
    let bench = Bench::new(RelayConfig::new(target()));
    bench.discover();
    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    central.connect(&bench.relay);

    let truncated = vec![0x05, 0x00, 0x06, 0x00, 0x01];
    assert!(matches!(
        bench.relay.handle_event(LinkId::MasterFacing, LinkEvent::Pdu(truncated)),
        Err(RelayError::Codec(_))
    ));
    assert_eq!(bench.relay.stage(), Stage::MasterLinkEstablishing);
}

#[test]
fn concurrent_completion_activates_once() {
    let (activations, activations_seen) = counter();
    let bench = Bench::with_hooks(RelayConfig::new(target()), move |hooks| {
        hooks.on(EventKind::StageChanged, move |event| {
            if let Event::StageChanged { to: Stage::ActiveRelay, .. } = event {
                activations.fetch_add(1, Ordering::SeqCst);
            }
            Flow::Continue
        });
    });
    bench.discover();

    let mut peripheral = bench.peripheral(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    let mut central = bench.central(IoCapabilities::NoInputNoOutput, PasskeyPolicy::Random);
    peripheral.connect(&bench.relay);
    central.connect(&bench.relay);
    for i in 0..8u8 {
        peripheral.send_att(&bench.relay, &[0x10, i]);
        central.send_att(&bench.relay, &[0x20, i]);
    }

    let threads: Vec<_> = vec![peripheral, central]
        .into_iter()
        .map(|mut peer| {
            let relay = bench.relay.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(10);
                while relay.machine_state(peer.link) != Some(State::Complete) {
                    assert!(Instant::now() < deadline, "{} link didn't pair", peer.link);
                    if !peer.pump(&relay) {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(bench.relay.stage(), Stage::ActiveRelay);
    assert_eq!(activations_seen.load(Ordering::SeqCst), 1);
    let frames = bench.recorder.frames();
    assert_eq!(frames.len(), 16);
    for i in 0..8u8 {
        assert_eq!(
            frames.iter().filter(|(_, payload)| *payload == [0x10, i]).count(),
            1
        );
        assert_eq!(
            frames.iter().filter(|(_, payload)| *payload == [0x20, i]).count(),
            1
        );
    }
}

#[test]
fn event_loop_and_stage_waits() {
    let bench = Bench::new(RelayConfig::new(target()));
    let (events, mut inbox) = inbox(8);
    let cancel = Cancel::new();

    let worker = {
        let relay = bench.relay.clone();
        let cancel = cancel.clone();
        thread::spawn(move || relay.run_link(LinkId::SlaveFacing, &mut inbox, &cancel))
    };

    // Garbage is logged and skipped.
    events.send(LinkEvent::Pdu(vec![0x01])).unwrap();
    for (kind, data) in &[
        (AdvertisingKind::Primary, ADV_DATA),
        (AdvertisingKind::ScanResponse, SCAN_DATA),
    ] {
        events
            .send(LinkEvent::Advertisement(AdvertisingReport {
                address: target(),
                kind: *kind,
                data: data.to_vec(),
            }))
            .unwrap();
    }

    let result = bench
        .relay
        .wait_for_stage(Stage::WaitingForMaster, Duration::from_secs(5), &Cancel::new());
    assert_eq!(result, WaitResult::Ready(Stage::WaitingForMaster));
    assert_eq!(
        bench
            .relay
            .wait_for_stage(Stage::ActiveRelay, Duration::from_millis(30), &Cancel::new()),
        WaitResult::TimedOut
    );

    cancel.cancel();
    assert_eq!(worker.join().unwrap(), Ok(()));
}

#[test]
fn stop_ends_event_loop() {
    let bench = Bench::new(RelayConfig::new(target()));
    let (_events, mut inbox) = inbox::<LinkEvent>(8);
    let cancel = Cancel::new();

    let worker = {
        let relay = bench.relay.clone();
        thread::spawn(move || relay.run_link(LinkId::MasterFacing, &mut inbox, &cancel))
    };
    bench.relay.stop();
    assert_eq!(worker.join().unwrap(), Err(RelayError::Stopped));
    assert_eq!(
        bench
            .relay
            .wait_for_stage(Stage::ActiveRelay, Duration::from_secs(1), &Cancel::new()),
        WaitResult::Ready(Stage::Stopped)
    );
}

#[test]
fn closed_event_source_ends_event_loop() {
    let bench = Bench::new(RelayConfig::new(target()));
    let (events, mut inbox) = inbox::<LinkEvent>(8);
    events
        .send(LinkEvent::Connected {
            peer: central_address(),
        })
        .unwrap();
    drop(events);

    // Queued events are still handled before the loop notices.
    assert_eq!(
        bench
            .relay
            .run_link(LinkId::MasterFacing, &mut inbox, &Cancel::new()),
        Ok(())
    );
    assert_eq!(bench.relay.machine_state(LinkId::MasterFacing), Some(State::Idle));
    assert_eq!(bench.relay.stage(), Stage::Scanning);
}

/// An RNG that is out of entropy.
#[derive(Clone)]
struct DeadRng;

impl RngCore for DeadRng {
    fn next_u32(&mut self) -> u32 {
        0
    }

    fn next_u64(&mut self) -> u64 {
        0
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.iter_mut().for_each(|b| *b = 0);
    }

    fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand_core::Error> {
        Err(rand_core::Error::from(core::num::NonZeroU32::new(rand_core::Error::CUSTOM_START).unwrap()))
    }
}

impl CryptoRng for DeadRng {}

struct DeadRngConfig;

impl Config for DeadRngConfig {
    type Ecdh = P256Provider;
    type Rng = DeadRng;
    type Link = MockLink;
    type Forwarder = PassThrough;
}

#[test]
fn rng_failure_stops_relay() {
    let master = MockLink::default();
    let relay: Relay<DeadRngConfig> = Relay::new(
        RelayConfig::new(target()),
        P256Provider::new(),
        DeadRng,
        MockLink::default(),
        master.clone(),
        PassThrough,
    );
    master.state().connected = true;

    let result = relay.handle_event(LinkId::MasterFacing, LinkEvent::Connected { peer: central_address() });
    assert_eq!(result, Err(RelayError::Fatal(SessionError::Rng)));
    assert_eq!(relay.stage(), Stage::Stopped);
}
