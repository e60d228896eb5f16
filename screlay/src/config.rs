//! Relay configuration.
//!
//! Like the rest of the crate, configuration comes in two layers: a [`Config`] trait selecting the
//! *types* the relay is built from (ECDH provider, RNG, links and forwarder), and a plain
//! [`RelayConfig`] value holding everything that can change from one run to the next.
//!
//! [`Config`]: trait.Config.html
//! [`RelayConfig`]: struct.RelayConfig.html

use crate::{
    ecdh::EcdhProvider,
    link::{AddressKind, DeviceAddress, Link},
    relay::Forwarder,
    security::{IoCapabilities, LocalFeatures, Passkey},
};
use rand_core::{CryptoRng, RngCore};
use std::time::Duration;

/// Trait for relay configurations.
///
/// Every application must define a type implementing this trait and supply it to the relay.
pub trait Config {
    /// The P-256 implementation. Every pairing attempt gets its own clone.
    type Ecdh: EcdhProvider + Clone + Send;

    /// Randomness for key pairs, nonces and passkeys. Every pairing attempt gets its own clone.
    type Rng: RngCore + CryptoRng + Clone + Send;

    /// The Link-Layer connection type used for both links.
    type Link: Link;

    /// Receives application traffic once both links are paired.
    type Forwarder: Forwarder;
}

/// When the slave-facing link connects to the real peripheral.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Connect as soon as the advertising data has been cloned.
    ///
    /// The real peripheral stops advertising, so the real central can only find the relay.
    Preconnect,
    /// Connect once the real central has connected to the relay.
    Flood,
}

/// Runtime configuration of a [`Relay`].
///
/// [`Relay`]: ../relay/struct.Relay.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// The real peripheral to impersonate.
    pub target: DeviceAddress,
    pub strategy: Strategy,
    /// Advertise with the target's address on the master-facing link.
    pub spoof_slave_address: bool,
    /// Address to use on the slave-facing link instead of `slave_address`, typically the real
    /// central's.
    pub spoof_master_address: Option<DeviceAddress>,
    pub advertising_interval: Duration,
    /// The relay's own address on the slave-facing link.
    pub slave_address: DeviceAddress,
    /// The relay's own address on the master-facing link, unless spoofing.
    pub master_address: DeviceAddress,
    /// Features used when pairing with the real peripheral (relay is initiator).
    pub slave_features: LocalFeatures,
    /// Features used when pairing with the real central (relay is responder).
    pub master_features: LocalFeatures,
    /// Passkey to use on both links, if known in advance.
    pub passkey: Option<Passkey>,
    /// Learn the passkey from the real central by reflecting its commitments.
    pub reflect_passkey: bool,
    /// Start pairing with the real peripheral only when the real central sends its Pairing
    /// Request, and copy its features.
    pub mirror_pairing_request: bool,
    /// Start pairing when the real peripheral sends a Security Request.
    pub pair_on_security_request: bool,
    /// How often blocking waits check for cancellation.
    pub stage_poll_interval: Duration,
}

impl RelayConfig {
    /// Creates a configuration relaying to `target`, with Just Works capable defaults.
    pub fn new(target: DeviceAddress) -> Self {
        Self {
            target,
            strategy: Strategy::Preconnect,
            spoof_slave_address: true,
            spoof_master_address: None,
            advertising_interval: Duration::from_millis(100),
            slave_address: DeviceAddress::new([0x01, 0x00, 0x00, 0x0D, 0x1E, 0xC0], AddressKind::Random),
            master_address: DeviceAddress::new([0x02, 0x00, 0x00, 0x0D, 0x1E, 0xC0], AddressKind::Random),
            slave_features: LocalFeatures::new(IoCapabilities::NoInputNoOutput),
            master_features: LocalFeatures::new(IoCapabilities::NoInputNoOutput),
            passkey: None,
            reflect_passkey: false,
            mirror_pairing_request: false,
            pair_on_security_request: true,
            stage_poll_interval: Duration::from_millis(20),
        }
    }

    /// Returns the address the relay uses towards the real central.
    pub fn master_facing_address(&self) -> DeviceAddress {
        if self.spoof_slave_address {
            self.target
        } else {
            self.master_address
        }
    }

    /// Returns the address the relay uses towards the real peripheral.
    pub fn slave_facing_address(&self) -> DeviceAddress {
        self.spoof_master_address.unwrap_or(self.slave_address)
    }
}
