//! The LE Security Manager protocol, Secure Connections only.
//!
//! The Security Manager is a mandatory part of BLE and is connected to L2CAP channel `0x0006` when
//! the Link-Layer connection is established.
//!
//! # BLE Security
//!
//! As is tradition, BLE security is a complexity nightmare. This section hopes to clear up a few
//! things and tries to define terms used throughout the code and specficiation.
//!
//! ## Pairing and Bonding
//!
//! * **Pairing** is the process of generating and exchanging connection-specific keys in order to
//!   accomplish an encrypted Link-Layer connection.
//!
//!   This is done by having the *Security Managers* of the devices talk to each other to perform
//!   the key exchange, and then using *LL Control PDUs* to enable the negotiated encryption
//!   parameters.
//!
//! * **Bonding** means permanently storing the shared keys derived by *Pairing* in order to reuse
//!   them for later connections. The relay does not store anything, but the distributed keys and
//!   the LTK of each link can be exported.
//!
//! ## LE Secure Connections pairing
//!
//! Added with BLE 4.2, this finally uses established cryptography to do everything. It uses ECDH on
//! the P-256 curve (aka "secp256r1" or "prime256v1"). *LE Legacy Pairing* is not supported: a peer
//! that does not set the SC bit in its authentication requirements is rejected.
//!
//! Using ECDH immediately protects against passive eavesdropping. MITM-protection depends on the
//! user confirmation process:
//!
//! * *"Just Works"*: No MITM-protection. Uses the *Numeric Comparison* protocol internally, with
//!   automatic confirmation.
//! * *Numeric Comparison*: Both devices display a 6-digit confirmation value and the user is
//!   required to compare them and confirm on each device if they're equal.
//! * *Passkey Entry*: Either a generated passkey is displayed on one device and input on the other,
//!   or the user inputs the same passkey into both devices. The passkey is committed to one bit at
//!   a time over 20 rounds (see [`passkey`]).
//! * *Out-of-Band* (OOB): An Out-of-Band mechanism is used to exchange random nonces and confirm
//!   values. No OOB channel is available here, so selecting it fails pairing.
//!
//! A relay sitting between two devices runs two independent pairings, one per link, and ends up
//! with a different LTK on each. Passkey Entry is the only method that resists this, unless the
//! passkey can be learned from the real central first (see [`passkey::Reflector`]).
//!
//! ## Layout
//!
//! * [`pdu`]: Security Manager commands and the failure reason taxonomy.
//! * [`toolbox`]: AES-CMAC and the `f4`, `f5`, `f6`, `g2` and `ah` functions.
//! * [`session`]: Key material of one pairing attempt.
//! * [`method`]: Pairing method selection.
//! * [`passkey`]: The Passkey Entry bit commitment rounds.
//! * [`machine`]: The per-link pairing state machine, tying everything together.
//!
//! [`pdu`]: pdu/index.html
//! [`toolbox`]: toolbox/index.html
//! [`session`]: session/index.html
//! [`method`]: method/index.html
//! [`passkey`]: passkey/index.html
//! [`passkey::Reflector`]: passkey/struct.Reflector.html
//! [`machine`]: machine/index.html

pub mod machine;
pub mod method;
pub mod passkey;
pub mod pdu;
pub mod session;
pub mod toolbox;

pub use self::machine::{
    Action, Failure, Identity, LocalFeatures, PairingStateMachine, PasskeyPolicy, PeerKeys, State,
};
pub use self::method::{PairingMethod, PairingParameters};
pub use self::passkey::Passkey;
pub use self::pdu::{Command, PairingFeatures, Reason};
pub use self::session::{CryptoSession, SessionError};

use bitflags::bitflags;
use core::fmt;

/// The part a device plays in the pairing procedure.
///
/// The initiator is always the central (link-layer master). When relaying, the relay is the
/// initiator on the link to the real peripheral and the responder on the link to the real central.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

enum_with_unknown! {
    /// Describes the I/O capabilities of a device that can be used for the pairing process.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum IoCapabilities(u8) {
        /// Device can display a 6-digit number, but has no input capabilities.
        DisplayOnly = 0x00,

        /// Device can display a 6-digit number and the user can input "Yes" or "No".
        DisplayYesNo = 0x01,

        /// Device does not have output capability, but the user can input a passcode.
        KeyboardOnly = 0x02,

        /// Device has no meaningful input and output capabilities.
        NoInputNoOutput = 0x03,

        /// Device can display a 6-digit passcode and allows passcode entry via a keyboard.
        KeyboardDisplay = 0x04,
    }
}

impl IoCapabilities {
    /// Returns whether the device can display a 6-digit number.
    pub fn has_display(self) -> bool {
        match self {
            IoCapabilities::DisplayOnly
            | IoCapabilities::DisplayYesNo
            | IoCapabilities::KeyboardDisplay => true,
            _ => false,
        }
    }

    /// Returns whether the user can type a passkey on the device.
    pub fn has_keyboard(self) -> bool {
        match self {
            IoCapabilities::KeyboardOnly | IoCapabilities::KeyboardDisplay => true,
            _ => false,
        }
    }
}

/// Authentication requirements exchanged during pairing requests.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AuthReq(u8);

impl AuthReq {
    const BITS_BONDING: u8 = 0b0000_0011;
    const BITS_MITM: u8 = 0b0000_0100;
    const BITS_SC: u8 = 0b0000_1000;
    const BITS_KEYPRESS: u8 = 0b0001_0000;
    const BITS_CT2: u8 = 0b0010_0000;

    /// Creates an `AuthReq` from its raw representation.
    ///
    /// Reserved bits are kept so that mirrored requests are forwarded unchanged.
    pub fn from_raw(raw: u8) -> Self {
        AuthReq(raw)
    }

    /// Returns the raw octet sent in Pairing Request/Response PDUs.
    pub fn to_raw(self) -> u8 {
        self.0
    }

    /// Returns the *LE Secure Connections* requirements used by default: bonding, MITM protection
    /// and SC requested.
    pub fn secure_default() -> Self {
        let mut auth = AuthReq(0);
        auth.set_bonding_type(BondingType::Bonding);
        auth.set_mitm(true);
        auth.set_secure_connection(true);
        auth
    }

    /// Returns the requested bonding.
    pub fn bonding_type(&self) -> BondingType {
        BondingType::from(self.0 & Self::BITS_BONDING)
    }

    pub fn set_bonding_type(&mut self, ty: BondingType) {
        self.0 = (self.0 & !Self::BITS_BONDING) | (u8::from(ty) & Self::BITS_BONDING);
    }

    /// Returns whether MITM protection is requested.
    pub fn mitm(&self) -> bool {
        self.0 & Self::BITS_MITM != 0
    }

    pub fn set_mitm(&mut self, mitm: bool) {
        self.set_bit(Self::BITS_MITM, mitm);
    }

    /// Returns whether *LE Secure Connection* pairing is supported and requested.
    ///
    /// If this returns `false`, the peer wants *LE Legacy Pairing*, which is rejected.
    pub fn secure_connection(&self) -> bool {
        self.0 & Self::BITS_SC != 0
    }

    /// Sets whether *LE Secure Connection* pairing is supported and requested.
    pub fn set_secure_connection(&mut self, sc: bool) {
        self.set_bit(Self::BITS_SC, sc);
    }

    pub fn keypress(&self) -> bool {
        self.0 & Self::BITS_KEYPRESS != 0
    }

    pub fn set_keypress(&mut self, keypress: bool) {
        self.set_bit(Self::BITS_KEYPRESS, keypress);
    }

    /// Returns whether the `h7` function is supported for cross-transport key derivation.
    pub fn ct2(&self) -> bool {
        self.0 & Self::BITS_CT2 != 0
    }

    pub fn set_ct2(&mut self, ct2: bool) {
        self.set_bit(Self::BITS_CT2, ct2);
    }

    fn set_bit(&mut self, bit: u8, value: bool) {
        self.0 = (self.0 & !bit) | if value { bit } else { 0 };
    }
}

impl fmt::Debug for AuthReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthReq")
            .field("bonding_type", &self.bonding_type())
            .field("mitm", &self.mitm())
            .field("secure_connection", &self.secure_connection())
            .field("keypress", &self.keypress())
            .field("ct2", &self.ct2())
            .finish()
    }
}

enum_with_unknown! {
    /// Whether to perform bonding in addition to pairing.
    ///
    /// If `Bonding` is selected, the exchanged keys are permanently stored on both devices. This
    /// is usually what you want.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum BondingType(u8) {
        /// No bonding should be performed; the exchanged keys should not be permanently stored.
        ///
        /// This is usually not what you want since it requires the user to perform pairing every
        /// time the devices connect again.
        NoBonding = 0b00,

        /// Permanently store the exchanged keys to allow resuming encryption on future connections.
        Bonding = 0b01,
    }
}

bitflags! {
    /// Indicates which types of keys a device requests for distribution.
    ///
    /// With *LE Secure Connections*, `ENC_KEY` and `LINK_KEY` don't result in any transmitted key:
    /// the LTK is derived by both sides and there is no BR/EDR transport.
    pub struct KeyDistribution: u8 {
        const ENC_KEY = (1 << 0);
        const ID_KEY = (1 << 1);
        const SIGN_KEY = (1 << 2);
        const LINK_KEY = (1 << 3);
    }
}

impl KeyDistribution {
    /// Returns the subset of keys that is actually sent over the Security Manager channel.
    pub fn transmitted(self) -> Self {
        self & (KeyDistribution::ID_KEY | KeyDistribution::SIGN_KEY)
    }
}
