//! Pairing method selection (Core Spec Vol 3, Part H, 2.3.5.1).

use super::{pdu::PairingFeatures, IoCapabilities, KeyDistribution, Reason, Role};
use crate::link::DeviceAddress;

/// Smallest encryption key size that is accepted.
pub const MIN_KEY_SIZE: u8 = 7;

/// Largest encryption key size, and the one we ask for.
pub const MAX_KEY_SIZE: u8 = 16;

/// What a device does with the passkey in *Passkey Entry*.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PasskeyRole {
    /// The device shows the passkey.
    Display,
    /// The user types the passkey into the device.
    Input,
}

/// The kind of user interaction a pairing method needs, ignoring who does what.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    JustWorks,
    NumericComparison,
    PasskeyEntry,
    OutOfBand,
}

/// The association model used to authenticate the key exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PairingMethod {
    /// No MITM protection: Numeric Comparison without asking the user.
    JustWorks,
    /// Both devices show a 6-digit value that the user confirms.
    NumericComparison,
    /// A 6-digit passkey is shown on one device and typed into the other, or typed into both.
    PasskeyEntry {
        initiator: PasskeyRole,
        responder: PasskeyRole,
    },
    /// Nonces and confirm values are exchanged out of band.
    OutOfBand,
}

impl PairingMethod {
    /// Returns the method's category.
    pub fn category(&self) -> Category {
        match self {
            PairingMethod::JustWorks => Category::JustWorks,
            PairingMethod::NumericComparison => Category::NumericComparison,
            PairingMethod::PasskeyEntry { .. } => Category::PasskeyEntry,
            PairingMethod::OutOfBand => Category::OutOfBand,
        }
    }

    /// Returns what `role` does with the passkey, if this is Passkey Entry.
    pub fn passkey_role(&self, role: Role) -> Option<PasskeyRole> {
        match (self, role) {
            (PairingMethod::PasskeyEntry { initiator, .. }, Role::Initiator) => Some(*initiator),
            (PairingMethod::PasskeyEntry { responder, .. }, Role::Responder) => Some(*responder),
            _ => None,
        }
    }

    /// Returns whether the resulting keys are protected against MITM attacks.
    pub fn is_authenticated(&self) -> bool {
        *self != PairingMethod::JustWorks
    }
}

/// Selection failure: one of the devices only supports *LE Legacy Pairing*.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnsupportedLegacyPairing;

/// Selects the pairing method from the features of initiator and responder.
///
/// Out-of-Band is used if both sides have OOB data. Otherwise, if neither side asks for MITM
/// protection, Just Works is used. Otherwise the IO capabilities decide.
pub fn select(
    initiator: &PairingFeatures,
    responder: &PairingFeatures,
) -> Result<PairingMethod, UnsupportedLegacyPairing> {
    if !initiator.auth_req.secure_connection() || !responder.auth_req.secure_connection() {
        return Err(UnsupportedLegacyPairing);
    }

    if initiator.oob && responder.oob {
        return Ok(PairingMethod::OutOfBand);
    }

    if !initiator.auth_req.mitm() && !responder.auth_req.mitm() {
        return Ok(PairingMethod::JustWorks);
    }

    Ok(by_io_capabilities(initiator.io, responder.io))
}

/// The IO capability mapping for *LE Secure Connections* (Core Spec Vol 3, Part H, Table 2.8).
pub fn by_io_capabilities(initiator: IoCapabilities, responder: IoCapabilities) -> PairingMethod {
    use self::PasskeyRole::*;
    use IoCapabilities::*;

    // Reserved values have no capabilities we could rely on.
    let known = |io: IoCapabilities| match io {
        IoCapabilities::Unknown(_) => NoInputNoOutput,
        io => io,
    };
    let passkey = |initiator: PasskeyRole, responder: PasskeyRole| PairingMethod::PasskeyEntry {
        initiator,
        responder,
    };

    match (known(initiator), known(responder)) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => PairingMethod::JustWorks,
        (DisplayOnly, DisplayOnly) | (DisplayOnly, DisplayYesNo) | (DisplayYesNo, DisplayOnly) => {
            PairingMethod::JustWorks
        }
        (DisplayYesNo, DisplayYesNo)
        | (DisplayYesNo, KeyboardDisplay)
        | (KeyboardDisplay, DisplayYesNo)
        | (KeyboardDisplay, KeyboardDisplay) => PairingMethod::NumericComparison,
        (KeyboardOnly, KeyboardOnly) => passkey(Input, Input),
        (KeyboardOnly, _) => passkey(Input, Display),
        (_, KeyboardOnly) => passkey(Display, Input),
        (DisplayOnly, KeyboardDisplay) => passkey(Display, Input),
        (KeyboardDisplay, DisplayOnly) => passkey(Input, Display),
        _ => PairingMethod::JustWorks,
    }
}

/// Everything negotiated by the Pairing Request/Response exchange.
///
/// Immutable for the rest of the attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PairingParameters {
    /// The Pairing Request sent by the initiator.
    pub request: PairingFeatures,
    /// The Pairing Response sent by the responder.
    pub response: PairingFeatures,
    /// The initiator's address (`A` in `f5`/`f6`).
    pub initiator_address: DeviceAddress,
    /// The responder's address (`B` in `f5`/`f6`).
    pub responder_address: DeviceAddress,
    /// The selected pairing method.
    pub method: PairingMethod,
    /// Negotiated encryption key size in Bytes.
    pub key_size: u8,
    /// Keys the initiator will distribute.
    pub initiator_keys: KeyDistribution,
    /// Keys the responder will distribute.
    pub responder_keys: KeyDistribution,
}

impl PairingParameters {
    /// Validates a request/response pair and selects the pairing method.
    ///
    /// Returns the reason to fail pairing with if the two are incompatible.
    pub fn negotiate(
        request: PairingFeatures,
        response: PairingFeatures,
        initiator_address: DeviceAddress,
        responder_address: DeviceAddress,
    ) -> Result<Self, Reason> {
        for features in &[request, response] {
            if let IoCapabilities::Unknown(_) = features.io {
                return Err(Reason::InvalidParameters);
            }
            if features.max_key_size > MAX_KEY_SIZE {
                return Err(Reason::InvalidParameters);
            }
        }

        let method =
            select(&request, &response).map_err(|_| Reason::AuthenticationRequirements)?;

        let key_size = request.max_key_size.min(response.max_key_size);
        if key_size < MIN_KEY_SIZE {
            return Err(Reason::EncryptionKeySize);
        }

        Ok(Self {
            request,
            response,
            initiator_address,
            responder_address,
            method,
            key_size,
            initiator_keys: request.initiator_dist & response.initiator_dist,
            responder_keys: request.responder_dist & response.responder_dist,
        })
    }

    /// Returns the `A1` input of `f5`/`f6`, the initiator address.
    pub fn a1(&self) -> [u8; 7] {
        self.initiator_address.to_toolbox_bytes()
    }

    /// Returns the `A2` input of `f5`/`f6`, the responder address.
    pub fn a2(&self) -> [u8; 7] {
        self.responder_address.to_toolbox_bytes()
    }

    /// Returns the `IOcap` value of `role`.
    pub fn iocap(&self, role: Role) -> [u8; 3] {
        match role {
            Role::Initiator => self.request.iocap(),
            Role::Responder => self.response.iocap(),
        }
    }

    /// Returns the keys `role` sends over the Security Manager channel.
    pub fn keys_sent_by(&self, role: Role) -> KeyDistribution {
        match role {
            Role::Initiator => self.initiator_keys.transmitted(),
            Role::Responder => self.responder_keys.transmitted(),
        }
    }
}
