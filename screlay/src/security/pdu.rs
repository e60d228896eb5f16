//! Security Manager Protocol PDUs.
//!
//! Every command starts with a 1-byte code, followed by a fixed-size payload. Lengths are checked
//! exactly: a short PDU fails with `Error::Eof`, trailing data with `Error::IncompleteParse`.
//!
//! Keys, nonces and MAC values are sent LSB first but stored big-endian in [`Command`], so they can
//! be passed to the [`toolbox`] as-is.
//!
//! [`Command`]: enum.Command.html
//! [`toolbox`]: ../toolbox/index.html

use {
    super::{AuthReq, IoCapabilities, KeyDistribution},
    crate::{
        bytes::*,
        ecdh::PublicKey,
        link::{AddressKind, DeviceAddress},
        utils::HexString,
        Error,
    },
    core::fmt,
};

/// The largest SMP PDU (Pairing Public Key), which is also the minimum MTU for the SM channel.
pub const MAX_PDU_SIZE: usize = 65;

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum CommandCode(u8) {
        PairingRequest = 0x01,
        PairingResponse = 0x02,
        PairingConfirm = 0x03,
        PairingRandom = 0x04,
        PairingFailed = 0x05,
        EncryptionInformation = 0x06,
        MasterIdentification = 0x07,
        IdentityInformation = 0x08,
        IdentityAddressInformation = 0x09,
        SigningInformation = 0x0A,
        SecurityRequest = 0x0B,
        PairingPublicKey = 0x0C,
        PairingDhKeyCheck = 0x0D,
        PairingKeypressNotification = 0x0E,
    }
}

/// Pairing feature exchange payload, shared by Pairing Request and Pairing Response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PairingFeatures {
    /// The I/O capabilities of the sending device.
    pub io: IoCapabilities,
    /// Whether the sending device has OOB pairing data available.
    pub oob: bool,
    /// Authentication requirements of the sending device.
    pub auth_req: AuthReq,
    /// Maximum supported encryption key size in range 7..=16 Bytes.
    pub max_key_size: u8,
    /// Set of keys the initiator wants to distribute to the responder.
    pub initiator_dist: KeyDistribution,
    /// Set of keys the initiator requests the responder to generate and distribute.
    pub responder_dist: KeyDistribution,
}

impl PairingFeatures {
    /// Returns the `IOcap` input of the `f6` function: `AuthReq || OOB || IO`, MSB first.
    pub fn iocap(&self) -> [u8; 3] {
        [self.auth_req.to_raw(), u8::from(self.oob), u8::from(self.io)]
    }

    fn decode(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            io: IoCapabilities::from(bytes.read_u8()?),
            oob: match bytes.read_u8()? {
                0x00 => false,
                0x01 => true,
                _ => return Err(Error::InvalidValue),
            },
            auth_req: AuthReq::from_raw(bytes.read_u8()?),
            max_key_size: bytes.read_u8()?,
            initiator_dist: KeyDistribution::from_bits_truncate(bytes.read_u8()?),
            responder_dist: KeyDistribution::from_bits_truncate(bytes.read_u8()?),
        })
    }

    fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.io.into())?;
        writer.write_u8(self.oob.into())?;
        writer.write_u8(self.auth_req.to_raw())?;
        writer.write_u8(self.max_key_size)?;
        writer.write_u8(self.initiator_dist.bits())?;
        writer.write_u8(self.responder_dist.bits())
    }
}

/// An SMP command.
///
/// Byte strings are stored big-endian.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Command {
    /// `0x01` Pairing Request, sent by the initiator.
    PairingRequest(PairingFeatures),
    /// `0x02` Pairing Response, sent by the responder.
    PairingResponse(PairingFeatures),
    /// `0x03` Pairing Confirm, carrying a confirm value computed with `f4`.
    PairingConfirm([u8; 16]),
    /// `0x04` Pairing Random, revealing the nonce used for the previous confirm value.
    PairingRandom([u8; 16]),
    /// `0x05` Pairing Failed.
    PairingFailed(Reason),
    /// `0x06` Encryption Information (legacy LTK distribution).
    EncryptionInformation([u8; 16]),
    /// `0x07` Master Identification (legacy EDIV/Rand).
    MasterIdentification { ediv: u16, rand: u64 },
    /// `0x08` Identity Information, distributing the IRK.
    IdentityInformation([u8; 16]),
    /// `0x09` Identity Address Information.
    IdentityAddressInformation(DeviceAddress),
    /// `0x0A` Signing Information, distributing the CSRK.
    SigningInformation([u8; 16]),
    /// `0x0B` Security Request, sent by a peripheral to ask the central to pair.
    SecurityRequest(AuthReq),
    /// `0x0C` Pairing Public Key.
    PairingPublicKey(PublicKey),
    /// `0x0D` Pairing DHKey Check, computed with `f6`.
    PairingDhKeyCheck([u8; 16]),
    /// `0x0E` Keypress Notification.
    KeypressNotification(KeypressKind),
    /// A command with an unknown or reserved code. The payload is not retained.
    Unsupported(u8),
}

impl Command {
    /// Returns the command code of this PDU.
    pub fn code(&self) -> CommandCode {
        match self {
            Command::PairingRequest(_) => CommandCode::PairingRequest,
            Command::PairingResponse(_) => CommandCode::PairingResponse,
            Command::PairingConfirm(_) => CommandCode::PairingConfirm,
            Command::PairingRandom(_) => CommandCode::PairingRandom,
            Command::PairingFailed(_) => CommandCode::PairingFailed,
            Command::EncryptionInformation(_) => CommandCode::EncryptionInformation,
            Command::MasterIdentification { .. } => CommandCode::MasterIdentification,
            Command::IdentityInformation(_) => CommandCode::IdentityInformation,
            Command::IdentityAddressInformation(_) => CommandCode::IdentityAddressInformation,
            Command::SigningInformation(_) => CommandCode::SigningInformation,
            Command::SecurityRequest(_) => CommandCode::SecurityRequest,
            Command::PairingPublicKey(_) => CommandCode::PairingPublicKey,
            Command::PairingDhKeyCheck(_) => CommandCode::PairingDhKeyCheck,
            Command::KeypressNotification(_) => CommandCode::PairingKeypressNotification,
            Command::Unsupported(code) => CommandCode::Unknown(*code),
        }
    }

    /// Decodes a complete SMP PDU.
    pub fn decode(pdu: &[u8]) -> Result<Self, Error> {
        let mut bytes = ByteReader::new(pdu);
        let cmd = Self::from_bytes(&mut bytes)?;
        bytes.finish()?;
        Ok(cmd)
    }

    /// Encodes this command into a stack buffer.
    pub fn encode(&self) -> Result<heapless::Vec<u8, MAX_PDU_SIZE>, Error> {
        encode(self)
    }
}

impl<'a> FromBytes<'a> for Command {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let code = CommandCode::from(bytes.read_u8()?);
        Ok(match code {
            CommandCode::PairingRequest => Command::PairingRequest(PairingFeatures::decode(bytes)?),
            CommandCode::PairingResponse => {
                Command::PairingResponse(PairingFeatures::decode(bytes)?)
            }
            CommandCode::PairingConfirm => Command::PairingConfirm(bytes.read_reversed()?),
            CommandCode::PairingRandom => Command::PairingRandom(bytes.read_reversed()?),
            CommandCode::PairingFailed => Command::PairingFailed(Reason::from(bytes.read_u8()?)),
            CommandCode::EncryptionInformation => {
                Command::EncryptionInformation(bytes.read_reversed()?)
            }
            CommandCode::MasterIdentification => Command::MasterIdentification {
                ediv: bytes.read_u16_le()?,
                rand: bytes.read_u64_le()?,
            },
            CommandCode::IdentityInformation => {
                Command::IdentityInformation(bytes.read_reversed()?)
            }
            CommandCode::IdentityAddressInformation => {
                let kind = AddressKind::from_u8(bytes.read_u8()?);
                let raw = bytes.read_array()?;
                Command::IdentityAddressInformation(DeviceAddress::new(raw, kind))
            }
            CommandCode::SigningInformation => Command::SigningInformation(bytes.read_reversed()?),
            CommandCode::SecurityRequest => {
                Command::SecurityRequest(AuthReq::from_raw(bytes.read_u8()?))
            }
            CommandCode::PairingPublicKey => {
                let x = bytes.read_reversed()?;
                let y = bytes.read_reversed()?;
                Command::PairingPublicKey(PublicKey::from_coordinates(&x, &y))
            }
            CommandCode::PairingDhKeyCheck => Command::PairingDhKeyCheck(bytes.read_reversed()?),
            CommandCode::PairingKeypressNotification => {
                Command::KeypressNotification(KeypressKind::from(bytes.read_u8()?))
            }
            CommandCode::Unknown(code) => {
                bytes.read_rest();
                Command::Unsupported(code)
            }
        })
    }
}

impl ToBytes for Command {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.code().into())?;
        match self {
            Command::PairingRequest(features) | Command::PairingResponse(features) => {
                features.encode(writer)
            }
            Command::PairingConfirm(value)
            | Command::PairingRandom(value)
            | Command::EncryptionInformation(value)
            | Command::IdentityInformation(value)
            | Command::SigningInformation(value)
            | Command::PairingDhKeyCheck(value) => writer.write_reversed(value),
            Command::PairingFailed(reason) => writer.write_u8((*reason).into()),
            Command::MasterIdentification { ediv, rand } => {
                writer.write_u16_le(*ediv)?;
                writer.write_u64_le(*rand)
            }
            Command::IdentityAddressInformation(addr) => {
                writer.write_u8(addr.kind().to_u8())?;
                writer.write_slice(addr.raw())
            }
            Command::SecurityRequest(auth_req) => writer.write_u8(auth_req.to_raw()),
            Command::PairingPublicKey(key) => {
                writer.write_reversed(&key.x())?;
                writer.write_reversed(&key.y())
            }
            Command::KeypressNotification(kind) => writer.write_u8((*kind).into()),
            Command::Unsupported(_) => Ok(()),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::PairingRequest(features) => {
                f.debug_tuple("PairingRequest").field(features).finish()
            }
            Command::PairingResponse(features) => {
                f.debug_tuple("PairingResponse").field(features).finish()
            }
            Command::PairingConfirm(value) => {
                write!(f, "PairingConfirm({})", HexString(&value[..]))
            }
            Command::PairingRandom(_) => f.write_str("PairingRandom(<nonce>)"),
            Command::PairingFailed(reason) => f.debug_tuple("PairingFailed").field(reason).finish(),
            Command::EncryptionInformation(_) => f.write_str("EncryptionInformation(<ltk>)"),
            Command::MasterIdentification { ediv, .. } => f
                .debug_struct("MasterIdentification")
                .field("ediv", ediv)
                .finish(),
            Command::IdentityInformation(_) => f.write_str("IdentityInformation(<irk>)"),
            Command::IdentityAddressInformation(addr) => f
                .debug_tuple("IdentityAddressInformation")
                .field(addr)
                .finish(),
            Command::SigningInformation(_) => f.write_str("SigningInformation(<csrk>)"),
            Command::SecurityRequest(auth) => f.debug_tuple("SecurityRequest").field(auth).finish(),
            Command::PairingPublicKey(key) => f.debug_tuple("PairingPublicKey").field(key).finish(),
            Command::PairingDhKeyCheck(value) => {
                write!(f, "PairingDhKeyCheck({})", HexString(&value[..]))
            }
            Command::KeypressNotification(kind) => {
                f.debug_tuple("KeypressNotification").field(kind).finish()
            }
            Command::Unsupported(code) => write!(f, "Unsupported({:#04x})", code),
        }
    }
}

enum_with_unknown! {
    /// Passkey entry progress reported by a device with a keyboard.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum KeypressKind(u8) {
        EntryStarted = 0,
        DigitEntered = 1,
        DigitErased = 2,
        Cleared = 3,
        EntryCompleted = 4,
    }
}

enum_with_unknown! {
    /// Reason code carried by a Pairing Failed PDU.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum Reason(u8) {
        /// The user input of passkey failed, for example, the user cancelled the operation.
        PasskeyEntryFailed = 0x01,
        /// The OOB data is not available.
        OobNotAvailable = 0x02,
        /// The pairing procedure cannot be performed as authentication requirements cannot be met
        /// due to IO capabilities of one or both devices.
        ///
        /// Also sent when the peer asks for *LE Legacy Pairing*.
        AuthenticationRequirements = 0x03,
        /// The confirm value does not match the calculated compare value.
        ConfirmValueFailed = 0x04,
        /// Pairing is not supported by the device.
        PairingNotSupported = 0x05,
        /// The resultant encryption key size is insufficient for the security requirements of this
        /// device.
        EncryptionKeySize = 0x06,
        /// The SMP command received is not supported on this device.
        CommandNotSupported = 0x07,
        /// Pairing failed due to an unspecified reason.
        ///
        /// Used for PDUs that are not expected in the current state.
        UnspecifiedReason = 0x08,
        /// Pairing or authentication procedure is disallowed because too little time has elapsed
        /// since last pairing request or security request.
        RepeatedAttempts = 0x09,
        /// The Invalid Parameters error code indicates that the command length is invalid or that a
        /// parameter is outside of the specified range.
        InvalidParameters = 0x0A,
        /// Indicates to the remote device that the DHKey Check value received doesn't match the one
        /// calculated by the local device.
        DhKeyCheckFailed = 0x0B,
        /// Indicates that the confirm values in the numeric comparison protocol do not match.
        NumericComparisonFailed = 0x0C,
        /// Indicates that the pairing over the LE transport failed due to a Pairing Request sent
        /// over the BR/EDR transport in process.
        BrEdrPairingInProgress = 0x0D,
        /// Indicates that the BR/EDR Link Key generated on the BR/EDR transport cannot be used to
        /// derive and distribute keys for the LE transport.
        CrossTransportKeyNotAllowed = 0x0E,
    }
}

impl Reason {
    /// Returns the category this reason is reported under.
    pub fn category(&self) -> &'static str {
        match self {
            Reason::PasskeyEntryFailed => "passkey entry failed",
            Reason::OobNotAvailable => "OOB not available",
            Reason::AuthenticationRequirements => "authentication requirements",
            Reason::ConfirmValueFailed => "confirm value failed",
            Reason::PairingNotSupported => "pairing not supported",
            Reason::EncryptionKeySize => "encryption key size",
            Reason::CommandNotSupported => "command not supported",
            Reason::UnspecifiedReason => "unspecified reason",
            Reason::RepeatedAttempts => "repeated attempts",
            Reason::InvalidParameters => "invalid parameters",
            Reason::DhKeyCheckFailed => "DHKey check failed",
            Reason::NumericComparisonFailed => "numeric comparison failed",
            Reason::BrEdrPairingInProgress => "BR/EDR pairing in progress",
            Reason::CrossTransportKeyNotAllowed => "cross-transport key derivation not allowed",
            Reason::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.category(), u8::from(*self))
    }
}
