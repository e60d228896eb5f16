//! The boundary to the Link-Layer.
//!
//! The relay does not drive a radio itself. Each of its two connections is represented by a
//! [`Link`]: something that can scan, advertise, connect, and move reassembled L2CAP frames and
//! encryption requests to and from a peer. Everything the link observes comes back as a
//! [`LinkEvent`].
//!
//! ```notrust
//!  real central  <--- master-facing link --->  relay  <--- slave-facing link --->  real peripheral
//!  (initiator)                             (responder | initiator)                  (responder)
//! ```
//!
//! The *master-facing* link impersonates the peripheral towards the real central (the device that
//! is the Link-Layer master). The *slave-facing* link impersonates the central towards the real
//! peripheral.
//!
//! [`Link`]: trait.Link.html
//! [`LinkEvent`]: enum.LinkEvent.html

mod device_address;

pub use self::device_address::*;

use crate::{l2cap::Frame, utils::HexSlice};
use core::fmt;
use std::time::Duration;

/// Identifies one of the two links of a relay.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LinkId {
    /// The link to the real peripheral. The relay is the central (and pairing initiator) here.
    SlaveFacing,
    /// The link to the real central. The relay is the peripheral (and pairing responder) here.
    MasterFacing,
}

impl LinkId {
    /// Returns the other link.
    pub fn opposite(self) -> Self {
        match self {
            LinkId::SlaveFacing => LinkId::MasterFacing,
            LinkId::MasterFacing => LinkId::SlaveFacing,
        }
    }

    /// Returns a stable index for per-link arrays.
    pub fn index(self) -> usize {
        match self {
            LinkId::SlaveFacing => 0,
            LinkId::MasterFacing => 1,
        }
    }

    /// `log` target of messages about this link.
    #[cfg_attr(not(feature = "log"), allow(dead_code))]
    pub(crate) fn log_target(self) -> &'static str {
        match self {
            LinkId::SlaveFacing => "screlay::link::slave",
            LinkId::MasterFacing => "screlay::link::master",
        }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkId::SlaveFacing => "slave",
            LinkId::MasterFacing => "master",
        })
    }
}

/// Kind of advertising payload captured while scanning.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdvertisingKind {
    /// The advertising data of an `ADV_IND` (or similar) PDU.
    Primary,
    /// The payload of a `SCAN_RSP` PDU.
    ScanResponse,
}

/// An advertisement observed by a scanning link.
#[derive(Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    pub address: DeviceAddress,
    pub kind: AdvertisingKind,
    /// Raw AD structures.
    pub data: Vec<u8>,
}

impl fmt::Debug for AdvertisingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvertisingReport")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("data", &HexSlice(&self.data))
            .finish()
    }
}

/// What a link should advertise.
#[derive(Clone, PartialEq, Eq)]
pub struct AdvertisingParameters {
    /// Advertising data (AD structures).
    pub data: Vec<u8>,
    /// Scan response data (AD structures).
    pub scan_data: Vec<u8>,
    /// Advertising interval.
    pub interval: Duration,
    /// The address kind to advertise with.
    pub address_kind: AddressKind,
}

impl fmt::Debug for AdvertisingParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvertisingParameters")
            .field("data", &HexSlice(&self.data))
            .field("scan_data", &HexSlice(&self.scan_data))
            .field("interval", &self.interval)
            .field("address_kind", &self.address_kind)
            .finish()
    }
}

/// Encryption requests passed down to the Link-Layer.
///
/// LTKs are in network order (LSB first), as the controller expects them.
#[derive(Clone, PartialEq, Eq)]
pub enum LinkControl {
    /// Start encryption as Link-Layer master. Under *LE Secure Connections*, `ediv` and `rand` are
    /// always 0.
    StartEncryption { ltk: [u8; 16], ediv: u16, rand: u64 },
    /// Answer the controller's LTK request as Link-Layer slave.
    LongTermKeyReply { ltk: [u8; 16] },
    /// Reject the controller's LTK request.
    LongTermKeyNegativeReply,
}

impl fmt::Debug for LinkControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkControl::StartEncryption { ediv, rand, .. } => f
                .debug_struct("StartEncryption")
                .field("ediv", ediv)
                .field("rand", rand)
                .finish(),
            LinkControl::LongTermKeyReply { .. } => f.write_str("LongTermKeyReply"),
            LinkControl::LongTermKeyNegativeReply => f.write_str("LongTermKeyNegativeReply"),
        }
    }
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// An advertisement was received while scanning.
    Advertisement(AdvertisingReport),
    /// A connection to `peer` was established.
    Connected { peer: DeviceAddress },
    /// The connection was closed, by either side.
    Disconnected,
    /// A complete L2CAP frame (header included) was received.
    Pdu(Vec<u8>),
    /// The controller wants the LTK to answer the peer's encryption request.
    LongTermKeyRequest { ediv: u16, rand: u64 },
    /// Encryption was enabled (status 0) or failed.
    EncryptionChanged { status: u8 },
}

/// Error reported by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The operation needs a connection, but the link is not connected.
    NotConnected,
    /// The Link-Layer refused the operation.
    Rejected(&'static str),
    /// The underlying driver failed.
    Driver(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::NotConnected => f.write_str("link not connected"),
            LinkError::Rejected(why) => write!(f, "rejected by link layer: {}", why),
            LinkError::Driver(msg) => write!(f, "link driver error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// A Link-Layer connection endpoint driven by the relay.
///
/// Implementations wrap a radio driver. Methods take `&self` since the relay calls them from
/// the event threads of both links.
pub trait Link: Send + Sync {
    /// Connects to `peer`. Completion is reported with `LinkEvent::Connected`.
    fn connect(&self, peer: DeviceAddress) -> Result<(), LinkError>;

    /// Closes the connection, if any.
    fn disconnect(&self) -> Result<(), LinkError>;

    /// Returns whether a connection is established.
    fn is_connected(&self) -> bool;

    /// Changes the device address used by this link.
    fn set_address(&self, address: DeviceAddress) -> Result<(), LinkError>;

    /// Starts (or restarts) advertising with the given parameters.
    fn set_advertising_parameters(&self, params: &AdvertisingParameters) -> Result<(), LinkError>;

    /// Sends an L2CAP frame to the peer.
    fn send(&self, frame: &Frame) -> Result<(), LinkError>;

    /// Executes an encryption request.
    fn control(&self, request: LinkControl) -> Result<(), LinkError>;
}
