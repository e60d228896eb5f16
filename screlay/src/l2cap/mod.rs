//! The Logical Link Control and Adaptation Protocol (L2CAP), as far as the relay needs it.
//!
//! Every PDU the link-layer collaborators hand to the relay is a complete (reassembled) L2CAP
//! basic frame. A frame is identified by the channel it is addressed to (also see [`Channel`]);
//! the relay only cares about one of them: Security Manager traffic on channel `0x0006` is consumed
//! by the pairing engine, everything else is application traffic that is forwarded verbatim once
//! both links are secured.
//!
//! [`Channel`]: struct.Channel.html

use {
    crate::{bytes::*, utils::HexSlice, Error},
    byteorder::{ByteOrder, LittleEndian},
    core::fmt,
};

/// An L2CAP channel identifier (CID).
///
/// Channels are basically like TCP ports. A number of channel identifiers are reserved for
/// predefined functions:
///
/// * `0x0000`: The null identifier. Must never be used as a destination endpoint.
/// * `0x0004`: Attribute protocol (ATT). BLE only.
/// * `0x0005`: LE L2CAP signaling channel.
/// * `0x0006`: LE Security Manager protocol.
///
/// For BLE, channels `0x0040`-`0x007F` are dynamically allocated.
#[derive(PartialEq, Eq, Hash, Copy, Clone)]
pub struct Channel(u16);

impl Channel {
    /// The null channel identifier. Must not be used as a destination endpoint.
    pub const NULL: Self = Channel(0x0000);

    /// The channel used by the Attribute Protocol (ATT).
    pub const ATT: Self = Channel(0x0004);

    /// LE L2CAP signaling channel (connectionless).
    pub const LE_SIGNALING: Self = Channel(0x0005);

    /// LE Security Manager channel.
    pub const LE_SECURITY_MANAGER: Self = Channel(0x0006);

    /// Creates a channel identifier from its raw value.
    pub fn new(raw: u16) -> Self {
        Channel(raw)
    }

    /// Returns the channel identifier (CID) as a raw `u16`.
    pub fn as_raw(&self) -> u16 {
        self.0
    }

    /// Returns whether this channel carries Security Manager commands.
    pub fn is_security_manager(&self) -> bool {
        *self == Self::LE_SECURITY_MANAGER
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

/// Header used by *all* L2CAP PDUs.
#[derive(Debug)]
struct Header {
    /// Length of the payload following the length and channel fields (after reassembly).
    length: u16,
    /// Destination endpoint of the PDU.
    channel: Channel,
}

impl Header {
    /// The size of an L2CAP message header in Bytes.
    const SIZE: usize = 2 + 2;
}

impl<'a> FromBytes<'a> for Header {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw: [u8; Header::SIZE] = bytes.read_array()?;
        Ok(Self {
            length: LittleEndian::read_u16(&raw[..2]),
            channel: Channel(LittleEndian::read_u16(&raw[2..])),
        })
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let mut raw = [0; Header::SIZE];
        LittleEndian::write_u16(&mut raw[..2], self.length);
        LittleEndian::write_u16(&mut raw[2..], self.channel.0);
        writer.write_slice(&raw)
    }
}

/// A complete L2CAP basic frame.
///
/// Frames are owned so that they can sit in a relay queue for as long as pairing takes.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    channel: Channel,
    payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame addressed to `channel`.
    pub fn new(channel: Channel, payload: Vec<u8>) -> Self {
        Self { channel, payload }
    }

    /// Parses a frame from the raw bytes delivered by a link.
    ///
    /// The length field must match the number of payload bytes exactly; fragmented messages are
    /// expected to be reassembled by the link.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let mut bytes = ByteReader::new(raw);
        let header = Header::from_bytes(&mut bytes)?;
        if usize::from(header.length) != bytes.bytes_left() {
            return Err(Error::InvalidLength);
        }

        Ok(Self {
            channel: header.channel,
            payload: bytes.read_rest().to_vec(),
        })
    }

    /// Returns the destination channel.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Returns the frame's payload (without the L2CAP header).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encodes the frame, header included.
    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; Header::SIZE + self.payload.len()];
        self.to_bytes(&mut ByteWriter::new(&mut buf))?;
        Ok(buf)
    }
}

impl ToBytes for Frame {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        if self.payload.len() > usize::from(u16::max_value()) {
            return Err(Error::InvalidLength);
        }

        Header {
            length: self.payload.len() as u16,
            channel: self.channel,
        }
        .to_bytes(writer)?;
        writer.write_slice(&self.payload)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("channel", &self.channel)
            .field("payload", &HexSlice(&self.payload))
            .finish()
    }
}
