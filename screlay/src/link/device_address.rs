use crate::security::toolbox;
use core::fmt;

/// Specifies whether a device address is randomly generated or a LAN MAC address.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressKind {
    /// Publicly registered IEEE 802-2001 LAN MAC address.
    Public,
    /// Randomly generated address.
    Random,
}

impl AddressKind {
    /// Returns the address type octet used by the pairing toolbox and identity PDUs.
    pub fn to_u8(self) -> u8 {
        match self {
            AddressKind::Public => 0x00,
            AddressKind::Random => 0x01,
        }
    }

    /// Decodes an address type octet.
    ///
    /// Only bit 0 is significant, the remaining bits are reserved.
    pub fn from_u8(raw: u8) -> Self {
        if raw & 0x01 == 0 {
            AddressKind::Public
        } else {
            AddressKind::Random
        }
    }
}

/// A Bluetooth device address.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl DeviceAddress {
    /// Create a new device address from 6 raw Bytes and an address kind specifier.
    ///
    /// The `raw` array contains the address Bytes as they are sent over the air (LSB first).
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        DeviceAddress { bytes, kind }
    }

    /// Creates a device address from its conventional, most-significant-byte-first notation.
    ///
    /// `DeviceAddress::from_msb_first([0x56, 0x12, 0x37, 0x37, 0xbf, 0xce], ..)` is the device
    /// printed as `56:12:37:37:bf:ce`.
    pub fn from_msb_first(mut bytes: [u8; 6], kind: AddressKind) -> Self {
        bytes.reverse();
        DeviceAddress { bytes, kind }
    }

    /// Returns the address kind.
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Returns whether this address is randomly generated.
    pub fn is_random(&self) -> bool {
        self.kind == AddressKind::Random
    }

    /// Returns the raw bytes making up this address (LSB first).
    pub fn raw(&self) -> &[u8; 6] {
        &self.bytes
    }

    /// Returns the 56-bit address form used as `A1`/`A2` input of the `f5` and `f6` functions.
    ///
    /// The most significant octet holds the address type (bit 0 set for random addresses),
    /// followed by the address, most significant byte first.
    pub fn to_toolbox_bytes(&self) -> [u8; 7] {
        let mut out = [0; 7];
        out[0] = self.kind.to_u8();
        for (dst, src) in out[1..].iter_mut().zip(self.bytes.iter().rev()) {
            *dst = *src;
        }
        out
    }

    /// Returns whether this is a resolvable private address generated from `irk`.
    ///
    /// The upper 24 bits (`prand`, tagged with `0b01` in the top two bits) are hashed with the IRK
    /// and compared against the lower 24 bits.
    pub fn resolves_with(&self, irk: &[u8; 16]) -> bool {
        if !self.is_random() || self.bytes[5] >> 6 != 0b01 {
            return false;
        }

        let prand = [self.bytes[5], self.bytes[4], self.bytes[3]];
        let hash = [self.bytes[2], self.bytes[1], self.bytes[0]];
        toolbox::ah(irk, &prand) == hash
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.bytes.iter().rev().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self, self.kind)
    }
}
