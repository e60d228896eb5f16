//! The LE Secure Connections cryptographic toolbox (Core Spec Vol 3, Part H, 2.2).
//!
//! All inputs and outputs are big-endian, exactly as the specification writes them down. PDUs
//! carry the same values LSB first; [`Command`] decoding takes care of the reversal.
//!
//! [`Command`]: ../pdu/enum.Command.html

use aes::{
    cipher::{BlockEncrypt, KeyInit},
    Aes128,
};
use cmac::{digest, Cmac};
use core::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// `SALT` used by `f5` to derive the key `T` from the DHKey.
const F5_SALT: [u8; 16] = [
    0x6C, 0x88, 0x83, 0x91, 0xAA, 0xF5, 0xA5, 0x38, 0x60, 0x37, 0x0B, 0xDB, 0x5A, 0x60, 0x83, 0xBE,
];

/// `keyID` of `f5`, ASCII "btle".
const F5_KEY_ID: [u8; 4] = *b"btle";

/// `Length` of `f5`: 256 bits of output, big-endian.
const F5_LENGTH: [u8; 2] = [0x01, 0x00];

/// A 128-bit secret key (LTK, MacKey, or an intermediate value).
///
/// Compared in constant time and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key(pub [u8; 16]);

impl Key {
    /// Returns the key in the byte order used on the wire and by the controller (LSB first).
    pub fn to_le_bytes(&self) -> [u8; 16] {
        crate::utils::swapped(self.0)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(<secret>)")
    }
}

/// RFC 4493 AES-CMAC (Core Spec Vol 3, Part H, 2.2.5).
#[derive(Clone)]
pub struct AesCmac(Cmac<Aes128>);

impl AesCmac {
    /// Creates CMAC state keyed with `key`.
    pub fn new(key: &[u8; 16]) -> Self {
        AesCmac(<Cmac<Aes128> as digest::KeyInit>::new(key.into()))
    }

    /// Updates CMAC state.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        digest::Update::update(&mut self.0, bytes);
        self
    }

    /// Computes the final MAC value.
    pub fn finalize(self) -> [u8; 16] {
        let out = digest::FixedOutput::finalize_fixed(self.0);
        let mut mac = [0; 16];
        mac.copy_from_slice(&out);
        mac
    }
}

/// Computes a confirm value.
///
/// `z` is `0x00` for Just Works and Numeric Comparison, and `0x80 | bit` in each Passkey Entry
/// round.
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
    let mut m = AesCmac::new(x);
    m.update(u).update(v).update(&[z]);
    m.finalize()
}

/// Derives `(MacKey, LTK)` from the DHKey `w`, both nonces and both addresses.
///
/// `a1` and `a2` are the 56-bit address forms of initiator and responder (see
/// `DeviceAddress::to_toolbox_bytes`).
pub fn f5(w: &[u8; 32], n1: &[u8; 16], n2: &[u8; 16], a1: &[u8; 7], a2: &[u8; 7]) -> (Key, Key) {
    let mut m = AesCmac::new(&F5_SALT);
    m.update(w);
    let t = Key(m.finalize());

    let derive = |counter: u8| {
        let mut m = AesCmac::new(&t.0);
        m.update(&[counter])
            .update(&F5_KEY_ID)
            .update(n1)
            .update(n2)
            .update(a1)
            .update(a2)
            .update(&F5_LENGTH);
        Key(m.finalize())
    };

    (derive(0), derive(1))
}

/// Computes a DHKey check value, keyed with the MacKey `w`.
pub fn f6(
    w: &[u8; 16],
    n1: &[u8; 16],
    n2: &[u8; 16],
    r: &[u8; 16],
    iocap: &[u8; 3],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> [u8; 16] {
    let mut m = AesCmac::new(w);
    m.update(n1)
        .update(n2)
        .update(r)
        .update(iocap)
        .update(a1)
        .update(a2);
    m.finalize()
}

/// Computes the 32-bit value a Numeric Comparison is based on.
///
/// The 6 digits shown to the user are `g2(..) % 1_000_000`.
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
    let mut m = AesCmac::new(x);
    m.update(u).update(v).update(y);
    let mac = m.finalize();
    u32::from_be_bytes([mac[12], mac[13], mac[14], mac[15]])
}

/// Random address hash function, used to resolve private addresses with an IRK.
pub fn ah(k: &[u8; 16], r: &[u8; 3]) -> [u8; 3] {
    let cipher = Aes128::new(k.into());
    let mut block = aes::Block::default();
    block[13..].copy_from_slice(r);
    cipher.encrypt_block(&mut block);
    [block[13], block[14], block[15]]
}

/// Compares two 128-bit values in constant time.
pub fn values_match(a: &[u8; 16], b: &[u8; 16]) -> bool {
    a.ct_eq(b).into()
}
