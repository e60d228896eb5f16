//! Passkey Entry bit commitment (Core Spec Vol 3, Part H, 2.3.5.6.3).
//!
//! The 20-bit passkey is committed to one bit per round. In round `k` (counting from 0), each side
//! sends `f4(PKlocal, PKpeer, N, 0x80 | bit_k)` and reveals `N` once it has seen the peer's
//! commitment. The *round index* used in logs runs backwards from 19 to 0.
//!
//! Committing to single bits means an attacker who can see one side's commitment and nonce learns
//! that bit. [`Reflector`] exploits this towards a real central: it answers every commitment with
//! the central's own values, which verify against themselves, and recovers the bit in the process.
//!
//! [`Reflector`]: struct.Reflector.html

use super::toolbox;
use crate::ecdh::PublicKey;
use core::fmt;
use rand_core::{CryptoRng, RngCore};

/// Number of Passkey Entry rounds.
pub const ROUNDS: u8 = 20;

/// A 6-digit passkey in range `0..=999_999`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Passkey(u32);

impl Passkey {
    /// Largest valid passkey.
    pub const MAX: u32 = 999_999;

    /// Creates a passkey, returning `None` if `value` has more than 6 digits.
    pub fn new(value: u32) -> Option<Self> {
        if value <= Self::MAX {
            Some(Passkey(value))
        } else {
            None
        }
    }

    /// Draws a uniformly distributed passkey from `rng`.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, rand_core::Error> {
        // Rejection sampling over 20 bits, 95% acceptance.
        loop {
            let mut raw = [0; 4];
            rng.try_fill_bytes(&mut raw)?;
            let value = u32::from_le_bytes(raw) & 0xF_FFFF;
            if let Some(passkey) = Self::new(value) {
                return Ok(passkey);
            }
        }
    }

    /// Returns the numeric value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Returns bit `k` of the passkey (0 = least significant).
    pub fn bit(self, k: u8) -> bool {
        (self.0 >> k) & 1 != 0
    }

    /// Returns the `r` input of `f6`: the passkey zero-extended to 128 bits, big-endian.
    pub fn to_r(self) -> [u8; 16] {
        let mut r = [0; 16];
        r[12..].copy_from_slice(&self.0.to_be_bytes());
        r
    }
}

impl fmt::Display for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl fmt::Debug for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passkey({:06})", self.0)
    }
}

/// The `z` argument of `f4` committing to `bit`.
pub fn commitment(bit: bool) -> u8 {
    0x80 | u8::from(bit)
}

#[derive(Debug, Copy, Clone)]
enum Source {
    /// All bits are known up front.
    Known(Passkey),
    /// Bits arrive one at a time, in round order. `available` counts the bits received so far.
    Injected { bits: u32, available: u8 },
}

/// Progress through the 20 Passkey Entry rounds.
///
/// Tracks the current round and where the committed bits come from. Bits of completed rounds are
/// accumulated, so the passkey can be reconstructed once all rounds are done.
#[derive(Debug, Clone)]
pub struct PasskeyBitExchange {
    /// Round index, 19 down to 0. -1 once all rounds are done.
    index: i8,
    source: Source,
    /// Bits of completed rounds.
    completed: u32,
}

impl PasskeyBitExchange {
    /// Commits to the bits of a known passkey.
    pub fn new(passkey: Passkey) -> Self {
        Self {
            index: ROUNDS as i8 - 1,
            source: Source::Known(passkey),
            completed: 0,
        }
    }

    /// Creates an exchange whose bits are supplied later, through [`inject`].
    ///
    /// [`inject`]: #method.inject
    pub fn injected() -> Self {
        Self {
            index: ROUNDS as i8 - 1,
            source: Source::Injected {
                bits: 0,
                available: 0,
            },
            completed: 0,
        }
    }

    /// Returns the round index, counting down from 19. Returns -1 when finished.
    pub fn index(&self) -> i8 {
        self.index
    }

    /// Returns the number of the current round (0 for the first), or `None` when finished.
    ///
    /// Round `k` commits to bit `k` of the passkey.
    pub fn round(&self) -> Option<u8> {
        if self.index < 0 {
            None
        } else {
            Some((ROUNDS as i8 - 1 - self.index) as u8)
        }
    }

    /// Returns whether all 20 rounds are done.
    pub fn is_finished(&self) -> bool {
        self.index < 0
    }

    /// Returns the bit committed in the current round.
    ///
    /// Returns `None` when finished, or when the bit has not been injected yet.
    pub fn current_bit(&self) -> Option<bool> {
        let round = self.round()?;
        match self.source {
            Source::Known(passkey) => Some(passkey.bit(round)),
            Source::Injected { bits, available } => {
                if round < available {
                    Some((bits >> round) & 1 != 0)
                } else {
                    None
                }
            }
        }
    }

    /// Returns the `z` value of the current round, `0x80 | bit`.
    pub fn current_commitment(&self) -> Option<u8> {
        self.current_bit().map(commitment)
    }

    /// Supplies the bit for round `round`.
    ///
    /// Bits have to be injected in round order. Returns `false` (and changes nothing) if `round`
    /// is not the next expected one, or if this exchange uses a known passkey.
    pub fn inject(&mut self, round: u8, bit: bool) -> bool {
        match &mut self.source {
            Source::Injected { bits, available } if *available == round && round < ROUNDS => {
                *bits |= u32::from(bit) << round;
                *available += 1;
                true
            }
            _ => false,
        }
    }

    /// Finishes the current round, recording its bit.
    ///
    /// Does nothing when no bit is available for the round.
    pub fn complete_round(&mut self) {
        if let (Some(round), Some(bit)) = (self.round(), self.current_bit()) {
            self.completed |= u32::from(bit) << round;
            self.index -= 1;
        }
    }

    /// Returns the passkey reconstructed from the bits of all 20 rounds.
    ///
    /// Returns `None` until every round has been completed, or if the reconstructed value is out
    /// of range.
    pub fn passkey(&self) -> Option<Passkey> {
        if self.is_finished() {
            Passkey::new(self.completed)
        } else {
            None
        }
    }
}

/// Recovers the bit a peer committed to.
///
/// `confirm` was computed by the peer as `f4(pk_peer, pk_other, nonce, 0x80 | bit)`. Returns `None`
/// if neither candidate bit reproduces it.
pub fn recover_bit(
    pk_peer: &PublicKey,
    pk_other: &PublicKey,
    nonce: &[u8; 16],
    confirm: &[u8; 16],
) -> Option<bool> {
    let (u, v) = (pk_peer.x(), pk_other.x());
    [false, true]
        .iter()
        .copied()
        .find(|&bit| toolbox::values_match(&toolbox::f4(&u, &v, nonce, commitment(bit)), confirm))
}

/// Reflects a central's Passkey Entry commitments back at it.
///
/// The reflector presents the central's own public key as the responder key. Every confirm value
/// and nonce received is then a valid answer to itself, because `f4(PKa, PKb, N, z)` and
/// `f4(PKb, PKa, N, z)` coincide when `PKa == PKb`. Once the nonce of a round is revealed, the
/// committed bit is recovered by trying both candidates.
///
/// The central notices nothing until the DHKey check, which the reflector can't produce without
/// the central's private key.
#[derive(Debug, Clone)]
pub struct Reflector {
    peer_key: PublicKey,
    exchange: PasskeyBitExchange,
    pending_confirm: Option<[u8; 16]>,
}

impl Reflector {
    /// Creates a reflector against the central that sent `peer_key`.
    pub fn new(peer_key: PublicKey) -> Self {
        Self {
            peer_key,
            exchange: PasskeyBitExchange::injected(),
            pending_confirm: None,
        }
    }

    /// Returns the public key to send back to the central, which is its own.
    pub fn public_key(&self) -> &PublicKey {
        &self.peer_key
    }

    /// Returns the current round number, or `None` once all rounds are done.
    pub fn round(&self) -> Option<u8> {
        self.exchange.round()
    }

    /// Handles the central's confirm value and returns the value to answer with.
    pub fn on_confirm(&mut self, confirm: [u8; 16]) -> [u8; 16] {
        self.pending_confirm = Some(confirm);
        confirm
    }

    /// Handles the central's nonce.
    ///
    /// Returns `Some((round, bit))` if the bit committed in the pending confirm value could be
    /// recovered; the nonce is then reflected verbatim. Returns `None` if no confirm value was
    /// pending or neither bit matches it.
    pub fn on_nonce(&mut self, nonce: &[u8; 16]) -> Option<(u8, bool)> {
        let round = self.exchange.round()?;
        let confirm = self.pending_confirm.take()?;
        let bit = recover_bit(&self.peer_key, &self.peer_key, nonce, &confirm)?;
        self.exchange.inject(round, bit);
        self.exchange.complete_round();
        Some((round, bit))
    }

    /// Returns the recovered passkey once all 20 rounds were reflected.
    pub fn passkey(&self) -> Option<Passkey> {
        self.exchange.passkey()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecdh::{EcdhProvider, P256Provider};
    use rand_core::OsRng;

    fn run(passkey: Passkey) -> (u8, Option<Passkey>) {
        let mut exchange = PasskeyBitExchange::new(passkey);
        let mut rounds = 0;
        let mut expected_index = 19;
        while let Some(z) = exchange.current_commitment() {
            assert_eq!(exchange.index(), expected_index);
            assert_eq!(z & 0x80, 0x80);
            exchange.complete_round();
            expected_index -= 1;
            rounds += 1;
        }
        assert_eq!(exchange.index(), -1);
        (rounds, exchange.passkey())
    }

    #[test]
    fn always_twenty_rounds() {
        for &value in &[0, 1, 524_288, 999_999, 123_456] {
            let passkey = Passkey::new(value).unwrap();
            assert_eq!(run(passkey), (ROUNDS, Some(passkey)));
        }
    }

    #[test]
    fn passkey_range() {
        assert!(Passkey::new(999_999).is_some());
        assert!(Passkey::new(1_000_000).is_none());
        assert_eq!(Passkey::new(42).unwrap().to_string(), "000042");

        let r = Passkey::new(0x0001_e240).unwrap().to_r();
        assert_eq!(&r[..12], &[0; 12]);
        assert_eq!(&r[12..], &[0x00, 0x01, 0xe2, 0x40]);

        for _ in 0..100 {
            assert!(Passkey::random(&mut OsRng).unwrap().value() <= Passkey::MAX);
        }
    }

    #[test]
    fn injected_bits_wait() {
        let mut exchange = PasskeyBitExchange::injected();
        assert_eq!(exchange.current_bit(), None);
        exchange.complete_round();
        assert_eq!(exchange.index(), 19);

        assert!(!exchange.inject(1, true));
        assert!(exchange.inject(0, true));
        assert!(exchange.inject(1, false));
        assert_eq!(exchange.current_commitment(), Some(0x81));
        exchange.complete_round();
        assert_eq!(exchange.current_commitment(), Some(0x80));
        exchange.complete_round();
        assert_eq!(exchange.current_bit(), None);
        assert!(!PasskeyBitExchange::new(Passkey::new(1).unwrap()).inject(0, true));
    }

    #[test]
    fn reflection_recovers_passkey() {
        let (_, central_key) = P256Provider::new().generate_keypair(&mut OsRng).unwrap();
        let passkey = Passkey::new(987_654).unwrap();

        let mut reflector = Reflector::new(central_key);
        assert_eq!(reflector.public_key(), &central_key);

        let mut central = PasskeyBitExchange::new(passkey);
        while let Some(z) = central.current_commitment() {
            let mut nonce = [0; 16];
            OsRng.fill_bytes(&mut nonce);
            // The central commits against the key the reflector sent, which is its own.
            let confirm = toolbox::f4(&central_key.x(), &central_key.x(), &nonce, z);

            let answer = reflector.on_confirm(confirm);
            // Verified by the central as f4(PKb, PKa, Nb, z), which is the same computation.
            assert_eq!(answer, confirm);

            let round = central.round().unwrap();
            let recovered = reflector.on_nonce(&nonce).unwrap();
            assert_eq!(recovered, (round, passkey.bit(round)));
            central.complete_round();
        }

        assert_eq!(reflector.passkey(), Some(passkey));
    }

    #[test]
    fn garbage_confirm_is_not_recovered() {
        let (_, key) = P256Provider::new().generate_keypair(&mut OsRng).unwrap();
        let mut reflector = Reflector::new(key);
        assert_eq!(reflector.on_nonce(&[1; 16]), None);
        reflector.on_confirm([0; 16]);
        assert_eq!(reflector.on_nonce(&[1; 16]), None);
        assert_eq!(reflector.round(), Some(0));
    }
}
