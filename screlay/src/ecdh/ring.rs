use super::{EcdhProvider, InvalidPublicKey, PublicKey, RngFailure, SecretKey, SharedSecret};
use rand_core::{CryptoRng, RngCore};
use ring::{
    agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256},
    rand::SystemRandom,
};

/// An ECDH provider that uses *ring* under the hood.
///
/// *ring* only accepts its own `SystemRandom`, so the RNG passed to `generate_keypair` is unused.
#[derive(Clone)]
pub struct RingProvider {
    rng: SystemRandom,
}

impl RingProvider {
    /// Creates a new `RingProvider` that uses the system's RNG for key generation.
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl EcdhProvider for RingProvider {
    type SecretKey = RingSecretKey;

    fn generate_keypair<R>(&mut self, _: &mut R) -> Result<(Self::SecretKey, PublicKey), RngFailure>
    where
        R: RngCore + CryptoRng,
    {
        let secret =
            EphemeralPrivateKey::generate(&ECDH_P256, &self.rng).map_err(|_| RngFailure::new())?;
        let public = secret
            .compute_public_key()
            .map_err(|_| RngFailure::new())?;

        // *ring* hands out the SEC1 encoding, 0x04 || X || Y
        let mut raw = [0; 64];
        raw.copy_from_slice(&public.as_ref()[1..]);
        Ok((RingSecretKey(secret), PublicKey(raw)))
    }
}

/// A secret key generated by a [`RingProvider`].
///
/// [`RingProvider`]: struct.RingProvider.html
pub struct RingSecretKey(EphemeralPrivateKey);

impl SecretKey for RingSecretKey {
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        let mut sec1 = [0; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(&foreign_key.0);

        let foreign = UnparsedPublicKey::new(&ECDH_P256, &sec1[..]);
        agreement::agree_ephemeral(self.0, &foreign, |material| {
            let mut secret = [0; 32];
            secret.copy_from_slice(material);
            SharedSecret(secret)
        })
        .map_err(|_| InvalidPublicKey::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testsuite() {
        super::super::run_tests(RingProvider::new());
    }
}
