use super::{EcdhProvider, InvalidPublicKey, PublicKey, RngFailure, SecretKey, SharedSecret};
use p256::{ecdh::diffie_hellman, elliptic_curve::sec1::ToEncodedPoint};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Private key of the Secure Connections debug key pair (Core Spec Vol 3, Part H, 2.3.5.6.1).
///
/// Devices paired with this key can be decrypted by any sniffer, which is occasionally useful when
/// inspecting a relay.
const DEBUG_PRIVATE_KEY: [u8; 32] = [
    0x3f, 0x49, 0xf6, 0xd4, 0xa3, 0xc5, 0x5f, 0x38, 0x74, 0xc9, 0xb3, 0xe3, 0xd2, 0x10, 0x3f, 0x50,
    0x4a, 0xff, 0x60, 0x7b, 0xeb, 0x40, 0xb7, 0x99, 0x58, 0x99, 0xb8, 0xa6, 0xcd, 0x3c, 0x1a, 0xbd,
];

/// Number of candidate scalars drawn before giving up on key generation.
///
/// A uniformly random 256-bit string is a valid P-256 scalar with overwhelming probability, so
/// running out means the RNG is broken.
const MAX_ATTEMPTS: usize = 8;

/// An ECDH provider that uses the pure-Rust [`p256`] crate.
///
/// [`p256`]: https://docs.rs/p256
#[derive(Debug, Default, Copy, Clone)]
pub struct P256Provider {
    debug_keys: bool,
}

impl P256Provider {
    /// Creates a new instance of this provider.
    pub fn new() -> Self {
        Self { debug_keys: false }
    }

    /// Creates a provider that always hands out the Secure Connections debug key pair.
    pub fn with_debug_keys() -> Self {
        Self { debug_keys: true }
    }
}

impl EcdhProvider for P256Provider {
    type SecretKey = P256SecretKey;

    fn generate_keypair<R>(&mut self, rng: &mut R) -> Result<(Self::SecretKey, PublicKey), RngFailure>
    where
        R: RngCore + CryptoRng,
    {
        if self.debug_keys {
            let secret =
                p256::SecretKey::from_slice(&DEBUG_PRIVATE_KEY).map_err(|_| RngFailure::new())?;
            let public = encode_public(&secret.public_key());
            return Ok((P256SecretKey(secret), public));
        }

        for _ in 0..MAX_ATTEMPTS {
            let mut bytes = [0; 32];
            rng.try_fill_bytes(&mut bytes)
                .map_err(|_| RngFailure::new())?;
            let candidate = p256::SecretKey::from_slice(&bytes);
            bytes.zeroize();

            if let Ok(secret) = candidate {
                let public = encode_public(&secret.public_key());
                return Ok((P256SecretKey(secret), public));
            }
        }

        Err(RngFailure::new())
    }
}

/// A P-256 secret key produced by [`P256Provider`].
///
/// The wrapped key is wiped on drop.
///
/// [`P256Provider`]: struct.P256Provider.html
pub struct P256SecretKey(p256::SecretKey);

impl SecretKey for P256SecretKey {
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        // `from_sec1_bytes` rejects the identity and points that aren't on the curve.
        let mut sec1 = [0; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(&foreign_key.0);
        let public =
            p256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| InvalidPublicKey::new())?;

        let shared = diffie_hellman(self.0.to_nonzero_scalar(), public.as_affine());
        let mut secret = [0; 32];
        secret.copy_from_slice(&shared.raw_secret_bytes()[..]);
        Ok(SharedSecret(secret))
    }
}

fn encode_public(key: &p256::PublicKey) -> PublicKey {
    let point = key.to_encoded_point(false);
    // Uncompressed SEC1 encoding: 0x04 || X || Y
    let mut raw = [0; 64];
    raw.copy_from_slice(&point.as_bytes()[1..]);
    PublicKey(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hex;
    use rand_core::OsRng;

    #[test]
    fn testsuite() {
        super::super::run_tests(P256Provider::new());
    }

    #[test]
    fn debug_key_matches_sample_data() {
        let (_, public) = P256Provider::with_debug_keys()
            .generate_keypair(&mut OsRng)
            .unwrap();
        assert_eq!(
            public.x(),
            hex("20b003d2f297be2c5e2c83a7e9f9a5b9eff49111acf4fddbcc0301480e359de6")
        );
    }

    #[test]
    fn fresh_keys_differ() {
        let mut provider = P256Provider::new();
        let (_, a) = provider.generate_keypair(&mut OsRng).unwrap();
        let (_, b) = provider.generate_keypair(&mut OsRng).unwrap();
        assert_ne!(a, b);
    }
}
