/// Cryptographic helpers: secret generation and TLS client configuration
use crate::error::{Result, VpnError};
use crate::protocol::constants::{DTLS12_VERSION, MASTER_SECRET_LEN};

// Conditional crypto imports - prioritize ring if both features are enabled
#[cfg(all(feature = "ring-crypto", not(feature = "aws-lc-crypto")))]
use ring::rand::{self, SecureRandom};

#[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
use aws_lc_rs::rand::{self, SecureRandom};

// If both features are enabled, prefer ring (for CI --all-features)
#[cfg(all(feature = "ring-crypto", feature = "aws-lc-crypto"))]
use ring::rand::{self, SecureRandom};

pub mod dtls;
pub mod tls;

/// Random source for session secrets
pub struct SecretGenerator {
    rng: rand::SystemRandom,
}

impl SecretGenerator {
    pub fn new() -> Self {
        Self {
            rng: rand::SystemRandom::new(),
        }
    }

    /// Fill `buf` with random bytes
    pub fn fill(&self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .fill(buf)
            .map_err(|e| VpnError::Crypto(format!("Random generation failed: {e:?}")))
    }

    /// 48-byte DTLS pre-master secret: the DTLS 1.2 version then 46 random bytes
    pub fn master_secret(&self) -> Result<Vec<u8>> {
        let mut secret = vec![0u8; MASTER_SECRET_LEN];
        secret[..2].copy_from_slice(&DTLS12_VERSION);
        self.fill(&mut secret[2..])?;
        Ok(secret)
    }
}

impl Default for SecretGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a fresh pre-master secret
pub fn make_master_secret() -> Result<Vec<u8>> {
    SecretGenerator::new().master_secret()
}
