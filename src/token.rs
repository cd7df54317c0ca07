//! Origin proof tokens.
//!
//! A token is the HMAC-SHA256 of the client address keyed with a secret
//! pepper. It is stable for a fixed address and pepper, and cannot be
//! predicted without the pepper.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::IpAddr;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Derives and checks origin proof tokens.
#[derive(Clone)]
pub struct OriginTokenIssuer {
    /// Secret pepper
    pepper: Vec<u8>,
}

impl OriginTokenIssuer {
    /// Create a new issuer keyed with the given pepper.
    pub fn new(pepper: impl AsRef<[u8]>) -> Self {
        Self {
            pepper: pepper.as_ref().to_vec(),
        }
    }

    /// Compute the expected token for a client address.
    pub fn token_for(&self, ip: IpAddr) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.pepper)
            .expect("HMAC can take key of any size");
        mac.update(ip.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check a client-supplied token in constant time.
    pub fn verify(&self, ip: IpAddr, presented: &str) -> bool {
        constant_time_eq(self.token_for(ip).as_bytes(), presented.as_bytes())
    }
}

impl std::fmt::Debug for OriginTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginTokenIssuer").finish_non_exhaustive()
    }
}

/// Timing-oblivious byte comparison.
///
/// Leaks only whether the lengths differ; tokens have a fixed length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
