//! RSA-PKCS1-v1.5-over-SHA-256 signing, opaque to the state machine: it
//! only ever sees a 32-byte digest, a signature, and a public key.

use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::common::Digest;

pub fn sign(digest: &Digest, private_key: &RsaPrivateKey) -> Vec<u8> {
    private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
        .expect("signing with a freshly generated 1024-bit key never fails")
}

/// Never panics on a mismatched signature: verification failure is a
/// message-local validation error, not a crash.
pub fn verify(digest: &Digest, signature: &[u8], public_key: &RsaPublicKey) -> bool {
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
        .is_ok()
}
