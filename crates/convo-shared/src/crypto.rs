use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

use crate::constants::TOKEN_LENGTH;

type HmacSha256 = Hmac<Sha256>;

/// Opaque random token: 32 alphanumeric characters from the OS RNG.
pub fn random_token() -> String {
    rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

// HMAC-SHA256 over the concatenation of `parts`
pub fn sign(secret: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time check of `signature` against the HMAC of `parts`.
pub fn verify(secret: &[u8], parts: &[&[u8]], signature: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(signature).is_ok()
}
