use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const PBKDF2_ITERATIONS: u32 = 200_000;
pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;
pub const RESET_TOKEN_TTL_SECS: i64 = 60 * 60;

/// Stored password material. The raw password never touches the database.
#[derive(Debug, Clone)]
pub struct PasswordRecord {
    pub salt: String,
    pub hash: String,
    pub iterations: u32,
}

pub fn hash_password(password: &str) -> PasswordRecord {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt, PBKDF2_ITERATIONS);
    PasswordRecord {
        salt: BASE64.encode(salt),
        hash: BASE64.encode(key),
        iterations: PBKDF2_ITERATIONS,
    }
}

pub fn verify_password(password: &str, salt_b64: &str, hash_b64: &str, iterations: u32) -> bool {
    if password.is_empty() {
        return false;
    }
    let Ok(salt) = BASE64.decode(salt_b64) else {
        return false;
    };
    let Ok(expected) = BASE64.decode(hash_b64) else {
        return false;
    };
    let key = derive_key(password, &salt, iterations.max(1));
    key.as_slice() == expected.as_slice()
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

/// 32 random bytes as lowercase hex. Used for bearer and reset tokens;
/// only the sha256 of the token is ever stored.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
