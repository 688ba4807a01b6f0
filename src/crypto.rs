//
// Random values
//
use data_encoding::{Encoding, BASE64URL_NOPAD, HEXLOWER};
use ring::{digest, hmac};

pub fn get_random_bytes<const N: usize>() -> [u8; N] {
    use ring::rand::{SecureRandom, SystemRandom};

    let mut array = [0; N];
    SystemRandom::new().fill(&mut array).expect("Error generating random values");

    array
}

/// Encodes random bytes using the provided encoding.
pub fn encode_random_bytes<const N: usize>(e: Encoding) -> String {
    e.encode(&get_random_bytes::<N>())
}

/// Ephemeral fallback for HMAC secrets that were not configured explicitly.
pub fn generate_secret() -> String {
    encode_random_bytes::<32>(BASE64URL_NOPAD)
}

//
// Digests
//
pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// Peppered digest used as the refresh-token lookup index. The token itself
/// is never stored.
pub fn sha256_index(pepper: &str, data: &str) -> String {
    let mut input = Vec::with_capacity(pepper.len() + data.len());
    input.extend_from_slice(pepper.as_bytes());
    input.extend_from_slice(data.as_bytes());
    HEXLOWER.encode(&sha256(&input))
}

//
// HMAC
//
pub fn hmac_sign(key: &str, data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    hmac::sign(&key, data).as_ref().to_vec()
}

pub fn hmac_verify(key: &str, data: &[u8], signature: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    hmac::verify(&key, data, signature).is_ok()
}

//
// PKCE (RFC 7636, S256 only)
//
pub fn pkce_challenge(verifier: &str) -> String {
    BASE64URL_NOPAD.encode(&sha256(verifier.as_bytes()))
}

pub fn verify_code_challenge(challenge: &str, verifier: &str) -> bool {
    ct_eq(pkce_challenge(verifier), challenge)
}

//
// Constant time compare
//
pub fn ct_eq<T: AsRef<[u8]>, U: AsRef<[u8]>>(a: T, b: U) -> bool {
    use ring::constant_time::verify_slices_are_equal;

    verify_slices_are_equal(a.as_ref(), b.as_ref()).is_ok()
}
