//! Keyword-seeded stream obfuscator
//!
//! Wraps the cookie ciphertext in the obfuscated-SSH construction so the
//! bytes carry no recognizable structure. A random 16-byte seed plus the
//! shared keyword derive an RC4 keystream; the transmitted seed message
//! carries the seed in the clear followed by an encrypted magic value and a
//! random amount of padding, which randomizes the overall length. The relay
//! re-derives the keystream from the seed and strips the padding.
//!
//! Only the client-to-server direction exists here; responses are never
//! obfuscated because cookies only flow one way.

use rand::RngCore;
use rand::rngs::OsRng;
use rc4::{KeyInit, Rc4, StreamCipher, consts::U16};
use sha1::{Digest, Sha1};

pub(crate) const OBFUSCATE_SEED_LENGTH: usize = 16;
const OBFUSCATE_KEY_LENGTH: usize = 16;
const OBFUSCATE_HASH_ITERATIONS: usize = 6000;
const OBFUSCATE_MAGIC_VALUE: u32 = 0x0BF5_CA7E;
pub(crate) const OBFUSCATE_MAX_PADDING: usize = 32;
const CLIENT_TO_SERVER_IV: &[u8] = b"client_to_server";

/// One-direction obfuscating keystream.
///
/// The keystream state is continuous: it first covers the seed message's
/// encrypted tail, then whatever is passed to [`Obfuscator::obfuscate`].
pub struct Obfuscator {
    cipher: Rc4<U16>,
    seed_message: Vec<u8>,
}

impl Obfuscator {
    /// Construct with a fresh random seed and padding in `[0, max_padding]`.
    pub fn new(keyword: &str, max_padding: usize) -> Self {
        let mut seed = [0u8; OBFUSCATE_SEED_LENGTH];
        OsRng.fill_bytes(&mut seed);

        let pad_len = (OsRng.next_u32() as usize) % (max_padding + 1);
        let mut padding = vec![0u8; pad_len];
        OsRng.fill_bytes(&mut padding);

        Self::assemble(keyword, seed, &padding)
    }

    fn assemble(keyword: &str, seed: [u8; OBFUSCATE_SEED_LENGTH], padding: &[u8]) -> Self {
        let key = derive_keystream_key(&seed, keyword.as_bytes());
        let mut cipher = Rc4::<U16>::new((&key).into());

        let mut tail = Vec::with_capacity(8 + padding.len());
        tail.extend_from_slice(&OBFUSCATE_MAGIC_VALUE.to_be_bytes());
        tail.extend_from_slice(&(padding.len() as u32).to_be_bytes());
        tail.extend_from_slice(padding);
        cipher.apply_keystream(&mut tail);

        let mut seed_message = Vec::with_capacity(OBFUSCATE_SEED_LENGTH + tail.len());
        seed_message.extend_from_slice(&seed);
        seed_message.extend_from_slice(&tail);

        Self {
            cipher,
            seed_message,
        }
    }

    /// The prefix the relay needs to re-derive the keystream.
    pub fn seed_message(&self) -> &[u8] {
        &self.seed_message
    }

    /// Transform payload bytes in place, continuing the keystream.
    pub fn obfuscate(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

/// Iterated-hash key derivation shared with the relay:
/// `SHA1(seed || keyword || iv)` re-hashed `OBFUSCATE_HASH_ITERATIONS`
/// times, truncated to the RC4 key length.
fn derive_keystream_key(seed: &[u8], keyword: &[u8]) -> [u8; OBFUSCATE_KEY_LENGTH] {
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(keyword);
    hasher.update(CLIENT_TO_SERVER_IV);
    let mut digest = hasher.finalize();

    for _ in 0..OBFUSCATE_HASH_ITERATIONS {
        digest = Sha1::digest(&digest);
    }

    let mut key = [0u8; OBFUSCATE_KEY_LENGTH];
    key.copy_from_slice(&digest[..OBFUSCATE_KEY_LENGTH]);
    key
}

/// Relay-side decoder used by tests: re-derive the keystream from the seed
/// and unwrap a `seed_message || obfuscated_payload` blob.
#[cfg(test)]
pub(crate) fn deobfuscate(keyword: &str, blob: &[u8]) -> Option<Vec<u8>> {
    if blob.len() < OBFUSCATE_SEED_LENGTH + 8 {
        return None;
    }
    let (seed, rest) = blob.split_at(OBFUSCATE_SEED_LENGTH);

    let key = derive_keystream_key(seed, keyword.as_bytes());
    let mut cipher = Rc4::<U16>::new((&key).into());

    let mut rest = rest.to_vec();
    cipher.apply_keystream(&mut rest);

    let magic = u32::from_be_bytes(rest[0..4].try_into().unwrap());
    if magic != OBFUSCATE_MAGIC_VALUE {
        return None;
    }
    let pad_len = u32::from_be_bytes(rest[4..8].try_into().unwrap()) as usize;
    if rest.len() < 8 + pad_len {
        return None;
    }
    Some(rest[8 + pad_len..].to_vec())
}
