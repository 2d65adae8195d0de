//! Session cookie construction
//!
//! The relay learns everything about a session from a single `Cookie`
//! request header: a small JSON descriptor sealed with NaCl `box` to the
//! relay's embedded public key, optionally wrapped in the stream obfuscator,
//! then base64-encoded under a random single-letter cookie name. The same
//! cookie value is sent on every request of the session; the relay uses it
//! to correlate them.
//!
//! The box nonce is fixed at all zeros. The sender key pair is generated
//! fresh for every cookie and never reused, so nonce uniqueness follows
//! from key uniqueness.

use base64::{Engine, engine::general_purpose::STANDARD};
use crypto_box::aead::{Aead, Nonce, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::Rng;
use serde::Serialize;

use crate::config::MeekConfig;
use crate::obfuscate::{OBFUSCATE_MAX_PADDING, Obfuscator};
use crate::{MeekError, MeekResult};

pub(crate) const MEEK_PROTOCOL_VERSION: u32 = 1;

/// Descriptor the relay unseals from the cookie.
#[derive(Serialize)]
struct SessionDescriptor<'a> {
    v: u32,
    s: &'a str,
    p: &'a str,
}

/// Build the `Cookie` header value for one session.
pub fn make_cookie(config: &MeekConfig) -> MeekResult<String> {
    let descriptor = serde_json::to_vec(&SessionDescriptor {
        v: MEEK_PROTOCOL_VERSION,
        s: &config.session_id,
        p: &config.target_address,
    })
    .map_err(|e| MeekError::Cookie(e.to_string()))?;

    // Seal to the relay key with a single-use ephemeral sender key
    let recipient = PublicKey::from(config.recipient_public_key);
    let ephemeral = SecretKey::generate(&mut OsRng);
    let ephemeral_public = ephemeral.public_key();

    let nonce = Nonce::<SalsaBox>::default();
    let ciphertext = SalsaBox::new(&recipient, &ephemeral)
        .encrypt(&nonce, descriptor.as_slice())
        .map_err(|_| MeekError::Cookie("descriptor encryption failed".to_string()))?;

    let mut sealed = Vec::with_capacity(32 + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);

    let blob = match &config.obfuscation_keyword {
        Some(keyword) => {
            let mut obfuscator = Obfuscator::new(keyword, OBFUSCATE_MAX_PADDING);
            let mut payload = sealed;
            let mut blob = obfuscator.seed_message().to_vec();
            obfuscator.obfuscate(&mut payload);
            blob.extend_from_slice(&payload);
            blob
        }
        None => sealed,
    };

    // The cookie name is observable; vary it so it is not a fixed
    // fingerprint. Not security relevant.
    let name = rand::thread_rng().gen_range(b'A'..=b'Z') as char;

    Ok(format!("{}={}", name, STANDARD.encode(blob)))
}
