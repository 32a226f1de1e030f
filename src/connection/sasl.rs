//! SASL mechanism negotiation and the SCRAM/PLAIN client-side state machines used to
//! authenticate a data connection (§4.3).

use base64::engine::general_purpose::STANDARD as base64_standard;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{CoreError, Result};

/// The mechanisms this client can perform, in descending preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha512,
    ScramSha256,
    ScramSha1,
    Plain,
}

impl Mechanism {
    pub const fn wire_name(self) -> &'static str {
        match self {
            Mechanism::ScramSha512 => "SCRAM-SHA512",
            Mechanism::ScramSha256 => "SCRAM-SHA256",
            Mechanism::ScramSha1 => "SCRAM-SHA1",
            Mechanism::Plain => "PLAIN",
        }
    }

    /// Picks the strongest mechanism the server advertised, honoring
    /// `force_sasl_plain` (§6) by restricting the candidate list to PLAIN alone.
    pub fn select(server_mechanisms: &str, force_sasl_plain: bool) -> Option<Mechanism> {
        let offered: Vec<&str> = server_mechanisms.split_whitespace().collect();
        let preference = if force_sasl_plain {
            &[Mechanism::Plain][..]
        } else {
            &[
                Mechanism::ScramSha512,
                Mechanism::ScramSha256,
                Mechanism::ScramSha1,
                Mechanism::Plain,
            ][..]
        };
        preference.iter().copied().find(|m| offered.contains(&m.wire_name()))
    }
}

/// A PLAIN auth message: `\0username\0password`, sent as a single `SASLAuth` body.
pub fn plain_message(username: &str, password: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(username.len() + password.len() + 2);
    msg.push(0);
    msg.extend_from_slice(username.as_bytes());
    msg.push(0);
    msg.extend_from_slice(password.as_bytes());
    msg
}

fn random_nonce() -> String {
    let bytes: [u8; 18] = rand::thread_rng().r#gen();
    base64_standard.encode(bytes)
}

/// Parses a SCRAM server-first-message (`r=...,s=...,i=...`) into its three fields.
fn parse_server_first(msg: &str) -> Result<(String, Vec<u8>, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;
    for field in msg.split(',') {
        if let Some(v) = field.strip_prefix("r=") {
            nonce = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("s=") {
            salt = Some(base64_standard.decode(v).map_err(|e| {
                CoreError::SaslRejected(format!("invalid SCRAM salt: {e}"))
            })?);
        } else if let Some(v) = field.strip_prefix("i=") {
            iterations = Some(v.parse::<u32>().map_err(|e| {
                CoreError::SaslRejected(format!("invalid SCRAM iteration count: {e}"))
            })?);
        }
    }
    match (nonce, salt, iterations) {
        (Some(n), Some(s), Some(i)) => Ok((n, s, i)),
        _ => Err(CoreError::SaslRejected("malformed SCRAM server-first message".into())),
    }
}

/// Generic over the hash function used by a SCRAM variant, following RFC 5802: a
/// client-first-message bare, then a client-final-message built once the
/// server-first-message's salt/iteration-count/combined-nonce are known.
trait ScramHash {
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;
    fn hash(data: &[u8]) -> Vec<u8>;
    fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

macro_rules! scram_hash_impl {
    ($name:ident, $digest:ty) => {
        struct $name;
        impl ScramHash for $name {
            fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
                let mut mac = Hmac::<$digest>::new_from_slice(key).expect("hmac accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }

            fn hash(data: &[u8]) -> Vec<u8> {
                let mut hasher = <$digest as Digest>::new();
                hasher.update(data);
                hasher.finalize().to_vec()
            }

            fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
                let mut result = Self::hmac(password, &[salt, &1u32.to_be_bytes()].concat());
                let mut previous = result.clone();
                for _ in 1..iterations {
                    previous = Self::hmac(password, &previous);
                    for (r, p) in result.iter_mut().zip(previous.iter()) {
                        *r ^= p;
                    }
                }
                result
            }
        }
    };
}

scram_hash_impl!(ScramSha512Hash, Sha512);
scram_hash_impl!(ScramSha256Hash, Sha256);
scram_hash_impl!(ScramSha1Hash, Sha1);

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Drives one SCRAM exchange to completion: returns the client-first message to send
/// as `SASLAuth`'s body, and a closure-like continuation isn't needed because the
/// protocol is exactly two round trips — callers hold onto the returned `ScramClient`
/// and call `client_final` with the server's first-message reply.
pub struct ScramClient {
    mechanism: Mechanism,
    username: String,
    password: String,
    client_nonce: String,
}

impl ScramClient {
    pub fn new(mechanism: Mechanism, username: &str, password: &str) -> Self {
        ScramClient {
            mechanism,
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: random_nonce(),
        }
    }

    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,n={},r={}", self.username, self.client_nonce).into_bytes()
    }

    /// Builds the client-final-message given the server's first-message reply.
    /// Returns `(message, expected_server_signature_b64)`; the caller verifies the
    /// server's final message's `v=` field against the latter before treating auth
    /// as complete.
    pub fn client_final_message(&self, server_first: &[u8]) -> Result<(Vec<u8>, String)> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| CoreError::SaslRejected("server-first message is not UTF-8".into()))?;
        let (server_nonce, salt, iterations) = parse_server_first(server_first)?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(CoreError::SaslRejected(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let channel_binding = base64_standard.encode(b"n,,");
        let client_final_no_proof = format!("c={channel_binding},r={server_nonce}");
        let auth_message = format!(
            "n={},r={},{},{}",
            self.username, self.client_nonce, server_first, client_final_no_proof
        );

        macro_rules! finish {
            ($h:ty) => {{
                let salted_password = <$h>::salted_password(self.password.as_bytes(), &salt, iterations);
                let client_key = <$h>::hmac(&salted_password, b"Client Key");
                let stored_key = <$h>::hash(&client_key);
                let client_signature = <$h>::hmac(&stored_key, auth_message.as_bytes());
                let client_proof = xor(&client_key, &client_signature);
                let server_key = <$h>::hmac(&salted_password, b"Server Key");
                let server_signature = <$h>::hmac(&server_key, auth_message.as_bytes());
                (client_proof, server_signature)
            }};
        }

        let (client_proof, server_signature) = match self.mechanism {
            Mechanism::ScramSha512 => finish!(ScramSha512Hash),
            Mechanism::ScramSha256 => finish!(ScramSha256Hash),
            Mechanism::ScramSha1 => finish!(ScramSha1Hash),
            Mechanism::Plain => {
                return Err(CoreError::Internal("PLAIN has no SCRAM continuation".into()));
            }
        };

        let message = format!(
            "{client_final_no_proof},p={}",
            base64_standard.encode(client_proof)
        );
        Ok((message.into_bytes(), base64_standard.encode(server_signature)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_prefers_strongest_offered_mechanism() {
        let m = Mechanism::select("PLAIN SCRAM-SHA1 SCRAM-SHA256", false);
        assert_eq!(m, Some(Mechanism::ScramSha256));
    }

    #[test]
    fn force_plain_restricts_selection_even_when_scram_is_offered() {
        let m = Mechanism::select("SCRAM-SHA512 PLAIN", true);
        assert_eq!(m, Some(Mechanism::Plain));
    }

    #[test]
    fn select_returns_none_when_nothing_overlaps() {
        assert_eq!(Mechanism::select("GSSAPI", false), None);
    }

    #[test]
    fn client_final_rejects_server_nonce_not_extending_client_nonce() {
        let client = ScramClient::new(Mechanism::ScramSha256, "user", "pw");
        let bogus = b"r=totally-different,s=c2FsdA==,i=4096";
        assert!(client.client_final_message(bogus).is_err());
    }

    #[test]
    fn client_final_accepts_well_formed_server_first() {
        let client = ScramClient::new(Mechanism::ScramSha256, "user", "pw");
        let server_first = format!("r={}extra,s={},i=4096", client.client_nonce, base64_standard.encode(b"salt1234"));
        let (message, signature) = client.client_final_message(server_first.as_bytes()).unwrap();
        let message = String::from_utf8(message).unwrap();
        assert!(message.contains("p="));
        assert!(!signature.is_empty());
    }
}
