//! SASL authentication. PLAIN is only offered over TLS; plaintext
//! connections authenticate with SCRAM-SHA-1 so the password never
//! crosses the wire.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::Error;

type HmacSha1 = Hmac<Sha1>;

const SHA1_LEN: usize = 20;
const GS2_HEADER: &str = "n,,";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    ScramSha1,
}

impl Mechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::ScramSha1 => "SCRAM-SHA-1",
        }
    }

    /// Default mechanism choice: PLAIN only when the transport is
    /// encrypted.
    pub fn for_transport(tls: bool) -> Mechanism {
        if tls {
            Mechanism::Plain
        } else {
            Mechanism::ScramSha1
        }
    }

    pub fn from_name(name: &str) -> Option<Mechanism> {
        match name {
            "PLAIN" => Some(Mechanism::Plain),
            "SCRAM-SHA-1" => Some(Mechanism::ScramSha1),
            _ => None,
        }
    }
}

/// `\0user\0password`, the PLAIN initial response.
pub fn plain_payload(username: &str, password: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
    payload.push(0);
    payload.extend_from_slice(username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    payload
}

/// One SCRAM-SHA-1 exchange (RFC 5802): client-first, server-first,
/// client-final with proof, server-final with signature.
pub struct ScramSha1Client {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramSha1Client {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut nonce_bytes = [0_u8; 18];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        Self::with_nonce(username, password, base64::encode(nonce_bytes))
    }

    pub fn with_nonce(
        username: impl Into<String>,
        password: impl Into<String>,
        client_nonce: String,
    ) -> Self {
        let username = username.into();
        let client_first_bare = format!("n={},r={}", escape_username(&username), client_nonce);
        ScramSha1Client {
            username,
            password: password.into(),
            client_nonce,
            client_first_bare,
            server_signature: None,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn client_first(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Consume the server-first message and produce the client-final
    /// message carrying the proof.
    pub fn step(&mut self, server_first: &[u8]) -> Result<Vec<u8>, Error> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| auth_err("server-first message is not utf-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for field in server_first.split(',') {
            match field.split_once('=') {
                Some(("r", value)) => nonce = Some(value.to_string()),
                Some(("s", value)) => {
                    salt = Some(
                        base64::decode(value).map_err(|_| auth_err("salt is not base64"))?,
                    )
                }
                Some(("i", value)) => {
                    iterations = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| auth_err("iteration count is not numeric"))?,
                    )
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or_else(|| auth_err("server-first carries no nonce"))?;
        let salt = salt.ok_or_else(|| auth_err("server-first carries no salt"))?;
        let iterations = iterations.ok_or_else(|| auth_err("server-first carries no i="))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(auth_err("server nonce does not extend the client nonce"));
        }

        let mut salted_password = [0_u8; SHA1_LEN];
        pbkdf2::pbkdf2::<HmacSha1>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|_| auth_err("pbkdf2 output length mismatch"))?;

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha1::digest(&client_key);

        let without_proof = format!("c={},r={}", base64::encode(GS2_HEADER), nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_signature = hmac(stored_key.as_slice(), auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, signature)| key ^ signature)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key")?;
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes())?);

        Ok(format!("{},p={}", without_proof, base64::encode(proof)).into_bytes())
    }

    /// Check the server proved knowledge of the password too.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), Error> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| auth_err("server-final message is not utf-8"))?;
        let signature = server_final
            .split(',')
            .find_map(|field| field.strip_prefix("v="))
            .ok_or_else(|| auth_err("server-final carries no signature"))?;
        let signature =
            base64::decode(signature).map_err(|_| auth_err("server signature is not base64"))?;

        match &self.server_signature {
            Some(expected) if *expected == signature => Ok(()),
            Some(_) => Err(auth_err("server signature mismatch")),
            None => Err(auth_err("server-final before client-final")),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut mac =
        HmacSha1::new_from_slice(key).map_err(|_| auth_err("invalid hmac key length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn auth_err(message: &str) -> Error {
    Error::AuthenticationFailure(message.to_string())
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}
