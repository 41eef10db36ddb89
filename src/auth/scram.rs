//! SASL PLAIN and SCRAM-SHA{1,256,512} server side.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use super::engine::AuthEngine;
use super::error::ScramError;

const ITERATIONS: u32 = 4096;

/// Mechanisms advertised by SASL_LIST_MECHS, in preference order.
pub const SUPPORTED_MECHANISMS: &str = "PLAIN SCRAM-SHA1 SCRAM-SHA256 SCRAM-SHA512";

/// A SASL mechanism name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    ScramSha1,
    ScramSha256,
    ScramSha512,
}

impl Mechanism {
    pub fn parse(name: &[u8]) -> Result<Self, ScramError> {
        match name {
            b"PLAIN" => Ok(Mechanism::Plain),
            b"SCRAM-SHA1" => Ok(Mechanism::ScramSha1),
            b"SCRAM-SHA256" => Ok(Mechanism::ScramSha256),
            b"SCRAM-SHA512" => Ok(Mechanism::ScramSha512),
            other => Err(ScramError::UnsupportedMechanism(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
        match self {
            Mechanism::Plain | Mechanism::ScramSha1 => mac::<Hmac<Sha1>>(key, data),
            Mechanism::ScramSha256 => mac::<Hmac<Sha256>>(key, data),
            Mechanism::ScramSha512 => mac::<Hmac<Sha512>>(key, data),
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Mechanism::Plain | Mechanism::ScramSha1 => Sha1::digest(data).to_vec(),
            Mechanism::ScramSha256 => Sha256::digest(data).to_vec(),
            Mechanism::ScramSha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn salted_password(self, password: &[u8], salt: &[u8]) -> Result<Vec<u8>, ScramError> {
        let result = match self {
            Mechanism::Plain | Mechanism::ScramSha1 => {
                let mut out = vec![0u8; 20];
                pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, ITERATIONS, &mut out).map(|_| out)
            }
            Mechanism::ScramSha256 => {
                let mut out = vec![0u8; 32];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, ITERATIONS, &mut out).map(|_| out)
            }
            Mechanism::ScramSha512 => {
                let mut out = vec![0u8; 64];
                pbkdf2::pbkdf2::<Hmac<Sha512>>(password, salt, ITERATIONS, &mut out).map(|_| out)
            }
        };
        result.map_err(|_| ScramError::InvalidKey)
    }
}

fn mac<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mut m = <M as KeyInit>::new_from_slice(key).map_err(|_| ScramError::InvalidKey)?;
    m.update(data);
    Ok(m.finalize().into_bytes().to_vec())
}

/// Split a PLAIN payload (`[authzid] NUL user NUL pass`) into user and password.
pub fn parse_plain(payload: &[u8]) -> Result<(String, String), ScramError> {
    let mut parts = payload.split(|b| *b == 0);
    let first = parts.next().ok_or(ScramError::Malformed("empty PLAIN payload"))?;
    let (user, pass) = match (parts.next(), parts.next()) {
        (Some(user), Some(pass)) => (user, pass),
        // Some clients omit the leading authzid separator
        (Some(pass), None) => (first, pass),
        _ => return Err(ScramError::Malformed("PLAIN payload needs user and password")),
    };
    Ok((
        String::from_utf8_lossy(user).into_owned(),
        String::from_utf8_lossy(pass).into_owned(),
    ))
}

/// Look up `key=` in a comma separated SCRAM message.
fn attribute<'a>(message: &'a str, key: char) -> Option<&'a str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        match (chars.next(), chars.next()) {
            (Some(k), Some('=')) if k == key => part.get(2..),
            _ => None,
        }
    })
}

fn random_nonce() -> String {
    let bytes: [u8; 18] = rand::thread_rng().r#gen();
    BASE64.encode(bytes)
}

/// Server half of a SCRAM exchange that has sent its first challenge.
#[derive(Debug)]
pub struct ScramServer {
    mechanism: Mechanism,
    username: String,
    nonce: String,
    client_first_bare: String,
    server_first: String,
    salted_password: Vec<u8>,
}

impl ScramServer {
    /// Process the client-first message and produce the server-first challenge.
    pub fn start(
        mechanism: Mechanism,
        auth: &AuthEngine,
        client_first: &[u8],
    ) -> Result<(Self, Vec<u8>), ScramError> {
        if mechanism == Mechanism::Plain {
            return Err(ScramError::UnsupportedMechanism("PLAIN".to_string()));
        }
        let message = std::str::from_utf8(client_first)
            .map_err(|_| ScramError::Malformed("client-first is not utf-8"))?;

        // Skip the gs2 header ("n,," or "y,,") to reach client-first-bare
        let mut header = message.splitn(3, ',');
        let _cbind = header.next();
        let _authzid = header.next();
        let bare = header
            .next()
            .ok_or(ScramError::Malformed("missing gs2 header"))?;

        let username = attribute(bare, 'n')
            .ok_or(ScramError::Malformed("missing username"))?
            .replace("=2C", ",")
            .replace("=3D", "=");
        let client_nonce = attribute(bare, 'r').ok_or(ScramError::Malformed("missing nonce"))?;

        let password = auth
            .password(&username)
            .ok_or_else(|| ScramError::UnknownUser(username.clone()))?;

        let salt: [u8; 16] = rand::thread_rng().r#gen();
        let nonce = format!("{}{}", client_nonce, random_nonce());
        let server_first = format!("r={},s={},i={}", nonce, BASE64.encode(salt), ITERATIONS);
        let salted_password = mechanism.salted_password(password.as_bytes(), &salt)?;

        let server = Self {
            mechanism,
            username,
            nonce,
            client_first_bare: bare.to_string(),
            server_first: server_first.clone(),
            salted_password,
        };
        Ok((server, server_first.into_bytes()))
    }

    /// Verify the client-final message. On success returns the authenticated
    /// username and the server-final message carrying the server signature.
    pub fn finish(self, client_final: &[u8]) -> Result<(String, Vec<u8>), ScramError> {
        let message = std::str::from_utf8(client_final)
            .map_err(|_| ScramError::Malformed("client-final is not utf-8"))?;

        let (without_proof, proof) = message
            .rsplit_once(",p=")
            .ok_or(ScramError::Malformed("missing proof"))?;
        let nonce = attribute(without_proof, 'r').ok_or(ScramError::Malformed("missing nonce"))?;
        if nonce != self.nonce {
            return Err(ScramError::NonceMismatch);
        }
        let proof = BASE64
            .decode(proof)
            .map_err(|_| ScramError::Malformed("proof is not base64"))?;

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, without_proof
        );
        let m = self.mechanism;
        let client_key = m.hmac(&self.salted_password, b"Client Key")?;
        let stored_key = m.hash(&client_key);
        let client_signature = m.hmac(&stored_key, auth_message.as_bytes())?;
        let expected: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        if expected != proof {
            return Err(ScramError::BadProof);
        }

        let server_key = m.hmac(&self.salted_password, b"Server Key")?;
        let server_signature = m.hmac(&server_key, auth_message.as_bytes())?;
        let server_final = format!("v={}", BASE64.encode(server_signature));
        Ok((self.username, server_final.into_bytes()))
    }
}

/// Client side of SCRAM, used by tests to drive the server.
#[cfg(test)]
pub(crate) mod client {
    use super::*;

    pub fn client_final(
        mechanism: Mechanism,
        password: &str,
        client_first_bare: &str,
        server_first: &str,
    ) -> Result<String, ScramError> {
        let nonce = attribute(server_first, 'r').ok_or(ScramError::Malformed("r"))?;
        let salt = BASE64
            .decode(attribute(server_first, 's').ok_or(ScramError::Malformed("s"))?)
            .map_err(|_| ScramError::Malformed("salt"))?;
        let salted = mechanism.salted_password(password.as_bytes(), &salt)?;
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let client_key = mechanism.hmac(&salted, b"Client Key")?;
        let stored_key = mechanism.hash(&client_key);
        let signature = mechanism.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_exchange(mechanism: Mechanism, password: &str) -> Result<String, ScramError> {
        let auth = AuthEngine::new();
        let bare = "n=Administrator,r=abcdefghijkl";
        let (server, server_first) =
            ScramServer::start(mechanism, &auth, format!("n,,{}", bare).as_bytes())?;
        let server_first = String::from_utf8_lossy(&server_first).into_owned();
        let client_final = client::client_final(mechanism, password, bare, &server_first)?;
        let (user, server_final) = server.finish(client_final.as_bytes())?;
        assert!(server_final.starts_with(b"v="));
        Ok(user)
    }

    #[test]
    fn scram_exchanges_succeed_for_every_hash() {
        for mechanism in [Mechanism::ScramSha1, Mechanism::ScramSha256, Mechanism::ScramSha512] {
            assert_eq!(run_exchange(mechanism, "password").unwrap(), "Administrator");
        }
    }

    #[test]
    fn scram_rejects_wrong_password() {
        assert_eq!(
            run_exchange(Mechanism::ScramSha256, "not-it"),
            Err(ScramError::BadProof)
        );
    }

    #[test]
    fn scram_rejects_unknown_user() {
        let auth = AuthEngine::new();
        let result = ScramServer::start(Mechanism::ScramSha1, &auth, b"n,,n=ghost,r=abc");
        assert!(matches!(result, Err(ScramError::UnknownUser(_))));
    }

    #[test]
    fn plain_payload_parsing() {
        assert_eq!(
            parse_plain(b"\0Administrator\0password").unwrap(),
            ("Administrator".to_string(), "password".to_string())
        );
        assert_eq!(
            parse_plain(b"user\0pw").unwrap(),
            ("user".to_string(), "pw".to_string())
        );
        assert!(parse_plain(b"nothing").is_err());
    }

    #[test]
    fn mechanism_names() {
        assert_eq!(Mechanism::parse(b"SCRAM-SHA512").unwrap(), Mechanism::ScramSha512);
        assert!(Mechanism::parse(b"CRAM-MD5").is_err());
    }
}
