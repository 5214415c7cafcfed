//! SCRAM-SHA-256 client exchange (RFC 5802, RFC 7677).
//!
//! PostgreSQL takes the user name from the startup packet and ignores the
//! one in the SASL exchange, so no SASLprep is applied to it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use super::error::{PgError, PgResult};

type HmacSha256 = Hmac<Sha256>;

/// The only mechanism the driver offers.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding, no authzid".
const GS2_HEADER: &str = "n,,";

enum Stage {
    /// client-first sent, waiting for server-first.
    AwaitingChallenge,
    /// client-final sent, waiting for the server signature.
    AwaitingSignature { expected: [u8; 32] },
    Finished,
}

/// One SCRAM-SHA-256 conversation.
pub struct ScramExchange {
    password: String,
    client_first_bare: String,
    client_nonce: String,
    stage: Stage,
}

impl ScramExchange {
    pub fn new(user: &str, password: &str) -> Self {
        let raw: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, &BASE64.encode(raw))
    }

    pub(crate) fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", escape_name(user), nonce),
            client_nonce: nonce.to_string(),
            stage: Stage::AwaitingChallenge,
        }
    }

    /// Payload of the SASLInitialResponse.
    pub fn initial(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Answer the server-first message with the client-final message.
    pub fn respond(&mut self, challenge: &[u8]) -> PgResult<Vec<u8>> {
        if !matches!(self.stage, Stage::AwaitingChallenge) {
            return Err(scram_error("unexpected SASL continue message"));
        }
        let challenge = std::str::from_utf8(challenge)
            .map_err(|_| scram_error("server-first message is not UTF-8"))?;

        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attr in challenge.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(
                        BASE64
                            .decode(v)
                            .map_err(|_| scram_error("salt is not valid base64"))?,
                    )
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .map_err(|_| scram_error("iteration count is not a number"))?,
                    )
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or_else(|| scram_error("server-first message has no nonce"))?;
        let salt = salt.ok_or_else(|| scram_error("server-first message has no salt"))?;
        let iterations =
            iterations.ok_or_else(|| scram_error("server-first message has no iteration count"))?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(scram_error("server nonce does not extend the client nonce"));
        }

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(self.password.as_bytes(), &salt, iterations, &mut salted)
            .map_err(|e| scram_error(&e.to_string()))?;

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, challenge, without_proof
        );

        let client_key = mac(&salted, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let signature = mac(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        proof.iter_mut().zip(signature).for_each(|(p, s)| *p ^= s);

        let server_key = mac(&salted, b"Server Key")?;
        self.stage = Stage::AwaitingSignature {
            expected: mac(&server_key, auth_message.as_bytes())?,
        };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server-final message.
    pub fn finish(&mut self, outcome: &[u8]) -> PgResult<()> {
        let Stage::AwaitingSignature { expected } = self.stage else {
            return Err(scram_error("unexpected SASL final message"));
        };
        let outcome = std::str::from_utf8(outcome)
            .map_err(|_| scram_error("server-final message is not UTF-8"))?;

        if let Some(reason) = outcome.strip_prefix("e=") {
            return Err(scram_error(reason));
        }
        let verifier = outcome
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| scram_error("server-final message has no verifier"))?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| scram_error("server signature is not valid base64"))?;

        if signature.as_slice() != expected.as_slice() {
            return Err(scram_error("server signature does not match"));
        }
        self.stage = Stage::Finished;
        Ok(())
    }
}

fn mac(key: &[u8], data: &[u8]) -> PgResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| scram_error(&e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// `=` and `,` are the only characters a saslname must escape.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn scram_error(msg: &str) -> PgError {
    PgError::Auth(format!("SCRAM-SHA-256: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[test]
    fn rfc7677_exchange() {
        let mut scram = ScramExchange::with_nonce("user", "pencil", NONCE);
        assert_eq!(scram.initial(), b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec());

        let last = scram.respond(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(
            String::from_utf8(last).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        scram
            .finish(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
    }

    #[test]
    fn rejects_forged_signature() {
        let mut scram = ScramExchange::with_nonce("user", "pencil", NONCE);
        scram.respond(SERVER_FIRST.as_bytes()).unwrap();
        let err = scram.finish(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        assert!(matches!(err, Err(PgError::Auth(_))));
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut scram = ScramExchange::with_nonce("user", "pencil", NONCE);
        let err = scram.respond(b"r=somethingelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096");
        assert!(matches!(err, Err(PgError::Auth(_))));
    }

    #[test]
    fn server_error_attribute_is_reported() {
        let mut scram = ScramExchange::with_nonce("user", "pencil", NONCE);
        scram.respond(SERVER_FIRST.as_bytes()).unwrap();
        match scram.finish(b"e=invalid-proof") {
            Err(PgError::Auth(msg)) => assert!(msg.contains("invalid-proof")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn names_are_escaped() {
        assert_eq!(escape_name("a=b,c"), "a=3Db=2Cc");
    }
}
