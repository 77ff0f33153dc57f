//! SCRAM-SHA-256 Authentication
//!
//! Implements the SASL SCRAM-SHA-256 authentication mechanism for PostgreSQL
//! and the state machine that drives it across 'R' frames.
//! Reference: RFC 5802, RFC 7677, PostgreSQL SASL documentation.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::wire::{AuthRequest, FrontendMessage};
use crate::error::{PgError, PgResult};

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism this client speaks.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// base64("n,,") - GS2 header without channel binding.
const CHANNEL_BINDING: &str = "biws";

const NONCE_LEN: usize = 24;

/// SCRAM-SHA-256 client: nonce, key derivation, proof, and server verification.
pub struct ScramClient {
    /// Username, escaped for the `n=` attribute
    username: String,
    /// Password after SASLprep
    password: String,
    client_nonce: String,
    /// Auth message for signature verification
    auth_message: Option<String>,
    /// Salted password (cached for verification)
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    /// Create a new SCRAM client with a fresh random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        let mut rng = rand::rng();
        let chars = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let nonce: String = (0..NONCE_LEN)
            .map(|_| chars[rng.random_range(0..chars.len())] as char)
            .collect();
        Self::with_nonce(username, password, &nonce)
    }

    /// Create a client with a caller-chosen nonce (golden-vector testing).
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: escape_saslname(username),
            password: normalize_password(password),
            client_nonce: nonce.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    pub fn client_nonce(&self) -> &str {
        &self.client_nonce
    }

    /// Generate the client-first-message.
    ///
    /// Format: `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_message_bare()).into_bytes()
    }

    fn client_first_message_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Process the server-first-message and generate client-final-message.
    ///
    /// Server-first-message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> PgResult<Vec<u8>> {
        let server_str = std::str::from_utf8(server_msg)
            .map_err(|_| PgError::auth("invalid UTF-8 in server-first-message"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|_| PgError::auth("invalid salt base64"))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                let count = value
                    .parse::<u32>()
                    .map_err(|_| PgError::auth(format!("non-numeric iteration count '{}'", value)))?;
                iterations = Some(count);
            }
        }

        let nonce = nonce.ok_or_else(|| PgError::auth("missing nonce in server-first-message"))?;
        let salt = salt.ok_or_else(|| PgError::auth("missing salt in server-first-message"))?;
        let iterations = iterations
            .ok_or_else(|| PgError::auth("missing iteration count in server-first-message"))?;
        if iterations == 0 {
            return Err(PgError::auth("iteration count must be positive"));
        }

        // The combined nonce must extend ours
        if !nonce.starts_with(&self.client_nonce) {
            return Err(PgError::auth("server nonce does not contain client nonce"));
        }

        let salted_password = salted_password(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c={},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_str,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor(&client_key, &client_signature);

        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        );
        Ok(client_final.into_bytes())
    }

    /// Verify the server-final-message (server signature).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> PgResult<()> {
        let server_str = std::str::from_utf8(server_msg)
            .map_err(|_| PgError::auth("invalid UTF-8 in server-final-message"))?;

        if let Some(err) = server_str.strip_prefix("e=") {
            return Err(PgError::auth(format!("server rejected proof: {}", err)));
        }

        let verifier = server_str
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| PgError::auth("missing verifier in server-final-message"))?;
        let received = BASE64
            .decode(verifier)
            .map_err(|_| PgError::auth("invalid base64 in server signature"))?;

        let (Some(salted_password), Some(auth_message)) =
            (self.salted_password.as_ref(), self.auth_message.as_ref())
        else {
            return Err(PgError::auth("server-final-message before server-first-message"));
        };

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if !bool::from(expected.as_slice().ct_eq(&received)) {
            return Err(PgError::auth("server signature mismatch"));
        }
        Ok(())
    }
}

/// Byte-wise XOR, truncated to the shorter operand.
pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// PBKDF2-HMAC-SHA-256, 32-byte output.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut output);
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> PgResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| PgError::auth(format!("HMAC init failed: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SASLprep, keeping the raw password when it contains prohibited output.
fn normalize_password(password: &str) -> String {
    match stringprep::saslprep(password) {
        Ok(prepped) => prepped.into_owned(),
        Err(_) => password.to_string(),
    }
}

/// RFC 5802 `saslname`: `=` → `=3D`, `,` → `=2C`.
fn escape_saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Phase of the authentication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Startup sent; waiting for the mechanism offer (or trust `Ok`).
    AwaitingMechanisms,
    /// client-first-message sent.
    AwaitingServerFirst,
    /// client-final-message sent; waiting for the server signature and `Ok`.
    AwaitingOutcome,
    Authenticated,
    Failed,
}

/// What the caller should do after an authentication request.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthStep {
    /// Write this message, then keep reading.
    Send(FrontendMessage),
    /// Nothing to send; keep reading.
    Wait,
    /// Handshake complete.
    Authenticated,
}

/// Drives the SCRAM exchange across 'R' frames.
///
/// Owns the per-attempt secrets; dropped once the handshake ends.
pub struct Authenticator {
    phase: AuthPhase,
    scram: ScramClient,
    has_password: bool,
    server_verified: bool,
}

impl Authenticator {
    pub fn new(user: &str, password: Option<&str>) -> Self {
        Self::from_client(ScramClient::new(user, password.unwrap_or_default()), password.is_some())
    }

    /// Use a prepared client (fixed nonce).
    pub fn from_client(scram: ScramClient, has_password: bool) -> Self {
        Self {
            phase: AuthPhase::AwaitingMechanisms,
            scram,
            has_password,
            server_verified: false,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Mark the handshake failed (e.g. server sent an ErrorResponse).
    pub fn fail(&mut self) {
        self.phase = AuthPhase::Failed;
    }

    /// Advance on one authentication request.
    ///
    /// Any error moves to `Failed`; from `Failed` every request is refused
    /// and nothing is ever sent.
    pub fn on_request(&mut self, request: AuthRequest) -> PgResult<AuthStep> {
        if self.phase == AuthPhase::Failed {
            return Err(PgError::auth("handshake already failed"));
        }
        let result = self.step(request);
        match &result {
            Ok(_) => debug!(phase = ?self.phase, "authentication step"),
            Err(e) => {
                warn!(phase = ?self.phase, error = %e, "authentication failed");
                self.phase = AuthPhase::Failed;
            }
        }
        result
    }

    fn step(&mut self, request: AuthRequest) -> PgResult<AuthStep> {
        match (self.phase, request) {
            (AuthPhase::AwaitingMechanisms, AuthRequest::Ok) => {
                info!("authenticated without password challenge");
                self.phase = AuthPhase::Authenticated;
                Ok(AuthStep::Authenticated)
            }
            (AuthPhase::AwaitingMechanisms, AuthRequest::Sasl(mechanisms)) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::auth(format!(
                        "server doesn't offer {}. Available: {:?}",
                        SCRAM_SHA_256, mechanisms
                    )));
                }
                if !self.has_password {
                    return Err(PgError::auth("password required for SCRAM authentication"));
                }
                self.phase = AuthPhase::AwaitingServerFirst;
                Ok(AuthStep::Send(FrontendMessage::SaslInitialResponse {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data: self.scram.client_first_message(),
                }))
            }
            (AuthPhase::AwaitingServerFirst, AuthRequest::SaslContinue(data)) => {
                let final_message = self.scram.process_server_first(&data)?;
                self.phase = AuthPhase::AwaitingOutcome;
                Ok(AuthStep::Send(FrontendMessage::SaslResponse(final_message)))
            }
            (AuthPhase::AwaitingOutcome, AuthRequest::SaslFinal(data)) if !self.server_verified => {
                self.scram.verify_server_final(&data)?;
                self.server_verified = true;
                Ok(AuthStep::Wait)
            }
            (AuthPhase::AwaitingOutcome, AuthRequest::Ok) => {
                if !self.server_verified {
                    return Err(PgError::auth(
                        "server accepted without proving its signature",
                    ));
                }
                info!("SCRAM-SHA-256 authentication complete");
                self.phase = AuthPhase::Authenticated;
                Ok(AuthStep::Authenticated)
            }
            (_, AuthRequest::Unsupported(code)) => Err(PgError::auth(format!(
                "unsupported authentication request code {}",
                code
            ))),
            (phase, request) => Err(PgError::auth(format!(
                "unexpected {} while {:?}",
                request_name(&request),
                phase
            ))),
        }
    }
}

fn request_name(request: &AuthRequest) -> &'static str {
    match request {
        AuthRequest::Ok => "AuthenticationOk",
        AuthRequest::Sasl(_) => "AuthenticationSASL",
        AuthRequest::SaslContinue(_) => "AuthenticationSASLContinue",
        AuthRequest::SaslFinal(_) => "AuthenticationSASLFinal",
        AuthRequest::Unsupported(_) => "unsupported request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // RFC 7677 section 3
    const RFC_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const RFC_SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const RFC_CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const RFC_SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    fn rfc_client() -> ScramClient {
        ScramClient::with_nonce("user", "pencil", RFC_NONCE)
    }

    /// Straight-line derivation used as an independent reference.
    fn reference_final(user: &str, nonce: &str, password: &str, server_first: &str) -> String {
        let mut attrs = server_first.split(',');
        let server_nonce = attrs.next().unwrap().strip_prefix("r=").unwrap();
        let salt = BASE64.decode(attrs.next().unwrap().strip_prefix("s=").unwrap()).unwrap();
        let iterations: u32 = attrs.next().unwrap().strip_prefix("i=").unwrap().parse().unwrap();

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut salted);
        let mut mac = HmacSha256::new_from_slice(&salted).unwrap();
        mac.update(b"Client Key");
        let client_key = mac.finalize().into_bytes();
        let stored_key = Sha256::digest(client_key);
        let auth_message = format!("n={},r={},{},c=biws,r={}", user, nonce, server_first, server_nonce);
        let mut mac = HmacSha256::new_from_slice(&stored_key).unwrap();
        mac.update(auth_message.as_bytes());
        let signature = mac.finalize().into_bytes();
        let proof: Vec<u8> = client_key.iter().zip(signature.iter()).map(|(a, b)| a ^ b).collect();
        format!("c=biws,r={},p={}", server_nonce, BASE64.encode(proof))
    }

    #[test]
    fn test_client_first_message() {
        let msg = String::from_utf8(rfc_client().client_first_message()).unwrap();
        assert_eq!(msg, "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");
    }

    #[test]
    fn test_random_nonce() {
        let a = ScramClient::new("user", "pw");
        let b = ScramClient::new("user", "pw");
        assert_eq!(a.client_nonce().len(), NONCE_LEN);
        assert!(a.client_nonce().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.client_nonce(), b.client_nonce());
    }

    #[test]
    fn test_username_escaping() {
        let client = ScramClient::with_nonce("a=b,c", "pw", "n");
        let msg = String::from_utf8(client.client_first_message()).unwrap();
        assert_eq!(msg, "n,,n=a=3Db=2Cc,r=n");
    }

    #[test]
    fn test_rfc7677_golden_vector() {
        let mut client = rfc_client();
        let final_msg = client.process_server_first(RFC_SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(final_msg).unwrap(), RFC_CLIENT_FINAL);
        client.verify_server_final(RFC_SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_proof_is_deterministic() {
        let first = rfc_client().process_server_first(RFC_SERVER_FIRST.as_bytes()).unwrap();
        let second = rfc_client().process_server_first(RFC_SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_short_server_nonce_matches_reference() {
        let salt = BASE64.encode(b"pepper-salt-16by");
        let server_first = format!("r=abc,s={},i=4096", salt);
        let mut client = ScramClient::with_nonce("user", "secret", "ab");
        let final_msg = client.process_server_first(server_first.as_bytes()).unwrap();
        let final_msg = String::from_utf8(final_msg).unwrap();
        assert!(final_msg.starts_with("c=biws,r=abc,p="));
        assert_eq!(final_msg, reference_final("user", "ab", "secret", &server_first));
    }

    #[test]
    fn test_xor_is_involutive() {
        let a: Vec<u8> = (0u8..32).map(|i| i.wrapping_mul(37)).collect();
        let b: Vec<u8> = (0u8..32).map(|i| i.wrapping_mul(11) ^ 0x5a).collect();
        assert_eq!(xor(&xor(&a, &b), &b), a);
        assert_eq!(xor(&[1, 2, 3], &[1]).len(), 1);
    }

    #[test]
    fn test_missing_salt_or_iterations() {
        let mut client = ScramClient::with_nonce("user", "pw", "n");
        assert!(client.process_server_first(b"r=nX,i=4096").is_err());
        assert!(client.process_server_first(b"r=nX,s=c2FsdA==").is_err());
        assert!(client.process_server_first(b"r=nX,s=c2FsdA==,i=lots").is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut client = ScramClient::with_nonce("user", "pw", "n");
        let err = client.process_server_first(b"r=nX,s=c2FsdA==,i=0").unwrap_err();
        assert!(matches!(err, PgError::Auth(_)));
        assert!(err.to_string().contains("iteration count"));
    }

    #[test]
    fn test_server_final_error_attribute() {
        let mut client = rfc_client();
        client.process_server_first(RFC_SERVER_FIRST.as_bytes()).unwrap();
        let err = client.verify_server_final(b"e=invalid-proof").unwrap_err();
        assert!(err.to_string().contains("invalid-proof"));

        let mut auth = rfc_authenticator();
        auth.on_request(AuthRequest::Sasl(vec![SCRAM_SHA_256.to_string()])).unwrap();
        auth.on_request(AuthRequest::SaslContinue(RFC_SERVER_FIRST.as_bytes().to_vec()))
            .unwrap();
        assert!(auth.on_request(AuthRequest::SaslFinal(b"e=other-error".to_vec())).is_err());
        assert_eq!(auth.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_foreign_server_nonce_rejected() {
        let mut client = ScramClient::with_nonce("user", "pw", "mine");
        let err = client.process_server_first(b"r=theirs,s=c2FsdA==,i=4096").unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    #[test]
    fn test_server_signature_mismatch() {
        let mut client = rfc_client();
        client.process_server_first(RFC_SERVER_FIRST.as_bytes()).unwrap();
        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(client.verify_server_final(forged.as_bytes()).is_err());
    }

    fn rfc_authenticator() -> Authenticator {
        Authenticator::from_client(rfc_client(), true)
    }

    #[test]
    fn test_full_state_machine() {
        let mut auth = rfc_authenticator();
        let step = auth
            .on_request(AuthRequest::Sasl(vec![SCRAM_SHA_256.to_string()]))
            .unwrap();
        assert_eq!(
            step,
            AuthStep::Send(FrontendMessage::SaslInitialResponse {
                mechanism: SCRAM_SHA_256.to_string(),
                data: b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec(),
            })
        );
        assert_eq!(auth.phase(), AuthPhase::AwaitingServerFirst);

        let step = auth
            .on_request(AuthRequest::SaslContinue(RFC_SERVER_FIRST.as_bytes().to_vec()))
            .unwrap();
        assert_eq!(
            step,
            AuthStep::Send(FrontendMessage::SaslResponse(RFC_CLIENT_FINAL.as_bytes().to_vec()))
        );
        assert_eq!(auth.phase(), AuthPhase::AwaitingOutcome);

        let step = auth
            .on_request(AuthRequest::SaslFinal(RFC_SERVER_FINAL.as_bytes().to_vec()))
            .unwrap();
        assert_eq!(step, AuthStep::Wait);
        assert_eq!(auth.on_request(AuthRequest::Ok).unwrap(), AuthStep::Authenticated);
        assert_eq!(auth.phase(), AuthPhase::Authenticated);
    }

    #[test]
    fn test_trust_auth() {
        let mut auth = Authenticator::new("user", None);
        assert_eq!(auth.on_request(AuthRequest::Ok).unwrap(), AuthStep::Authenticated);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut auth = rfc_authenticator();
        // Challenge before the mechanism offer is out of sequence.
        assert!(auth
            .on_request(AuthRequest::SaslContinue(RFC_SERVER_FIRST.as_bytes().to_vec()))
            .is_err());
        assert_eq!(auth.phase(), AuthPhase::Failed);

        let inputs = vec![
            AuthRequest::Sasl(vec![SCRAM_SHA_256.to_string()]),
            AuthRequest::SaslContinue(RFC_SERVER_FIRST.as_bytes().to_vec()),
            AuthRequest::SaslFinal(RFC_SERVER_FINAL.as_bytes().to_vec()),
            AuthRequest::Ok,
        ];
        for input in inputs {
            assert!(auth.on_request(input).is_err());
            assert_eq!(auth.phase(), AuthPhase::Failed);
        }
    }

    #[test]
    fn test_unsupported_mechanism_and_code() {
        let mut auth = rfc_authenticator();
        assert!(auth
            .on_request(AuthRequest::Sasl(vec!["SCRAM-SHA-256-PLUS".to_string()]))
            .is_err());

        let mut auth = rfc_authenticator();
        assert!(auth.on_request(AuthRequest::Unsupported(5)).is_err());
        assert_eq!(auth.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_password_required_for_sasl() {
        let mut auth = Authenticator::new("user", None);
        let err = auth
            .on_request(AuthRequest::Sasl(vec![SCRAM_SHA_256.to_string()]))
            .unwrap_err();
        assert!(err.to_string().contains("password required"));
    }

    #[test]
    fn test_ok_without_server_signature_fails() {
        let mut auth = rfc_authenticator();
        auth.on_request(AuthRequest::Sasl(vec![SCRAM_SHA_256.to_string()])).unwrap();
        auth.on_request(AuthRequest::SaslContinue(RFC_SERVER_FIRST.as_bytes().to_vec()))
            .unwrap();
        assert!(auth.on_request(AuthRequest::Ok).is_err());
        assert_eq!(auth.phase(), AuthPhase::Failed);
    }
}
