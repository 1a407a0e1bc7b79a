/*!
 * SCRAM-SHA-256 authentication for MirageDB
 * Server-side conversation handling and credential storage
 */

use crate::error::{MirageError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

pub type HmacSha256 = Hmac<Sha256>;

/// Minimum PBKDF2 rounds accepted for stored credentials.
pub const MIN_ITERATIONS: u32 = 15_000;
pub const DEFAULT_ITERATIONS: u32 = 15_000;

const SALT_LEN: usize = 16;
const SERVER_NONCE_LEN: usize = 24;

/// Stored SCRAM verifier. The cleartext password never persists.
#[derive(Debug, Clone)]
pub struct ScramCredential {
    pub username: String,
    pub db: String,
    pub salt: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub iteration_count: u32,
}

impl ScramCredential {
    pub fn derive(username: &str, db: &str, password: &str, iteration_count: u32) -> Result<Self> {
        if iteration_count < MIN_ITERATIONS {
            return Err(MirageError::InvalidArgument(format!(
                "iterationCount must be at least {}",
                MIN_ITERATIONS
            )));
        }
        let salt: Vec<u8> = rand::thread_rng()
            .sample_iter(rand::distributions::Standard)
            .take(SALT_LEN)
            .collect();
        Ok(Self::derive_with_salt(
            username,
            db,
            password,
            salt,
            iteration_count,
        ))
    }

    pub fn derive_with_salt(
        username: &str,
        db: &str,
        password: &str,
        salt: Vec<u8>,
        iteration_count: u32,
    ) -> Self {
        let salted = hi(password.as_bytes(), &salt, iteration_count);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key).to_vec();
        let server_key = hmac(&salted, b"Server Key");
        Self {
            username: username.to_string(),
            db: db.to_string(),
            salt,
            stored_key,
            server_key,
            iteration_count,
        }
    }
}

/// PBKDF2-HMAC-SHA-256 (the SCRAM `Hi` function).
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &block);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// In-memory credential store keyed by (db, username).
#[derive(Default)]
pub struct CredentialStore {
    credentials: RwLock<HashMap<(String, String), ScramCredential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, username: &str, db: &str, password: &str) -> Result<()> {
        let credential = ScramCredential::derive(username, db, password, DEFAULT_ITERATIONS)?;
        self.credentials
            .write()
            .insert((db.to_string(), username.to_string()), credential);
        Ok(())
    }

    pub fn remove_user(&self, username: &str, db: &str) -> bool {
        self.credentials
            .write()
            .remove(&(db.to_string(), username.to_string()))
            .is_some()
    }

    pub fn lookup(&self, username: &str, db: &str) -> Option<ScramCredential> {
        self.credentials
            .read()
            .get(&(db.to_string(), username.to_string()))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.read().is_empty()
    }
}

struct Conversation {
    username: String,
    combined_nonce: String,
    client_first_bare: String,
    server_first: String,
    credential: Option<ScramCredential>,
    completed: bool,
}

#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub conversation_id: i64,
    pub payload: Vec<u8>,
    pub done: bool,
}

/// Server side of the SCRAM-SHA-256 exchange. Unknown users receive a
/// deterministic fake challenge so the flow is indistinguishable from a
/// real one until the proof check fails.
pub struct ScramServer {
    store: std::sync::Arc<CredentialStore>,
    conversations: RwLock<HashMap<i64, Conversation>>,
    next_conversation: AtomicI64,
    enumeration_guard: Vec<u8>,
}

impl ScramServer {
    pub fn new(store: std::sync::Arc<CredentialStore>) -> Self {
        let enumeration_guard: Vec<u8> = rand::thread_rng()
            .sample_iter(rand::distributions::Standard)
            .take(32)
            .collect();
        Self {
            store,
            conversations: RwLock::new(HashMap::new()),
            next_conversation: AtomicI64::new(1),
            enumeration_guard,
        }
    }

    pub fn sasl_start(&self, mechanism: &str, payload: &[u8], db: &str) -> Result<SaslResponse> {
        if mechanism != "SCRAM-SHA-256" {
            return Err(MirageError::Unauthorized(format!(
                "unsupported mechanism: {}",
                mechanism
            )));
        }
        let message = std::str::from_utf8(payload)
            .map_err(|_| MirageError::Unauthorized("malformed client-first message".to_string()))?;

        let bare = message
            .strip_prefix("n,,")
            .or_else(|| message.strip_prefix("y,,"))
            .ok_or_else(|| {
                MirageError::Unauthorized("client-first message missing GS2 header".to_string())
            })?;

        let attributes = parse_attributes(bare)?;
        let username = attributes
            .get("n")
            .ok_or_else(|| MirageError::Unauthorized("client-first missing username".to_string()))?
            .clone();
        let client_nonce = attributes
            .get("r")
            .ok_or_else(|| MirageError::Unauthorized("client-first missing nonce".to_string()))?
            .clone();

        let server_nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SERVER_NONCE_LEN)
            .map(char::from)
            .collect();
        let combined_nonce = format!("{}{}", client_nonce, server_nonce);

        let credential = self.store.lookup(&username, db);
        let (salt, iterations) = match &credential {
            Some(c) => (c.salt.clone(), c.iteration_count),
            // Fake, but stable per username: repeated probes see the same
            // salt, just like a real account.
            None => (
                hmac(&self.enumeration_guard, username.as_bytes())[..SALT_LEN].to_vec(),
                DEFAULT_ITERATIONS,
            ),
        };

        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            BASE64.encode(&salt),
            iterations
        );

        let conversation_id = self.next_conversation.fetch_add(1, Ordering::SeqCst);
        self.conversations.write().insert(
            conversation_id,
            Conversation {
                username,
                combined_nonce,
                client_first_bare: bare.to_string(),
                server_first: server_first.clone(),
                credential,
                completed: false,
            },
        );

        Ok(SaslResponse {
            conversation_id,
            payload: server_first.into_bytes(),
            done: false,
        })
    }

    /// Returns the authenticated username on success.
    pub fn sasl_continue(
        &self,
        conversation_id: i64,
        payload: &[u8],
    ) -> Result<(SaslResponse, Option<String>)> {
        let snapshot = {
            let conversations = self.conversations.read();
            let conversation = conversations.get(&conversation_id).ok_or_else(|| {
                MirageError::Unauthorized("no such SASL conversation".to_string())
            })?;
            (
                conversation.username.clone(),
                conversation.combined_nonce.clone(),
                conversation.client_first_bare.clone(),
                conversation.server_first.clone(),
                conversation.credential.clone(),
                conversation.completed,
            )
        };
        let (username, combined_nonce, client_first_bare, server_first, credential, completed) =
            snapshot;

        if completed {
            // Final empty round-trip some drivers send.
            self.abandon(conversation_id);
            return Ok((
                SaslResponse {
                    conversation_id,
                    payload: Vec::new(),
                    done: true,
                },
                Some(username),
            ));
        }

        match self.verify_client_final(payload, &combined_nonce, &client_first_bare, &server_first, credential.as_ref()) {
            Ok(server_signature) => {
                if let Some(conversation) =
                    self.conversations.write().get_mut(&conversation_id)
                {
                    conversation.completed = true;
                }
                Ok((
                    SaslResponse {
                        conversation_id,
                        payload: format!("v={}", BASE64.encode(server_signature)).into_bytes(),
                        done: false,
                    },
                    Some(username),
                ))
            }
            Err(err) => {
                self.abandon(conversation_id);
                Err(err)
            }
        }
    }

    fn verify_client_final(
        &self,
        payload: &[u8],
        combined_nonce: &str,
        client_first_bare: &str,
        server_first: &str,
        credential: Option<&ScramCredential>,
    ) -> Result<Vec<u8>> {
        let message = std::str::from_utf8(payload)
            .map_err(|_| MirageError::Unauthorized("malformed client-final message".to_string()))?;
        let attributes = parse_attributes(message)?;
        let nonce = attributes
            .get("r")
            .ok_or_else(|| MirageError::Unauthorized("client-final missing nonce".to_string()))?;
        let proof_b64 = attributes
            .get("p")
            .ok_or_else(|| MirageError::Unauthorized("client-final missing proof".to_string()))?;

        if nonce != combined_nonce {
            return Err(MirageError::Unauthorized("nonce mismatch".to_string()));
        }

        // A doomed conversation (unknown user) fails here with the same
        // error a wrong password produces.
        let credential = credential.ok_or_else(|| {
            MirageError::Unauthorized("authentication failed".to_string())
        })?;

        let without_proof = message
            .rsplit_once(",p=")
            .map(|(head, _)| head)
            .unwrap_or(message);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_signature = hmac(&credential.stored_key, auth_message.as_bytes());
        let proof = BASE64
            .decode(proof_b64)
            .map_err(|_| MirageError::Unauthorized("malformed proof".to_string()))?;
        if proof.len() != client_signature.len() {
            return Err(MirageError::Unauthorized(
                "authentication failed".to_string(),
            ));
        }
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        if Sha256::digest(&client_key).as_slice() != credential.stored_key.as_slice() {
            return Err(MirageError::Unauthorized(
                "authentication failed".to_string(),
            ));
        }

        Ok(hmac(&credential.server_key, auth_message.as_bytes()))
    }

    pub fn abandon(&self, conversation_id: i64) {
        self.conversations.write().remove(&conversation_id);
    }
}

fn parse_attributes(message: &str) -> Result<HashMap<String, String>> {
    let mut attributes = HashMap::new();
    for part in message.split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => {
                attributes.insert(key.to_string(), value.to_string());
            }
            None => {
                return Err(MirageError::Unauthorized(format!(
                    "malformed SCRAM attribute: {}",
                    part
                )))
            }
        }
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Drive a full client-side SCRAM exchange against the server.
    fn client_roundtrip(server: &ScramServer, username: &str, password: &str, db: &str) -> Result<String> {
        let client_nonce = "clientnonce0123";
        let client_first_bare = format!("n={},r={}", username, client_nonce);
        let start = server.sasl_start(
            "SCRAM-SHA-256",
            format!("n,,{}", client_first_bare).as_bytes(),
            db,
        )?;

        let server_first = String::from_utf8(start.payload).unwrap();
        let attributes = parse_attributes(&server_first)?;
        let combined_nonce = attributes.get("r").unwrap().clone();
        let salt = BASE64.decode(attributes.get("s").unwrap()).unwrap();
        let iterations: u32 = attributes.get("i").unwrap().parse().unwrap();

        let salted = hi(password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key).to_vec();
        let without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();
        let client_final = format!("{},p={}", without_proof, BASE64.encode(proof));

        let (response, user) = server.sasl_continue(start.conversation_id, client_final.as_bytes())?;
        assert!(String::from_utf8(response.payload).unwrap().starts_with("v="));
        Ok(user.unwrap())
    }

    #[test]
    fn test_successful_authentication() {
        let store = Arc::new(CredentialStore::new());
        store.add_user("ada", "admin", "hunter22").unwrap();
        let server = ScramServer::new(store);
        let user = client_roundtrip(&server, "ada", "hunter22", "admin").unwrap();
        assert_eq!(user, "ada");
    }

    #[test]
    fn test_wrong_password_rejected() {
        let store = Arc::new(CredentialStore::new());
        store.add_user("ada", "admin", "hunter22").unwrap();
        let server = ScramServer::new(store);
        assert!(client_roundtrip(&server, "ada", "wrong", "admin").is_err());
    }

    #[test]
    fn test_unknown_user_gets_challenge() {
        let server = ScramServer::new(Arc::new(CredentialStore::new()));
        let start = server
            .sasl_start("SCRAM-SHA-256", b"n,,n=ghost,r=abc", "admin")
            .unwrap();
        let server_first = String::from_utf8(start.payload).unwrap();
        assert!(server_first.starts_with("r=abc"));
        assert!(server_first.contains(",s="));
        assert!(server_first.contains(",i="));
    }

    #[test]
    fn test_low_iteration_count_rejected() {
        assert!(ScramCredential::derive("u", "admin", "pw", 1000).is_err());
    }
}
