/*!
 * Authentication tests
 * SCRAM-SHA-256 conversations over the command surface
 */

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bson::{doc, spec::BinarySubtype, Bson, Document};
use hmac::{Hmac, Mac};
use miragedb::auth::{CredentialStore, ScramServer};
use miragedb::change_stream::ChangeStreamBroker;
use miragedb::commands::{CommandProcessor, Session};
use miragedb::cursor::CursorRegistry;
use miragedb::memory_backend::MemoryBackend;
use miragedb::router::{QueryRouter, RouterConfig};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type HmacSha256 = Hmac<Sha256>;

fn processor(auth_enabled: bool, seed_users: &[(&str, &str, &str)]) -> CommandProcessor {
    let registry = Arc::new(CursorRegistry::new(Duration::from_secs(600)));
    let backend = Arc::new(MemoryBackend::new(
        registry,
        Arc::new(ChangeStreamBroker::default()),
    ));
    let store = Arc::new(CredentialStore::new());
    for (user, db, password) in seed_users {
        store.add_user(user, db, password).unwrap();
    }
    CommandProcessor::new(
        backend,
        None,
        QueryRouter::new(RouterConfig::default()),
        Arc::new(ScramServer::new(store)),
        auth_enabled,
    )
}

fn binary(bytes: Vec<u8>) -> Bson {
    Bson::Binary(bson::Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    })
}

fn payload_of(response: &Document) -> Vec<u8> {
    match response.get("payload") {
        Some(Bson::Binary(b)) => b.bytes.clone(),
        other => panic!("expected binary payload, got {:?}", other),
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac_sha256(password, &block);
    let mut out = u.clone();
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    out
}

fn parse_scram(message: &str) -> HashMap<String, String> {
    message
        .split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Drive the SCRAM-SHA-256 client side through saslStart/saslContinue.
async fn authenticate(
    processor: &CommandProcessor,
    session: &mut Session,
    username: &str,
    password: &str,
) -> Result<(), miragedb::MirageError> {
    let cancel = CancellationToken::new();
    let client_nonce = "rOprNGfwEbeRWgbNEkqO";
    let client_first_bare = format!("n={},r={}", username, client_nonce);

    let start = processor
        .handle(
            doc! {
                "saslStart": 1,
                "mechanism": "SCRAM-SHA-256",
                "payload": binary(format!("n,,{}", client_first_bare).into_bytes()),
                "$db": "admin",
            },
            session,
            &cancel,
        )
        .await?;
    let conversation_id = start.get_i64("conversationId").unwrap();
    let server_first = String::from_utf8(payload_of(&start)).unwrap();
    let attrs = parse_scram(&server_first);

    let combined_nonce = attrs["r"].clone();
    assert!(combined_nonce.starts_with(client_nonce));
    let salt = BASE64.decode(&attrs["s"]).unwrap();
    let iterations: u32 = attrs["i"].parse().unwrap();
    assert!(iterations >= 15_000);

    let salted = pbkdf2_sha256(password.as_bytes(), &salt, iterations);
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key).to_vec();
    let without_proof = format!("c=biws,r={}", combined_nonce);
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let proof: Vec<u8> = client_key
        .iter()
        .zip(signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();
    let client_final = format!("{},p={}", without_proof, BASE64.encode(proof));

    let next = processor
        .handle(
            doc! {
                "saslContinue": 1,
                "conversationId": conversation_id,
                "payload": binary(client_final.into_bytes()),
                "$db": "admin",
            },
            session,
            &cancel,
        )
        .await?;
    let verifier = String::from_utf8(payload_of(&next)).unwrap();
    assert!(verifier.starts_with("v="));

    // Drivers finish with an empty saslContinue round.
    let done = processor
        .handle(
            doc! {
                "saslContinue": 1,
                "conversationId": conversation_id,
                "payload": binary(Vec::new()),
                "$db": "admin",
            },
            session,
            &cancel,
        )
        .await?;
    assert!(done.get_bool("done").unwrap());
    Ok(())
}

#[tokio::test]
async fn test_full_scram_exchange_authenticates_session() {
    let processor = processor(true, &[("ada", "admin", "correct horse")]);
    let mut session = Session::default();

    authenticate(&processor, &mut session, "ada", "correct horse")
        .await
        .unwrap();
    assert_eq!(session.authenticated.as_deref(), Some("ada"));
}

#[tokio::test]
async fn test_wrong_password_fails_and_session_stays_unauthenticated() {
    let processor = processor(true, &[("ada", "admin", "correct horse")]);
    let mut session = Session::default();

    let err = authenticate(&processor, &mut session, "ada", "wrong")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 13);
    assert!(session.authenticated.is_none());
}

#[tokio::test]
async fn test_unknown_user_gets_indistinguishable_challenge() {
    let processor = processor(true, &[]);
    let mut session = Session::default();
    let cancel = CancellationToken::new();

    let start = processor
        .handle(
            doc! {
                "saslStart": 1,
                "mechanism": "SCRAM-SHA-256",
                "payload": binary(b"n,,n=ghost,r=abcdef".to_vec()),
                "$db": "admin",
            },
            &mut session,
            &cancel,
        )
        .await
        .unwrap();
    // saslStart always succeeds: the challenge leaks nothing about
    // whether the user exists.
    assert_eq!(start.get_f64("ok").unwrap(), 1.0);
    let server_first = String::from_utf8(payload_of(&start)).unwrap();
    let attrs = parse_scram(&server_first);
    assert!(attrs.contains_key("s"));
    assert!(attrs.contains_key("i"));
}

#[tokio::test]
async fn test_commands_gated_until_authenticated() {
    let processor = processor(true, &[("ada", "admin", "pw-longer-than-8")]);
    let mut session = Session::default();
    let cancel = CancellationToken::new();

    // Handshake traffic is allowed pre-auth.
    assert!(processor
        .handle(doc! {"hello": 1, "$db": "admin"}, &mut session, &cancel)
        .await
        .is_ok());
    assert!(processor
        .handle(doc! {"ping": 1, "$db": "admin"}, &mut session, &cancel)
        .await
        .is_ok());

    // Data commands are not.
    let err = processor
        .handle(
            doc! {"find": "users", "$db": "app"},
            &mut session,
            &cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 13);

    authenticate(&processor, &mut session, "ada", "pw-longer-than-8")
        .await
        .unwrap();
    assert!(processor
        .handle(doc! {"find": "users", "$db": "app"}, &mut session, &cancel)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_logout_clears_authentication() {
    let processor = processor(true, &[("ada", "admin", "correct horse")]);
    let mut session = Session::default();
    let cancel = CancellationToken::new();

    authenticate(&processor, &mut session, "ada", "correct horse")
        .await
        .unwrap();
    processor
        .handle(doc! {"logout": 1, "$db": "admin"}, &mut session, &cancel)
        .await
        .unwrap();
    assert!(session.authenticated.is_none());

    let err = processor
        .handle(doc! {"find": "users", "$db": "app"}, &mut session, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 13);
}

#[tokio::test]
async fn test_auth_disabled_allows_everything() {
    let processor = processor(false, &[]);
    let mut session = Session::default();
    let cancel = CancellationToken::new();
    assert!(processor
        .handle(doc! {"find": "users", "$db": "app"}, &mut session, &cancel)
        .await
        .is_ok());
}
