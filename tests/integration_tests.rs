/*!
 * Integration tests for MirageDB
 * End-to-end command dispatch over the in-memory backend
 */

use bson::{doc, Bson, Document};
use miragedb::auth::{CredentialStore, ScramServer};
use miragedb::change_stream::ChangeStreamBroker;
use miragedb::commands::{CommandProcessor, Session};
use miragedb::cursor::CursorRegistry;
use miragedb::memory_backend::MemoryBackend;
use miragedb::router::{QueryRouter, RouterConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    processor: CommandProcessor,
    backend: Arc<MemoryBackend>,
    session: Session,
    cancel: CancellationToken,
}

fn harness() -> Harness {
    let registry = Arc::new(CursorRegistry::new(Duration::from_secs(600)));
    let backend = Arc::new(MemoryBackend::new(
        registry,
        Arc::new(ChangeStreamBroker::default()),
    ));
    let processor = CommandProcessor::new(
        backend.clone(),
        None,
        QueryRouter::new(RouterConfig::default()),
        Arc::new(ScramServer::new(Arc::new(CredentialStore::new()))),
        false,
    );
    Harness {
        processor,
        backend,
        session: Session::default(),
        cancel: CancellationToken::new(),
    }
}

impl Harness {
    async fn run(&mut self, command: Document) -> Document {
        self.processor
            .handle(command, &mut self.session, &self.cancel)
            .await
            .unwrap_or_else(|e| panic!("command failed: {}", e))
    }

    async fn run_err(&mut self, command: Document) -> miragedb::MirageError {
        self.processor
            .handle(command, &mut self.session, &self.cancel)
            .await
            .expect_err("command should fail")
    }

    async fn seed_ages(&mut self) {
        let docs: Vec<Bson> = [25, 30, 35, 40, 28]
            .iter()
            .enumerate()
            .map(|(i, age)| Bson::Document(doc! {"_id": i as i32 + 1, "age": *age}))
            .collect();
        let response = self
            .run(doc! {"insert": "people", "documents": docs, "$db": "app"})
            .await;
        assert_eq!(response.get_i32("n").unwrap(), 5);
    }
}

fn first_batch(response: &Document) -> Vec<Document> {
    response
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|v| v.as_document().unwrap().clone())
        .collect()
}

#[tokio::test]
async fn test_insert_find_roundtrip() {
    let mut h = harness();
    h.seed_ages().await;

    let response = h
        .run(doc! {
            "find": "people",
            "filter": {"age": {"$gt": 30}},
            "sort": {"age": 1},
            "$db": "app",
        })
        .await;
    let docs = first_batch(&response);
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].get_i32("age").unwrap(), 35);
    assert_eq!(docs[1].get_i32("age").unwrap(), 40);
}

#[tokio::test]
async fn test_find_with_get_more_and_kill_cursors() {
    let mut h = harness();
    let docs: Vec<Bson> = (0..10)
        .map(|i| Bson::Document(doc! {"_id": i, "n": i}))
        .collect();
    h.run(doc! {"insert": "big", "documents": docs, "$db": "app"})
        .await;

    let response = h
        .run(doc! {
            "find": "big",
            "sort": {"n": 1},
            "batchSize": 4,
            "$db": "app",
        })
        .await;
    let cursor = response.get_document("cursor").unwrap();
    let cursor_id = cursor.get_i64("id").unwrap();
    assert_ne!(cursor_id, 0);
    assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 4);

    let more = h
        .run(doc! {"getMore": cursor_id, "collection": "big", "batchSize": 4, "$db": "app"})
        .await;
    let next = more.get_document("cursor").unwrap();
    assert_eq!(next.get_array("nextBatch").unwrap().len(), 4);
    assert_eq!(next.get_i64("id").unwrap(), cursor_id);

    let killed = h
        .run(doc! {"killCursors": "big", "cursors": [cursor_id], "$db": "app"})
        .await;
    assert_eq!(killed.get_array("cursorsKilled").unwrap().len(), 1);

    let err = h
        .run_err(doc! {"getMore": cursor_id, "collection": "big", "$db": "app"})
        .await;
    assert_eq!(err.code(), 43);
}

#[tokio::test]
async fn test_duplicate_insert_reports_write_error() {
    let mut h = harness();
    let response = h
        .run(doc! {
            "insert": "u",
            "documents": [{"_id": 1}, {"_id": 1}, {"_id": 2}],
            "$db": "app",
        })
        .await;
    // Ordered insert: the first document lands, the duplicate stops the
    // batch before _id 2.
    assert_eq!(response.get_i32("n").unwrap(), 1);
    let errors = response.get_array("writeErrors").unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].as_document().unwrap().get_i32("code").unwrap(),
        11000
    );
}

#[tokio::test]
async fn test_update_with_operators_and_upsert() {
    let mut h = harness();
    h.seed_ages().await;

    let response = h
        .run(doc! {
            "update": "people",
            "updates": [
                {"q": {"age": {"$gte": 30}}, "u": {"$inc": {"age": 1}}, "multi": true},
                {"q": {"_id": 99}, "u": {"$set": {"age": 1}}, "upsert": true},
            ],
            "$db": "app",
        })
        .await;
    assert_eq!(response.get_i64("n").unwrap(), 4);
    assert_eq!(response.get_i64("nModified").unwrap(), 3);
    assert_eq!(response.get_array("upserted").unwrap().len(), 1);

    let count = h
        .run(doc! {"count": "people", "query": {"_id": 99}, "$db": "app"})
        .await;
    assert_eq!(count.get_i64("n").unwrap(), 1);
}

#[tokio::test]
async fn test_delete_with_limit() {
    let mut h = harness();
    h.seed_ages().await;

    let response = h
        .run(doc! {
            "delete": "people",
            "deletes": [{"q": {"age": {"$lt": 30}}, "limit": 1}],
            "$db": "app",
        })
        .await;
    assert_eq!(response.get_i64("n").unwrap(), 1);

    let response = h
        .run(doc! {
            "delete": "people",
            "deletes": [{"q": {}, "limit": 0}],
            "$db": "app",
        })
        .await;
    assert_eq!(response.get_i64("n").unwrap(), 4);
}

#[tokio::test]
async fn test_aggregate_group_scenario() {
    let mut h = harness();
    let sales: Vec<Bson> = vec![
        Bson::Document(doc! {"_id": 1, "category": "widgets", "quantity": 10, "price": 100}),
        Bson::Document(doc! {"_id": 2, "category": "widgets", "quantity": 20, "price": 150}),
        Bson::Document(doc! {"_id": 3, "category": "widgets", "quantity": 8, "price": 120}),
        Bson::Document(doc! {"_id": 4, "category": "gadgets", "quantity": 5, "price": 200}),
        Bson::Document(doc! {"_id": 5, "category": "gadgets", "quantity": 15, "price": 250}),
    ];
    h.run(doc! {"insert": "sales", "documents": sales, "$db": "app"})
        .await;

    let response = h
        .run(doc! {
            "aggregate": "sales",
            "pipeline": [
                {"$group": {"_id": "$category", "total": {"$sum": "$quantity"}, "avg": {"$avg": "$price"}}},
                {"$sort": {"_id": -1}},
            ],
            "cursor": {},
            "$db": "app",
        })
        .await;
    let docs = first_batch(&response);
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].get_str("_id").unwrap(), "widgets");
    assert_eq!(docs[0].get_i64("total").unwrap(), 38);
    assert_eq!(docs[1].get_str("_id").unwrap(), "gadgets");
    assert_eq!(docs[1].get_f64("avg").unwrap(), 225.0);
}

#[tokio::test]
async fn test_distinct_command() {
    let mut h = harness();
    h.run(doc! {
        "insert": "t",
        "documents": [
            {"_id": 1, "tags": ["a", "b"]},
            {"_id": 2, "tags": "b"},
            {"_id": 3, "tags": ["c"]},
        ],
        "$db": "app",
    })
    .await;

    let response = h.run(doc! {"distinct": "t", "key": "tags", "$db": "app"}).await;
    assert_eq!(response.get_array("values").unwrap().len(), 3);
}

#[tokio::test]
async fn test_find_and_modify_returns_pre_or_post_image() {
    let mut h = harness();
    h.seed_ages().await;

    let pre = h
        .run(doc! {
            "findAndModify": "people",
            "query": {"_id": 1},
            "update": {"$inc": {"age": 10}},
            "$db": "app",
        })
        .await;
    assert_eq!(
        pre.get_document("value").unwrap().get_i32("age").unwrap(),
        25
    );

    let post = h
        .run(doc! {
            "findAndModify": "people",
            "query": {"_id": 1},
            "update": {"$inc": {"age": 10}},
            "new": true,
            "$db": "app",
        })
        .await;
    assert_eq!(
        post.get_document("value").unwrap().get_i64("age").unwrap(),
        45
    );

    let removed = h
        .run(doc! {
            "findAndModify": "people",
            "query": {"_id": 1},
            "remove": true,
            "$db": "app",
        })
        .await;
    assert!(removed.get_document("value").unwrap().get("_id").is_some());
    let count = h.run(doc! {"count": "people", "$db": "app"}).await;
    assert_eq!(count.get_i64("n").unwrap(), 4);
}

#[tokio::test]
async fn test_collection_and_database_admin_commands() {
    let mut h = harness();
    h.run(doc! {"create": "empty", "$db": "app"}).await;
    let listed = h.run(doc! {"listCollections": 1, "$db": "app"}).await;
    assert_eq!(first_batch(&listed).len(), 1);

    h.seed_ages().await;
    let stats = h.run(doc! {"collStats": "people", "$db": "app"}).await;
    assert_eq!(stats.get_i64("count").unwrap(), 5);

    let dbs = h.run(doc! {"listDatabases": 1, "$db": "admin"}).await;
    assert!(!dbs.get_array("databases").unwrap().is_empty());

    h.run(doc! {"drop": "empty", "$db": "app"}).await;
    let err = h.run_err(doc! {"drop": "empty", "$db": "app"}).await;
    assert!(err.to_string().contains("ns not found"));

    h.run(doc! {"dropDatabase": 1, "$db": "app"}).await;
    let listed = h.run(doc! {"listCollections": 1, "$db": "app"}).await;
    assert!(first_batch(&listed).is_empty());
}

#[tokio::test]
async fn test_index_commands() {
    let mut h = harness();
    h.seed_ages().await;

    let created = h
        .run(doc! {
            "createIndexes": "people",
            "indexes": [{"key": {"age": 1}, "name": "age_1"}],
            "$db": "app",
        })
        .await;
    assert_eq!(created.get_i32("numIndexesBefore").unwrap(), 1);
    assert_eq!(created.get_i32("numIndexesAfter").unwrap(), 2);

    let listed = h.run(doc! {"listIndexes": "people", "$db": "app"}).await;
    assert_eq!(first_batch(&listed).len(), 2);

    h.run(doc! {"dropIndexes": "people", "index": "age_1", "$db": "app"})
        .await;
    let listed = h.run(doc! {"listIndexes": "people", "$db": "app"}).await;
    assert_eq!(first_batch(&listed).len(), 1);
}

#[tokio::test]
async fn test_change_events_emitted_on_writes() {
    let mut h = harness();
    let mut events = h.backend.change_broker().subscribe();

    h.run(doc! {"insert": "t", "documents": [{"_id": 1, "v": 1}], "$db": "app"})
        .await;
    h.run(doc! {
        "update": "t",
        "updates": [{"q": {"_id": 1}, "u": {"$set": {"v": 2}}}],
        "$db": "app",
    })
    .await;
    h.run(doc! {"delete": "t", "deletes": [{"q": {"_id": 1}, "limit": 1}], "$db": "app"})
        .await;

    let insert = events.recv().await.unwrap();
    assert_eq!(insert.operation_type.as_str(), "insert");
    assert_eq!(insert.ns, ("app".to_string(), "t".to_string()));
    assert!(insert.full_document.is_some());

    let update = events.recv().await.unwrap();
    assert_eq!(update.operation_type.as_str(), "update");
    let description = update.update_description.unwrap();
    assert_eq!(description.updated_fields.get_i32("v").unwrap(), 2);

    let delete = events.recv().await.unwrap();
    assert_eq!(delete.operation_type.as_str(), "delete");
    assert_eq!(
        delete.document_key.unwrap().get_i32("_id").unwrap(),
        1
    );
}

#[tokio::test]
async fn test_find_limit_zero_is_unbounded() {
    let mut h = harness();
    h.seed_ages().await;

    let response = h
        .run(doc! {"find": "people", "limit": 0, "$db": "app"})
        .await;
    assert_eq!(first_batch(&response).len(), 5);

    let err = h
        .run_err(doc! {"find": "people", "skip": -1, "$db": "app"})
        .await;
    assert!(err.to_string().contains("must be non-negative"));
}

#[tokio::test]
async fn test_unknown_command_maps_to_command_not_found() {
    let mut h = harness();
    let err = h.run_err(doc! {"fizzbuzz": 1, "$db": "app"}).await;
    assert_eq!(err.code(), 59);
    assert_eq!(err.code_name(), "CommandNotFound");
    let rendered = CommandProcessor::error_response(&err);
    assert_eq!(rendered.get_f64("ok").unwrap(), 0.0);
    assert_eq!(rendered.get_i32("code").unwrap(), 59);
}

#[tokio::test]
async fn test_handshake_and_ping() {
    let mut h = harness();
    let hello = h.run(doc! {"hello": 1, "$db": "admin"}).await;
    assert!(hello.get_bool("isWritablePrimary").unwrap());
    assert_eq!(hello.get_i32("maxBsonObjectSize").unwrap(), 16_777_216);

    let legacy = h.run(doc! {"isMaster": 1, "$db": "admin"}).await;
    assert!(legacy.get_bool("ismaster").unwrap());

    let pong = h.run(doc! {"ping": 1, "$db": "admin"}).await;
    assert_eq!(pong.get_f64("ok").unwrap(), 1.0);
}
