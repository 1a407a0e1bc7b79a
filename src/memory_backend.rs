/*!
 * In-memory row-oriented OLTP backend for MirageDB
 * Reference storage engine behind the DocumentBackend trait
 */

use crate::aggregation::{AggregationPipeline, CollectionProvider, PipelineContext, VectorSearch};
use crate::backend::{CursorBatch, DocumentBackend, FindQuery, FindResult, UpdateSummary};
use crate::change_stream::{ChangeEvent, ChangeStreamBroker, OperationType, UpdateDescription};
use crate::cursor::{apply_projection, sort_documents, Cursor, CursorRegistry, Namespace, DEFAULT_BATCH_SIZE};
use crate::error::{MirageError, Result};
use crate::matcher;
use crate::router::BackendKind;
use crate::update;
use crate::value::deep_equal;
use async_trait::async_trait;
use bson::{Array, Bson, Document};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<Document>,
    options: Document,
}

impl CollectionState {
    fn new(options: Document) -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![default_id_index()],
            options,
        }
    }
}

fn default_id_index() -> Document {
    bson::doc! {"v": 2, "key": {"_id": 1}, "name": "_id_"}
}

#[derive(Default)]
struct DatabaseState {
    collections: HashMap<String, CollectionState>,
}

type Databases = Arc<RwLock<HashMap<String, DatabaseState>>>;

/// Row-oriented in-process storage engine. Every operation takes the
/// store lock briefly and never holds it across an await point.
pub struct MemoryBackend {
    databases: Databases,
    registry: Arc<CursorRegistry>,
    changes: Arc<ChangeStreamBroker>,
    vector: Option<Arc<dyn VectorSearch>>,
}

impl MemoryBackend {
    pub fn new(registry: Arc<CursorRegistry>, changes: Arc<ChangeStreamBroker>) -> Self {
        Self {
            databases: Arc::new(RwLock::new(HashMap::new())),
            registry,
            changes,
            vector: None,
        }
    }

    pub fn with_vector_search(mut self, vector: Arc<dyn VectorSearch>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn registry(&self) -> &Arc<CursorRegistry> {
        &self.registry
    }

    pub fn change_broker(&self) -> &Arc<ChangeStreamBroker> {
        &self.changes
    }

    fn collection_docs(&self, db: &str, coll: &str) -> Vec<Document> {
        self.databases
            .read()
            .get(db)
            .and_then(|d| d.collections.get(coll))
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    fn with_collection_mut<T>(
        &self,
        db: &str,
        coll: &str,
        f: impl FnOnce(&mut CollectionState) -> Result<T>,
    ) -> Result<T> {
        let mut databases = self.databases.write();
        let database = databases.entry(db.to_string()).or_default();
        let collection = database
            .collections
            .entry(coll.to_string())
            .or_insert_with(|| CollectionState::new(Document::new()));
        f(collection)
    }

    fn insert_document(state: &mut CollectionState, mut doc: Document) -> Result<(Bson, Document)> {
        let id = match doc.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(bson::oid::ObjectId::new());
                // _id leads the emitted document.
                let mut with_id = Document::new();
                with_id.insert("_id", id.clone());
                for (key, value) in &doc {
                    with_id.insert(key.clone(), value.clone());
                }
                doc = with_id;
                id
            }
        };
        if state
            .documents
            .iter()
            .any(|existing| matches!(existing.get("_id"), Some(e) if deep_equal(e, &id)))
        {
            return Err(MirageError::DuplicateKey(format!(
                "E11000 duplicate key error: _id: {}",
                id
            )));
        }
        state.documents.push(doc.clone());
        Ok((id, doc))
    }

    fn emit_insert(&self, db: &str, coll: &str, id: Bson, doc: Document) {
        self.changes.publish(
            ChangeEvent::new(OperationType::Insert, db, coll)
                .with_document_key(id)
                .with_full_document(doc),
        );
    }

    fn emit_update(&self, db: &str, coll: &str, before: &Document, after: &Document) {
        let mut updated = Document::new();
        let mut removed = Vec::new();
        for (key, value) in after {
            match before.get(key) {
                Some(previous) if deep_equal(previous, value) => {}
                _ => {
                    updated.insert(key.clone(), value.clone());
                }
            }
        }
        for key in before.keys() {
            if !after.contains_key(key) {
                removed.push(key.clone());
            }
        }
        let id = after.get("_id").cloned().unwrap_or(Bson::Null);
        self.changes.publish(
            ChangeEvent::new(OperationType::Update, db, coll)
                .with_document_key(id)
                .with_full_document(after.clone())
                .with_update_description(UpdateDescription {
                    updated_fields: updated,
                    removed_fields: removed,
                    truncated_arrays: Vec::new(),
                }),
        );
    }

    fn apply_updates(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update_doc: &Document,
        multi: bool,
    ) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary::default();
        let mut events: Vec<(Document, Document)> = Vec::new();

        self.with_collection_mut(db, coll, |state| {
            for slot in state.documents.iter_mut() {
                if !matcher::matches(filter, slot) {
                    continue;
                }
                summary.matched += 1;
                let (updated, modified) = update::apply(update_doc, slot)?;
                if modified {
                    summary.modified += 1;
                    events.push((slot.clone(), updated.clone()));
                    *slot = updated;
                }
                if !multi {
                    break;
                }
            }
            Ok(())
        })?;

        for (before, after) in events {
            self.emit_update(db, coll, &before, &after);
        }
        Ok(summary)
    }

    fn delete_matching(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        multi: bool,
    ) -> Result<u64> {
        let mut removed_docs = Vec::new();
        self.with_collection_mut(db, coll, |state| {
            let mut kept = Vec::with_capacity(state.documents.len());
            let mut removed = 0u64;
            for doc in state.documents.drain(..) {
                let hit = matcher::matches(filter, &doc) && (multi || removed == 0);
                if hit {
                    removed += 1;
                    removed_docs.push(doc);
                } else {
                    kept.push(doc);
                }
            }
            state.documents = kept;
            Ok(removed)
        })
        .map(|removed| {
            for doc in &removed_docs {
                let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
                self.changes.publish(
                    ChangeEvent::new(OperationType::Delete, db, coll).with_document_key(id),
                );
            }
            removed
        })
    }

    fn approximate_size(docs: &[Document]) -> u64 {
        docs.iter()
            .map(|d| bson::to_vec(d).map(|v| v.len() as u64).unwrap_or(0))
            .sum()
    }
}

struct MemoryCollections {
    databases: Databases,
}

#[async_trait]
impl CollectionProvider for MemoryCollections {
    async fn fetch_collection(&self, db: &str, coll: &str) -> Result<Vec<Document>> {
        Ok(self
            .databases
            .read()
            .get(db)
            .and_then(|d| d.collections.get(coll))
            .map(|c| c.documents.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Oltp
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.databases
            .write()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<bool> {
        let existed = self.databases.write().remove(name).is_some();
        if existed {
            self.changes
                .publish(ChangeEvent::new(OperationType::DropDatabase, name, ""));
        }
        Ok(existed)
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        Ok(self.databases.read().contains_key(name))
    }

    async fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .databases
            .read()
            .get(db)
            .map(|d| d.collections.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, db: &str, coll: &str, options: Document) -> Result<()> {
        let mut databases = self.databases.write();
        let database = databases.entry(db.to_string()).or_default();
        if database.collections.contains_key(coll) {
            return Err(MirageError::InvalidOperation(format!(
                "collection {}.{} already exists",
                db, coll
            )));
        }
        database
            .collections
            .insert(coll.to_string(), CollectionState::new(options));
        Ok(())
    }

    async fn drop_collection(&self, db: &str, coll: &str) -> Result<bool> {
        let existed = {
            let mut databases = self.databases.write();
            databases
                .get_mut(db)
                .map(|d| d.collections.remove(coll).is_some())
                .unwrap_or(false)
        };
        if existed {
            self.changes
                .publish(ChangeEvent::new(OperationType::Drop, db, coll));
        }
        Ok(existed)
    }

    async fn collection_exists(&self, db: &str, coll: &str) -> Result<bool> {
        Ok(self
            .databases
            .read()
            .get(db)
            .map(|d| d.collections.contains_key(coll))
            .unwrap_or(false))
    }

    async fn coll_stats(&self, db: &str, coll: &str) -> Result<Document> {
        let databases = self.databases.read();
        let state = databases
            .get(db)
            .and_then(|d| d.collections.get(coll))
            .ok_or_else(|| {
                MirageError::InvalidArgument(format!("no such collection: {}.{}", db, coll))
            })?;
        let count = state.documents.len() as i64;
        let size = Self::approximate_size(&state.documents) as i64;
        Ok(bson::doc! {
            "ns": format!("{}.{}", db, coll),
            "count": count,
            "size": size,
            "avgObjSize": if count > 0 { size / count } else { 0 },
            "storageSize": size,
            "nindexes": state.indexes.len() as i32,
            "ok": 1.0,
        })
    }

    async fn db_stats(&self, db: &str) -> Result<Document> {
        let databases = self.databases.read();
        let state = databases
            .get(db)
            .ok_or_else(|| MirageError::InvalidArgument(format!("no such database: {}", db)))?;
        let collections = state.collections.len() as i64;
        let objects: i64 = state
            .collections
            .values()
            .map(|c| c.documents.len() as i64)
            .sum();
        let data_size: u64 = state
            .collections
            .values()
            .map(|c| Self::approximate_size(&c.documents))
            .sum();
        Ok(bson::doc! {
            "db": db,
            "collections": collections,
            "objects": objects,
            "dataSize": data_size as i64,
            "storageSize": data_size as i64,
            "indexes": state.collections.values().map(|c| c.indexes.len() as i64).sum::<i64>(),
            "ok": 1.0,
        })
    }

    async fn find(
        &self,
        db: &str,
        coll: &str,
        query: FindQuery,
        cancel: &CancellationToken,
    ) -> Result<FindResult> {
        if cancel.is_cancelled() {
            return Err(MirageError::Aborted("find cancelled".to_string()));
        }
        let mut docs = self.collection_docs(db, coll);
        if let Some(filter) = &query.filter {
            docs.retain(|d| matcher::matches(filter, d));
        }
        if let Some(sort) = &query.sort {
            sort_documents(&mut docs, sort);
        }
        if let Some(skip) = query.skip {
            let skip = skip.max(0) as usize;
            docs = if skip < docs.len() {
                docs.split_off(skip)
            } else {
                Vec::new()
            };
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit.max(0) as usize);
        }
        if let Some(projection) = &query.projection {
            docs = docs.iter().map(|d| apply_projection(d, projection)).collect();
        }

        let batch_size = query
            .batch_size
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if docs.len() <= batch_size {
            return Ok(FindResult {
                documents: docs,
                cursor_id: 0,
                has_more: false,
            });
        }

        let rest = docs.split_off(batch_size);
        let cursor_id = self
            .create_cursor(db, coll, rest, query.batch_size.filter(|n| *n >= 1))
            .await?;
        Ok(FindResult {
            documents: docs,
            cursor_id,
            has_more: true,
        })
    }

    async fn count(&self, db: &str, coll: &str, filter: Option<&Document>) -> Result<u64> {
        let docs = self.collection_docs(db, coll);
        Ok(match filter {
            Some(filter) if !filter.is_empty() => docs
                .iter()
                .filter(|d| matcher::matches(filter, d))
                .count() as u64,
            _ => docs.len() as u64,
        })
    }

    async fn distinct(
        &self,
        db: &str,
        coll: &str,
        key: &str,
        filter: Option<&Document>,
    ) -> Result<Vec<Bson>> {
        let docs = self.collection_docs(db, coll);
        let mut values: Vec<Bson> = Vec::new();
        for doc in docs.iter() {
            if let Some(filter) = filter {
                if !matcher::matches(filter, doc) {
                    continue;
                }
            }
            let value = match crate::value::get_path(doc, key) {
                Some(v) => v,
                None => continue,
            };
            // Sequence fields contribute their elements, as distinct does.
            let candidates: Vec<&Bson> = match value {
                Bson::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            for candidate in candidates {
                if !values.iter().any(|v| deep_equal(v, candidate)) {
                    values.push(candidate.clone());
                }
            }
        }
        Ok(values)
    }

    async fn aggregate(
        &self,
        db: &str,
        coll: &str,
        pipeline: &Array,
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>> {
        if cancel.is_cancelled() {
            return Err(MirageError::Aborted("aggregate cancelled".to_string()));
        }
        let parsed = AggregationPipeline::from_bson_array(pipeline)?;
        let input = self.collection_docs(db, coll);
        let mut ctx = PipelineContext::new(db).with_collections(Arc::new(MemoryCollections {
            databases: self.databases.clone(),
        }));
        if let Some(vector) = &self.vector {
            ctx = ctx.with_vector(vector.clone());
        }
        parsed.execute(input, ctx).await
    }

    async fn insert_one(&self, db: &str, coll: &str, doc: Document) -> Result<Bson> {
        let (id, stored) =
            self.with_collection_mut(db, coll, |state| Self::insert_document(state, doc))?;
        self.emit_insert(db, coll, id.clone(), stored);
        Ok(id)
    }

    async fn insert_many(&self, db: &str, coll: &str, docs: Vec<Document>) -> Result<Vec<Bson>> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            // Ordered semantics: stop at the first failure, earlier
            // inserts stay applied.
            ids.push(self.insert_one(db, coll, doc).await?);
        }
        Ok(ids)
    }

    async fn update_one(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateSummary> {
        self.apply_updates(db, coll, filter, update, false)
    }

    async fn update_many(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateSummary> {
        self.apply_updates(db, coll, filter, update, true)
    }

    async fn delete_one(&self, db: &str, coll: &str, filter: &Document) -> Result<u64> {
        self.delete_matching(db, coll, filter, false)
    }

    async fn delete_many(&self, db: &str, coll: &str, filter: &Document) -> Result<u64> {
        self.delete_matching(db, coll, filter, true)
    }

    async fn list_indexes(&self, db: &str, coll: &str) -> Result<Vec<Document>> {
        Ok(self
            .databases
            .read()
            .get(db)
            .and_then(|d| d.collections.get(coll))
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn create_indexes(
        &self,
        db: &str,
        coll: &str,
        indexes: Vec<Document>,
    ) -> Result<Vec<String>> {
        self.with_collection_mut(db, coll, |state| {
            let mut created = Vec::new();
            for spec in indexes {
                let key = spec.get_document("key").cloned().map_err(|_| {
                    MirageError::InvalidArgument("index spec requires a key document".to_string())
                })?;
                let name = match spec.get_str("name") {
                    Ok(name) => name.to_string(),
                    Err(_) => derive_index_name(&key),
                };
                if state.indexes.iter().any(|i| i.get_str("name") == Ok(&name)) {
                    continue;
                }
                let mut index = bson::doc! {"v": 2, "key": key, "name": name.clone()};
                if spec.get_bool("unique").unwrap_or(false) {
                    index.insert("unique", true);
                }
                state.indexes.push(index);
                created.push(name);
            }
            Ok(created)
        })
    }

    async fn drop_index(&self, db: &str, coll: &str, name: &str) -> Result<bool> {
        if name == "_id_" {
            return Err(MirageError::InvalidOperation(
                "cannot drop the _id index".to_string(),
            ));
        }
        self.with_collection_mut(db, coll, |state| {
            let before = state.indexes.len();
            state.indexes.retain(|i| i.get_str("name") != Ok(name));
            Ok(state.indexes.len() < before)
        })
    }

    async fn drop_indexes(&self, db: &str, coll: &str) -> Result<u64> {
        self.with_collection_mut(db, coll, |state| {
            let before = state.indexes.len();
            state.indexes.retain(|i| i.get_str("name") == Ok("_id_"));
            Ok((before - state.indexes.len()) as u64)
        })
    }

    async fn create_cursor(
        &self,
        db: &str,
        coll: &str,
        documents: Vec<Document>,
        batch_size: Option<i64>,
    ) -> Result<i64> {
        let id = self.registry.allocate_id();
        let mut cursor = Cursor::from_documents(id, Namespace::new(db, coll), documents);
        if let Some(n) = batch_size {
            cursor.batch_size(n)?;
        }
        Ok(self.registry.register(cursor))
    }

    async fn get_cursor(&self, id: i64) -> Result<Option<Arc<Mutex<Cursor>>>> {
        Ok(self.registry.get(id))
    }

    async fn advance_cursor(&self, id: i64, batch_size: usize) -> Result<CursorBatch> {
        let cursor = self
            .registry
            .get(id)
            .ok_or(MirageError::CursorNotFound(id))?;
        let mut cursor = cursor.lock().await;
        let documents = cursor.next_batch(batch_size).await?;
        let exhausted = cursor.exhausted();
        drop(cursor);
        if exhausted {
            self.registry.close(id);
        }
        Ok(CursorBatch {
            documents,
            exhausted,
        })
    }

    async fn close_cursor(&self, id: i64) -> Result<bool> {
        Ok(self.registry.close(id))
    }

    async fn cleanup_expired_cursors(&self) -> Result<usize> {
        Ok(self.registry.cleanup_expired())
    }
}

fn derive_index_name(key: &Document) -> String {
    key.iter()
        .map(|(field, dir)| {
            let dir = match dir {
                Bson::Int32(n) => *n as i64,
                Bson::Int64(n) => *n,
                Bson::Double(d) => *d as i64,
                _ => 1,
            };
            format!("{}_{}", field, dir)
        })
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::time::Duration;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(
            Arc::new(CursorRegistry::new(Duration::from_secs(600))),
            Arc::new(ChangeStreamBroker::default()),
        )
    }

    #[tokio::test]
    async fn test_insert_assigns_object_id() {
        let b = backend();
        let id = b.insert_one("app", "users", doc! {"name": "ada"}).await.unwrap();
        assert!(matches!(id, Bson::ObjectId(_)));
        assert_eq!(b.count("app", "users", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let b = backend();
        b.insert_one("app", "users", doc! {"_id": 1}).await.unwrap();
        let err = b.insert_one("app", "users", doc! {"_id": 1}).await.unwrap_err();
        assert_eq!(err.code(), 11000);
    }

    #[tokio::test]
    async fn test_update_one_only_touches_first_match() {
        let b = backend();
        for i in 1..=3 {
            b.insert_one("app", "t", doc! {"_id": i, "group": "x", "n": 0})
                .await
                .unwrap();
        }
        let summary = b
            .update_one("app", "t", &doc! {"group": "x"}, &doc! {"$inc": {"n": 1}})
            .await
            .unwrap();
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.modified, 1);
        let total: i64 = b
            .collection_docs("app", "t")
            .iter()
            .map(|d| d.get_i64("n").unwrap_or(0))
            .sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_find_batches_and_registers_cursor() {
        let b = backend();
        for i in 0..10 {
            b.insert_one("app", "t", doc! {"_id": i}).await.unwrap();
        }
        let result = b
            .find(
                "app",
                "t",
                FindQuery {
                    batch_size: Some(4),
                    sort: Some(doc! {"_id": 1}),
                    ..FindQuery::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.documents.len(), 4);
        assert!(result.has_more);
        assert!(result.cursor_id != 0);

        let batch = b.advance_cursor(result.cursor_id, 100).await.unwrap();
        assert_eq!(batch.documents.len(), 6);
        assert!(batch.exhausted);
    }

    #[tokio::test]
    async fn test_distinct_flattens_arrays() {
        let b = backend();
        b.insert_one("app", "t", doc! {"_id": 1, "tags": ["a", "b"]}).await.unwrap();
        b.insert_one("app", "t", doc! {"_id": 2, "tags": "b"}).await.unwrap();
        let values = b.distinct("app", "t", "tags", None).await.unwrap();
        assert_eq!(values.len(), 2);
    }
}
