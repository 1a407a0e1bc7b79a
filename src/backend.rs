/*!
 * @file backend.rs
 * @brief Storage backend trait consumed by the query core
 */

use crate::cursor::Cursor;
use crate::error::Result;
use crate::router::BackendKind;
use async_trait::async_trait;
use bson::{Array, Bson, Document};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Query options for a find operation.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filter: Option<Document>,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub batch_size: Option<i64>,
    pub backend_hint: Option<BackendKind>,
}

/// First batch plus the handle for the rest. `cursor_id` of 0 means the
/// result was fully returned.
#[derive(Debug, Clone)]
pub struct FindResult {
    pub documents: Vec<Document>,
    pub cursor_id: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSummary {
    pub matched: u64,
    pub modified: u64,
}

/// Batch dispensed by `advance_cursor`.
#[derive(Debug, Clone)]
pub struct CursorBatch {
    pub documents: Vec<Document>,
    pub exhausted: bool,
}

/// The storage engine surface the core executes against. One
/// implementation per configured backend (OLTP always, OLAP optionally).
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    // Databases
    async fn list_databases(&self) -> Result<Vec<String>>;
    async fn create_database(&self, name: &str) -> Result<()>;
    async fn drop_database(&self, name: &str) -> Result<bool>;
    async fn database_exists(&self, name: &str) -> Result<bool>;

    // Collections
    async fn list_collections(&self, db: &str) -> Result<Vec<String>>;
    async fn create_collection(&self, db: &str, coll: &str, options: Document) -> Result<()>;
    async fn drop_collection(&self, db: &str, coll: &str) -> Result<bool>;
    async fn collection_exists(&self, db: &str, coll: &str) -> Result<bool>;
    async fn coll_stats(&self, db: &str, coll: &str) -> Result<Document>;
    async fn db_stats(&self, db: &str) -> Result<Document>;

    // Reads
    async fn find(
        &self,
        db: &str,
        coll: &str,
        query: FindQuery,
        cancel: &CancellationToken,
    ) -> Result<FindResult>;
    async fn count(&self, db: &str, coll: &str, filter: Option<&Document>) -> Result<u64>;
    async fn distinct(
        &self,
        db: &str,
        coll: &str,
        key: &str,
        filter: Option<&Document>,
    ) -> Result<Vec<Bson>>;
    async fn aggregate(
        &self,
        db: &str,
        coll: &str,
        pipeline: &Array,
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>>;

    // Writes
    async fn insert_one(&self, db: &str, coll: &str, doc: Document) -> Result<Bson>;
    async fn insert_many(&self, db: &str, coll: &str, docs: Vec<Document>) -> Result<Vec<Bson>>;
    async fn update_one(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateSummary>;
    async fn update_many(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateSummary>;
    async fn delete_one(&self, db: &str, coll: &str, filter: &Document) -> Result<u64>;
    async fn delete_many(&self, db: &str, coll: &str, filter: &Document) -> Result<u64>;

    // Indexes
    async fn list_indexes(&self, db: &str, coll: &str) -> Result<Vec<Document>>;
    async fn create_indexes(
        &self,
        db: &str,
        coll: &str,
        indexes: Vec<Document>,
    ) -> Result<Vec<String>>;
    async fn drop_index(&self, db: &str, coll: &str, name: &str) -> Result<bool>;
    async fn drop_indexes(&self, db: &str, coll: &str) -> Result<u64>;

    // Cursor lifecycle
    async fn create_cursor(
        &self,
        db: &str,
        coll: &str,
        documents: Vec<Document>,
        batch_size: Option<i64>,
    ) -> Result<i64>;
    async fn get_cursor(&self, id: i64) -> Result<Option<Arc<Mutex<Cursor>>>>;
    async fn advance_cursor(&self, id: i64, batch_size: usize) -> Result<CursorBatch>;
    async fn close_cursor(&self, id: i64) -> Result<bool>;
    async fn cleanup_expired_cursors(&self) -> Result<usize>;
}
