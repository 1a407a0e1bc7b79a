/*!
 * Cursor subsystem for MirageDB
 * Buffered lazy iteration with modifier chaining, registry and TTL expiry
 */

use crate::error::{MirageError, Result};
use crate::value::{compare_optional, get_path};
use bson::{Bson, Document};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default number of documents pulled per streaming fetch.
pub const DEFAULT_BATCH_SIZE: usize = 101;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }
}

#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub documents: Vec<Document>,
    pub has_more: bool,
}

/// Fetch handle lent to a cursor by the backend. A streaming source tracks
/// its own read offset across `fetch_batch` calls.
#[async_trait]
pub trait FetchSource: Send + Sync {
    async fn fetch_all(&self, cancel: &CancellationToken) -> Result<Vec<Document>>;

    async fn fetch_batch(
        &self,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<FetchBatch>;

    /// Whether the source streams batches with server-side modifiers
    /// already applied.
    fn streaming(&self) -> bool {
        false
    }
}

/// In-memory fetch source over a fixed result set.
pub struct VecSource {
    documents: Vec<Document>,
}

impl VecSource {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl FetchSource for VecSource {
    async fn fetch_all(&self, cancel: &CancellationToken) -> Result<Vec<Document>> {
        if cancel.is_cancelled() {
            return Err(MirageError::Aborted("fetch cancelled".to_string()));
        }
        Ok(self.documents.clone())
    }

    async fn fetch_batch(
        &self,
        _batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<FetchBatch> {
        Ok(FetchBatch {
            documents: self.fetch_all(cancel).await?,
            has_more: false,
        })
    }
}

type MapFn = Arc<dyn Fn(Document, usize) -> Document + Send + Sync>;
type FilterFn = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Modifiers {
    limit: Option<usize>,
    skip: Option<usize>,
    sort: Option<Document>,
    projection: Option<Document>,
    batch_size: Option<usize>,
}

/// A lazy iteration handle over a backend result. No I/O happens before
/// the first consuming call; modifiers set after that point are rejected.
pub struct Cursor {
    id: i64,
    ns: Namespace,
    buffer: Vec<Document>,
    position: usize,
    server_exhausted: bool,
    closed: bool,
    started: bool,
    end_dispensed: bool,
    map_fn: Option<MapFn>,
    filter_fn: Option<FilterFn>,
    modifiers: Modifiers,
    fetch: Option<Arc<dyn FetchSource>>,
    cancel: CancellationToken,
}

impl Cursor {
    pub fn new(id: i64, ns: Namespace, fetch: Arc<dyn FetchSource>) -> Self {
        Self {
            id,
            ns,
            buffer: Vec::new(),
            position: 0,
            server_exhausted: false,
            closed: false,
            started: false,
            end_dispensed: false,
            map_fn: None,
            filter_fn: None,
            modifiers: Modifiers::default(),
            fetch: Some(fetch),
            cancel: CancellationToken::new(),
        }
    }

    /// Pre-materialized cursor (e.g. aggregation output).
    pub fn from_documents(id: i64, ns: Namespace, documents: Vec<Document>) -> Self {
        Self::new(id, ns, Arc::new(VecSource::new(documents)))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn reject_after_start(&self, what: &str) -> Result<()> {
        if self.started {
            return Err(MirageError::InvalidOperation(format!(
                "cannot set {} on a cursor that has already started",
                what
            )));
        }
        Ok(())
    }

    pub fn limit(&mut self, n: i64) -> Result<&mut Self> {
        self.reject_after_start("limit")?;
        if n < 0 {
            return Err(MirageError::InvalidArgument(
                "limit must be non-negative".to_string(),
            ));
        }
        self.modifiers.limit = Some(n as usize);
        Ok(self)
    }

    pub fn skip(&mut self, n: i64) -> Result<&mut Self> {
        self.reject_after_start("skip")?;
        if n < 0 {
            return Err(MirageError::InvalidArgument(
                "skip must be non-negative".to_string(),
            ));
        }
        self.modifiers.skip = Some(n as usize);
        Ok(self)
    }

    pub fn sort(&mut self, spec: Document) -> Result<&mut Self> {
        self.reject_after_start("sort")?;
        self.modifiers.sort = Some(spec);
        Ok(self)
    }

    pub fn project(&mut self, spec: Document) -> Result<&mut Self> {
        self.reject_after_start("projection")?;
        self.modifiers.projection = Some(spec);
        Ok(self)
    }

    pub fn batch_size(&mut self, n: i64) -> Result<&mut Self> {
        self.reject_after_start("batchSize")?;
        if n < 1 {
            return Err(MirageError::InvalidArgument(
                "batchSize must be at least 1".to_string(),
            ));
        }
        self.modifiers.batch_size = Some(n as usize);
        Ok(self)
    }

    /// Derive a cursor that lazily applies `f(doc, index)` to dispensed
    /// documents. Buffer and options carry over.
    pub fn map(&self, id: i64, f: impl Fn(Document, usize) -> Document + Send + Sync + 'static) -> Cursor {
        let wrapped: MapFn = match &self.map_fn {
            Some(inner) => {
                let inner = inner.clone();
                Arc::new(move |doc, index| f(inner(doc, index), index))
            }
            None => Arc::new(f),
        };
        Cursor {
            id,
            ns: self.ns.clone(),
            buffer: self.buffer.clone(),
            position: self.position,
            server_exhausted: self.server_exhausted,
            closed: self.closed,
            started: self.started,
            end_dispensed: false,
            map_fn: Some(wrapped),
            filter_fn: self.filter_fn.clone(),
            modifiers: self.modifiers.clone(),
            fetch: self.fetch.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Compose a predicate into the backing fetch: applied to fetched
    /// batches before the client-side modifiers.
    pub fn filter(&mut self, predicate: impl Fn(&Document) -> bool + Send + Sync + 'static) -> &mut Self {
        let composed: FilterFn = match &self.filter_fn {
            Some(existing) => {
                let existing = existing.clone();
                Arc::new(move |doc| existing(doc) && predicate(doc))
            }
            None => Arc::new(predicate),
        };
        self.filter_fn = Some(composed);
        self
    }

    /// Fresh cursor over the same source with the same options, back in
    /// the created state.
    pub fn clone_cursor(&self, id: i64) -> Cursor {
        Cursor {
            id,
            ns: self.ns.clone(),
            buffer: Vec::new(),
            position: 0,
            server_exhausted: false,
            closed: false,
            started: false,
            end_dispensed: false,
            map_fn: self.map_fn.clone(),
            filter_fn: self.filter_fn.clone(),
            modifiers: self.modifiers.clone(),
            fetch: self.fetch.clone(),
            cancel: CancellationToken::new(),
        }
    }

    fn effective_batch_size(&self) -> usize {
        self.modifiers.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    fn streaming(&self) -> bool {
        self.fetch.as_ref().map(|f| f.streaming()).unwrap_or(false)
    }

    /// First consuming call triggers the fetch. Errors close the cursor
    /// before propagating.
    async fn ensure_started(&mut self) -> Result<()> {
        if self.started || self.closed {
            return Ok(());
        }
        self.started = true;
        let result = self.initial_fetch().await;
        if let Err(err) = result {
            self.close();
            return Err(err);
        }
        Ok(())
    }

    async fn initial_fetch(&mut self) -> Result<()> {
        let source = match &self.fetch {
            Some(source) => source.clone(),
            None => {
                self.server_exhausted = true;
                return Ok(());
            }
        };
        if self.streaming() {
            // Server already applied sort/skip/limit; only projection is
            // evaluated client-side.
            let batch = source
                .fetch_batch(self.effective_batch_size(), &self.cancel)
                .await?;
            self.absorb_batch(batch);
        } else {
            let mut docs = source.fetch_all(&self.cancel).await?;
            if let Some(filter) = &self.filter_fn {
                docs.retain(|d| filter(d));
            }
            if let Some(sort) = &self.modifiers.sort {
                sort_documents(&mut docs, sort);
            }
            if let Some(skip) = self.modifiers.skip {
                docs = if skip < docs.len() {
                    docs.split_off(skip)
                } else {
                    Vec::new()
                };
            }
            if let Some(limit) = self.modifiers.limit {
                docs.truncate(limit);
            }
            if let Some(projection) = &self.modifiers.projection {
                docs = docs
                    .iter()
                    .map(|d| apply_projection(d, projection))
                    .collect();
            }
            self.buffer = docs;
            self.server_exhausted = true;
        }
        Ok(())
    }

    fn absorb_batch(&mut self, batch: FetchBatch) {
        let mut docs = batch.documents;
        if let Some(filter) = &self.filter_fn {
            docs.retain(|d| filter(d));
        }
        if let Some(projection) = &self.modifiers.projection {
            docs = docs
                .iter()
                .map(|d| apply_projection(d, projection))
                .collect();
        }
        self.buffer.extend(docs);
        if !batch.has_more {
            self.server_exhausted = true;
        }
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        while self.position >= self.buffer.len() && !self.server_exhausted {
            let source = match &self.fetch {
                Some(source) => source.clone(),
                None => {
                    self.server_exhausted = true;
                    break;
                }
            };
            let result = source
                .fetch_batch(self.effective_batch_size(), &self.cancel)
                .await;
            match result {
                Ok(batch) => self.absorb_batch(batch),
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Dispense the next document, or `None` at the end. The call after
    /// exhaustion transitions the cursor to closed.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        if self.closed {
            return Ok(None);
        }
        self.ensure_started().await?;
        self.fill_buffer().await?;

        if self.position < self.buffer.len() {
            let index = self.position;
            let doc = self.buffer[index].clone();
            self.position += 1;
            let doc = match &self.map_fn {
                Some(f) => f(doc, index),
                None => doc,
            };
            return Ok(Some(doc));
        }

        if self.end_dispensed {
            self.close();
        } else {
            self.end_dispensed = true;
        }
        Ok(None)
    }

    pub async fn has_next(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        self.ensure_started().await?;
        self.fill_buffer().await?;
        Ok(self.position < self.buffer.len())
    }

    /// Drain the remaining documents.
    pub async fn to_array(&mut self) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    /// Iterate with `(doc, index)`. A callback returning `false` stops
    /// early; the cursor stays open in that case.
    pub async fn for_each<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Document, usize) -> bool,
    {
        let mut index = 0usize;
        while let Some(doc) = self.next().await? {
            if !callback(&doc, index) {
                return Ok(());
            }
            index += 1;
        }
        Ok(())
    }

    /// Documents remaining in the current materialization.
    pub async fn count(&mut self) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }
        self.ensure_started().await?;
        // Materialize the stream tail so the count is exact.
        while !self.server_exhausted {
            self.fill_to_end().await?;
        }
        Ok(self.buffer.len() - self.position)
    }

    async fn fill_to_end(&mut self) -> Result<()> {
        let source = match &self.fetch {
            Some(source) => source.clone(),
            None => {
                self.server_exhausted = true;
                return Ok(());
            }
        };
        let result = source
            .fetch_batch(self.effective_batch_size(), &self.cancel)
            .await;
        match result {
            Ok(batch) => {
                self.absorb_batch(batch);
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Idempotent; a closed cursor yields nothing further.
    pub fn close(&mut self) {
        self.closed = true;
        self.cancel.cancel();
        self.buffer.clear();
        self.position = 0;
    }

    /// Re-enter the created state. Unsupported for streaming sources,
    /// whose read offset lives server-side.
    pub fn rewind(&mut self) -> Result<()> {
        if self.streaming() {
            return Err(MirageError::InvalidOperation(
                "cannot rewind a streaming cursor".to_string(),
            ));
        }
        self.buffer.clear();
        self.position = 0;
        self.started = false;
        self.server_exhausted = false;
        self.end_dispensed = false;
        self.closed = false;
        self.cancel = CancellationToken::new();
        Ok(())
    }

    /// Dispense up to `n` documents (getMore batching).
    pub async fn next_batch(&mut self, n: usize) -> Result<Vec<Document>> {
        let mut out = Vec::with_capacity(n.min(64));
        while out.len() < n {
            match self.next().await? {
                Some(doc) => out.push(doc),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn exhausted(&self) -> bool {
        self.server_exhausted && self.position >= self.buffer.len()
    }
}

/// Stable multi-key sort used for the client-side `sort` modifier.
pub fn sort_documents(docs: &mut [Document], spec: &Document) {
    docs.sort_by(|a, b| {
        for (key, dir) in spec {
            let descending = matches!(dir, Bson::Int32(d) if *d < 0)
                || matches!(dir, Bson::Int64(d) if *d < 0)
                || matches!(dir, Bson::Double(d) if *d < 0.0);
            let mut ord = compare_optional(get_path(a, key), get_path(b, key));
            if descending {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Include/exclude projection, `_id` included by default in include mode.
pub fn apply_projection(doc: &Document, projection: &Document) -> Document {
    if projection.is_empty() {
        return doc.clone();
    }
    let include_mode = projection
        .iter()
        .any(|(key, value)| key != "_id" && projection_flag(value));

    if include_mode {
        let mut out = Document::new();
        let id_excluded = matches!(projection.get("_id"), Some(v) if !projection_flag(v));
        if !id_excluded {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (key, value) in projection {
            if key == "_id" || !projection_flag(value) {
                continue;
            }
            if let Some(found) = get_path(doc, key) {
                let found = found.clone();
                let _ = crate::value::set_path(&mut out, key, found);
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (key, value) in projection {
            if !projection_flag(value) {
                let _ = crate::value::unset_path(&mut out, key);
            }
        }
        out
    }
}

fn projection_flag(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(d) => *d != 0.0,
        _ => true,
    }
}

struct RegistryEntry {
    cursor: Arc<Mutex<Cursor>>,
    last_touched: Instant,
}

/// Process-wide cursor registry. Critical sections are tiny: insert,
/// remove, lookup, and the sweep scan.
pub struct CursorRegistry {
    cursors: RwLock<HashMap<i64, RegistryEntry>>,
    next_id: AtomicI64,
    idle_ttl: Duration,
}

impl CursorRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1000),
            idle_ttl,
        }
    }

    pub fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, AtomicOrdering::SeqCst)
    }

    pub fn register(&self, cursor: Cursor) -> i64 {
        let id = cursor.id();
        let entry = RegistryEntry {
            cursor: Arc::new(Mutex::new(cursor)),
            last_touched: Instant::now(),
        };
        self.cursors.write().insert(id, entry);
        id
    }

    pub fn get(&self, id: i64) -> Option<Arc<Mutex<Cursor>>> {
        let mut cursors = self.cursors.write();
        let entry = cursors.get_mut(&id)?;
        entry.last_touched = Instant::now();
        Some(entry.cursor.clone())
    }

    pub fn contains(&self, id: i64) -> bool {
        self.cursors.read().contains_key(&id)
    }

    /// Remove and close; true if the cursor existed.
    pub fn close(&self, id: i64) -> bool {
        let entry = self.cursors.write().remove(&id);
        match entry {
            Some(entry) => {
                if let Ok(mut cursor) = entry.cursor.try_lock() {
                    cursor.close();
                }
                true
            }
            None => false,
        }
    }

    /// Close every registered cursor (graceful-stop drain).
    pub fn close_all(&self) -> usize {
        let drained: Vec<RegistryEntry> = {
            let mut cursors = self.cursors.write();
            cursors.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            if let Ok(mut cursor) = entry.cursor.try_lock() {
                cursor.close();
            }
        }
        count
    }

    /// Drop cursors idle past the TTL. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<i64> = {
            let cursors = self.cursors.read();
            cursors
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_touched) > self.idle_ttl)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            self.close(*id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.cursors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.read().is_empty()
    }

    /// Periodic TTL sweep; stops when `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.cleanup_expired();
                        if removed > 0 {
                            crate::mirage_debug!("cursor sweep removed {} expired cursors", removed);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

/// Async iteration over a registered cursor. The returned stream closes
/// the cursor on completion and on drop (break or error paths included).
pub fn into_stream(
    cursor: Arc<Mutex<Cursor>>,
) -> impl futures::Stream<Item = Result<Document>> {
    struct CloseGuard {
        cursor: Arc<Mutex<Cursor>>,
    }

    impl Drop for CloseGuard {
        fn drop(&mut self) {
            if let Ok(mut cursor) = self.cursor.try_lock() {
                cursor.close();
                return;
            }
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cursor = self.cursor.clone();
                handle.spawn(async move {
                    cursor.lock().await.close();
                });
            }
        }
    }

    let guard = CloseGuard {
        cursor: cursor.clone(),
    };

    futures::stream::unfold((cursor, guard, false), |(cursor, guard, done)| async move {
        if done {
            return None;
        }
        let step = {
            let mut locked = cursor.lock().await;
            locked.next().await
        };
        match step {
            Ok(Some(doc)) => Some((Ok(doc), (cursor.clone(), guard, false))),
            Ok(None) => {
                cursor.lock().await.close();
                None
            }
            Err(err) => Some((Err(err), (cursor.clone(), guard, true))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn docs(n: i32) -> Vec<Document> {
        (1..=n).map(|i| doc! {"_id": i, "value": i * 10}).collect()
    }

    fn cursor_over(documents: Vec<Document>) -> Cursor {
        Cursor::from_documents(1, Namespace::new("test", "things"), documents)
    }

    #[tokio::test]
    async fn test_no_fetch_before_first_consume() {
        let cursor = cursor_over(docs(3));
        assert!(!cursor.is_started());
    }

    #[tokio::test]
    async fn test_modifier_after_start_rejected() {
        let mut cursor = cursor_over(docs(3));
        cursor.next().await.unwrap();
        assert!(cursor.limit(1).is_err());
        assert!(cursor.sort(doc! {"value": 1}).is_err());
    }

    #[tokio::test]
    async fn test_negative_modifiers_rejected() {
        let mut cursor = cursor_over(docs(3));
        assert!(cursor.limit(-1).is_err());
        assert!(cursor.skip(-2).is_err());
        assert!(cursor.batch_size(0).is_err());
    }

    #[tokio::test]
    async fn test_close_idempotent_and_terminal() {
        let mut cursor = cursor_over(docs(3));
        cursor.close();
        cursor.close();
        assert_eq!(cursor.next().await.unwrap(), None);
        assert!(cursor.to_array().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conservation_between_next_and_to_array() {
        let mut cursor = cursor_over(docs(5));
        let first = cursor.next().await.unwrap();
        assert!(first.is_some());
        let rest = cursor.to_array().await.unwrap();
        assert_eq!(1 + rest.len(), 5);
    }

    #[tokio::test]
    async fn test_rewind_reenters_created() {
        let mut cursor = cursor_over(docs(2));
        assert_eq!(cursor.to_array().await.unwrap().len(), 2);
        cursor.rewind().unwrap();
        assert!(!cursor.is_started());
        assert_eq!(cursor.to_array().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_for_each_short_circuit_keeps_cursor_open() {
        let mut cursor = cursor_over(docs(5));
        let mut seen = 0;
        cursor
            .for_each(|_, index| {
                seen += 1;
                index < 1
            })
            .await
            .unwrap();
        assert_eq!(seen, 2);
        assert!(!cursor.is_closed());
    }

    #[tokio::test]
    async fn test_map_applies_lazily() {
        let base = cursor_over(docs(2));
        let mut mapped = base.map(2, |mut doc, _| {
            doc.insert("mapped", true);
            doc
        });
        let out = mapped.to_array().await.unwrap();
        assert!(out.iter().all(|d| d.get_bool("mapped").unwrap()));
    }

    #[tokio::test]
    async fn test_registry_ttl_cleanup() {
        let registry = CursorRegistry::new(Duration::from_millis(0));
        let id = registry.allocate_id();
        registry.register(Cursor::from_documents(
            id,
            Namespace::new("test", "c"),
            docs(1),
        ));
        assert_eq!(registry.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.cleanup_expired(), 1);
        assert!(registry.is_empty());
    }
}
