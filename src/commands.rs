/*!
 * Command processing for MirageDB
 * Dispatches wire commands to core operations and shapes the responses
 */

use crate::auth::{SaslResponse, ScramServer};
use crate::backend::{DocumentBackend, FindQuery};
use crate::cursor::DEFAULT_BATCH_SIZE;
use crate::error::{MirageError, Result};
use crate::router::{BackendKind, OperationKind, QueryRouter, ReadRequest};
use crate::update;
use crate::validation::{validate_collection_name, validate_database_name};
use crate::{mirage_debug, mirage_warn};
use bson::spec::BinarySubtype;
use bson::{doc, Array, Bson, Document};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Commands that may run before authentication completes.
const UNAUTHENTICATED_COMMANDS: [&str; 9] = [
    "hello",
    "ismaster",
    "isMaster",
    "saslStart",
    "saslContinue",
    "authenticate",
    "logout",
    "ping",
    "whatsmyuri",
];

pub const SERVER_VERSION: &str = "7.0.0";
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;

/// Per-connection state the processor reads and updates.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub authenticated: Option<String>,
    pub client_addr: String,
}

pub struct CommandProcessor {
    oltp: Arc<dyn DocumentBackend>,
    olap: Option<Arc<dyn DocumentBackend>>,
    router: QueryRouter,
    scram: Arc<ScramServer>,
    auth_enabled: bool,
}

impl CommandProcessor {
    pub fn new(
        oltp: Arc<dyn DocumentBackend>,
        olap: Option<Arc<dyn DocumentBackend>>,
        router: QueryRouter,
        scram: Arc<ScramServer>,
        auth_enabled: bool,
    ) -> Self {
        Self {
            oltp,
            olap,
            router,
            scram,
            auth_enabled,
        }
    }

    /// Render an error as a MongoDB command failure document.
    pub fn error_response(err: &MirageError) -> Document {
        doc! {
            "ok": 0.0,
            "errmsg": err.to_string(),
            "code": err.code(),
            "codeName": err.code_name(),
        }
    }

    /// Dispatch one command document. The command name is the first key.
    pub async fn handle(
        &self,
        command: Document,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let name = command
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| MirageError::WireProtocol("empty command document".to_string()))?;

        if cancel.is_cancelled() {
            return Err(MirageError::Aborted(format!("{} cancelled", name)));
        }

        if self.auth_enabled
            && session.authenticated.is_none()
            && !UNAUTHENTICATED_COMMANDS.contains(&name.as_str())
        {
            return Err(MirageError::Unauthorized(format!(
                "command {} requires authentication",
                name
            )));
        }

        let db = match command.get_str("$db") {
            Ok(db) => {
                validate_database_name(db)?;
                db.to_string()
            }
            Err(_) => crate::uri::DEFAULT_DATABASE.to_string(),
        };

        mirage_debug!("command {} on db {}", name, db);

        // maxTimeMS bounds the whole dispatch; expiry surfaces as the
        // timeout error kind.
        match int_arg(&command, "maxTimeMS") {
            Some(ms) if ms > 0 => {
                let deadline = std::time::Duration::from_millis(ms as u64);
                match tokio::time::timeout(
                    deadline,
                    self.dispatch(&name, &command, &db, session, cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(MirageError::Timeout(format!(
                        "operation exceeded maxTimeMS ({} ms)",
                        ms
                    ))),
                }
            }
            _ => self.dispatch(&name, &command, &db, session, cancel).await,
        }
    }

    async fn dispatch(
        &self,
        name: &str,
        command: &Document,
        db: &str,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        match name {
            "hello" => Ok(self.handshake_response(true)),
            "isMaster" | "ismaster" => Ok(self.handshake_response(false)),
            "ping" => Ok(doc! {"ok": 1.0}),
            "whatsmyuri" => Ok(doc! {"you": session.client_addr.clone(), "ok": 1.0}),
            "buildInfo" | "buildinfo" => Ok(self.build_info()),
            "saslStart" => self.handle_sasl_start(command, db),
            "saslContinue" => self.handle_sasl_continue(command, session),
            "authenticate" => {
                if self.auth_enabled {
                    Err(MirageError::Unauthorized(
                        "authenticate is not supported; use SASL".to_string(),
                    ))
                } else {
                    Ok(doc! {"ok": 1.0})
                }
            }
            "logout" => {
                session.authenticated = None;
                Ok(doc! {"ok": 1.0})
            }
            "listDatabases" => self.handle_list_databases().await,
            "dropDatabase" => self.handle_drop_database(db).await,
            "listCollections" => self.handle_list_collections(db).await,
            "create" => self.handle_create_collection(command, db).await,
            "drop" => self.handle_drop_collection(command, db).await,
            "collStats" => {
                let coll = collection_arg(command, "collStats")?;
                self.oltp.coll_stats(db, &coll).await
            }
            "dbStats" => self.oltp.db_stats(db).await,
            "find" => self.handle_find(command, db, cancel).await,
            "getMore" => self.handle_get_more(command, db).await,
            "killCursors" => self.handle_kill_cursors(command).await,
            "insert" => self.handle_insert(command, db).await,
            "update" => self.handle_update(command, db).await,
            "delete" => self.handle_delete(command, db).await,
            "findAndModify" | "findandmodify" => {
                self.handle_find_and_modify(command, db, cancel).await
            }
            "count" => self.handle_count(command, db).await,
            "distinct" => self.handle_distinct(command, db).await,
            "aggregate" => self.handle_aggregate(command, db, cancel).await,
            "createIndexes" => self.handle_create_indexes(command, db).await,
            "listIndexes" => self.handle_list_indexes(command, db).await,
            "dropIndexes" => self.handle_drop_indexes(command, db).await,
            other => Err(MirageError::CommandNotFound(other.to_string())),
        }
    }

    fn handshake_response(&self, hello: bool) -> Document {
        let mut response = doc! {
            "maxBsonObjectSize": crate::wire_protocol::MAX_BSON_OBJECT_SIZE,
            "maxMessageSizeBytes": crate::wire_protocol::MAX_MESSAGE_SIZE as i32,
            "maxWriteBatchSize": MAX_WRITE_BATCH_SIZE,
            "localTime": Bson::DateTime(bson::DateTime::now()),
            "logicalSessionTimeoutMinutes": 30,
            "minWireVersion": 0,
            "maxWireVersion": 17,
            "readOnly": false,
            "ok": 1.0,
        };
        if hello {
            response.insert("isWritablePrimary", true);
        } else {
            response.insert("ismaster", true);
        }
        if self.auth_enabled {
            response.insert(
                "saslSupportedMechs",
                Bson::Array(vec![Bson::String("SCRAM-SHA-256".to_string())]),
            );
        }
        response
    }

    fn build_info(&self) -> Document {
        doc! {
            "version": SERVER_VERSION,
            "gitVersion": "miragedb",
            "versionArray": [7, 0, 0, 0],
            "modules": Bson::Array(vec![]),
            "bits": 64,
            "debug": false,
            "maxBsonObjectSize": crate::wire_protocol::MAX_BSON_OBJECT_SIZE,
            "ok": 1.0,
        }
    }

    fn handle_sasl_start(&self, command: &Document, db: &str) -> Result<Document> {
        let mechanism = command.get_str("mechanism").unwrap_or("SCRAM-SHA-256");
        let payload = binary_payload(command.get("payload"))?;
        let response = self.scram.sasl_start(mechanism, &payload, db)?;
        Ok(sasl_document(&response))
    }

    fn handle_sasl_continue(&self, command: &Document, session: &mut Session) -> Result<Document> {
        let conversation_id = command
            .get_i64("conversationId")
            .or_else(|_| command.get_i32("conversationId").map(|v| v as i64))
            .map_err(|_| {
                MirageError::InvalidArgument("saslContinue requires conversationId".to_string())
            })?;
        let payload = binary_payload(command.get("payload"))?;
        let (response, authenticated) = self.scram.sasl_continue(conversation_id, &payload)?;
        if let Some(username) = authenticated {
            session.authenticated = Some(username);
        }
        Ok(sasl_document(&response))
    }

    async fn handle_list_databases(&self) -> Result<Document> {
        let names = self.oltp.list_databases().await?;
        let mut databases = Array::new();
        let mut total_size = 0i64;
        for name in names {
            let stats = self.oltp.db_stats(&name).await.unwrap_or_else(|_| doc! {});
            let size = stats.get_i64("dataSize").unwrap_or(0);
            total_size += size;
            databases.push(Bson::Document(doc! {
                "name": name,
                "sizeOnDisk": size,
                "empty": size == 0,
            }));
        }
        Ok(doc! {"databases": databases, "totalSize": total_size, "ok": 1.0})
    }

    async fn handle_drop_database(&self, db: &str) -> Result<Document> {
        self.oltp.drop_database(db).await?;
        Ok(doc! {"dropped": db, "ok": 1.0})
    }

    async fn handle_list_collections(&self, db: &str) -> Result<Document> {
        let names = self.oltp.list_collections(db).await?;
        let batch: Array = names
            .into_iter()
            .map(|name| {
                Bson::Document(doc! {
                    "name": name,
                    "type": "collection",
                    "options": {},
                    "info": {"readOnly": false},
                })
            })
            .collect();
        Ok(cursor_response(0, &format!("{}.$cmd.listCollections", db), batch, true))
    }

    async fn handle_create_collection(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "create")?;
        let options = command
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "create" | "$db"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.oltp.create_collection(db, &coll, options).await?;
        Ok(doc! {"ok": 1.0})
    }

    async fn handle_drop_collection(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "drop")?;
        let existed = self.oltp.drop_collection(db, &coll).await?;
        if !existed {
            return Err(MirageError::InvalidOperation(format!(
                "ns not found: {}.{}",
                db, coll
            )));
        }
        Ok(doc! {"ns": format!("{}.{}", db, coll), "ok": 1.0})
    }

    /// Read operations run on the backend the router picks.
    fn read_backend(&self, decision: &crate::router::RouteDecision) -> Arc<dyn DocumentBackend> {
        match decision.backend {
            BackendKind::Olap => match &self.olap {
                Some(olap) => olap.clone(),
                None => self.oltp.clone(),
            },
            BackendKind::Oltp => self.oltp.clone(),
        }
    }

    async fn handle_find(
        &self,
        command: &Document,
        db: &str,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let coll = collection_arg(command, "find")?;
        let filter = command.get_document("filter").ok().cloned();
        // limit 0 means unbounded; a negative limit is the single-batch
        // form and bounds by its magnitude.
        let limit = int_arg(command, "limit")
            .map(|n| n.abs())
            .filter(|n| *n != 0);
        let skip = int_arg(command, "skip");
        if matches!(skip, Some(n) if n < 0) {
            return Err(MirageError::InvalidArgument(
                "skip must be non-negative".to_string(),
            ));
        }
        let batch_size = int_arg(command, "batchSize");
        if matches!(batch_size, Some(n) if n < 0) {
            return Err(MirageError::InvalidArgument(
                "batchSize must be non-negative".to_string(),
            ));
        }

        let hint = backend_hint(command);
        let decision = {
            let request = ReadRequest {
                kind: Some(OperationKind::Find),
                filter: filter.as_ref(),
                pipeline: None,
                limit,
                backend_hint: hint,
            };
            self.router.route_read(&request)
        };
        mirage_debug!("find {}.{} routed to {}: {}", db, coll, decision.backend, decision.reason);

        let query = FindQuery {
            filter,
            projection: command.get_document("projection").ok().cloned(),
            sort: command.get_document("sort").ok().cloned(),
            limit,
            skip,
            batch_size,
            backend_hint: hint,
        };

        let backend = self.read_backend(&decision);
        let result = backend.find(db, &coll, query, cancel).await?;
        Ok(cursor_response(
            result.cursor_id,
            &format!("{}.{}", db, coll),
            result.documents.into_iter().map(Bson::Document).collect(),
            true,
        ))
    }

    async fn handle_get_more(&self, command: &Document, db: &str) -> Result<Document> {
        let cursor_id = command
            .get_i64("getMore")
            .map_err(|_| MirageError::InvalidArgument("getMore requires a cursor id".to_string()))?;
        let coll = command.get_str("collection").unwrap_or("").to_string();
        let batch_size = int_arg(command, "batchSize")
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        // Cursor lookups fall through to OLAP when OLTP does not know
        // the id.
        let backend = self.backend_owning_cursor(cursor_id).await?;
        let batch = backend.advance_cursor(cursor_id, batch_size).await?;

        let next_id = if batch.exhausted { 0 } else { cursor_id };
        Ok(cursor_response(
            next_id,
            &format!("{}.{}", db, coll),
            batch.documents.into_iter().map(Bson::Document).collect(),
            false,
        ))
    }

    async fn backend_owning_cursor(&self, cursor_id: i64) -> Result<Arc<dyn DocumentBackend>> {
        if self.oltp.get_cursor(cursor_id).await?.is_some() {
            return Ok(self.oltp.clone());
        }
        if let Some(olap) = &self.olap {
            if olap.get_cursor(cursor_id).await?.is_some() {
                return Ok(olap.clone());
            }
        }
        Err(MirageError::CursorNotFound(cursor_id))
    }

    async fn handle_kill_cursors(&self, command: &Document) -> Result<Document> {
        let ids = command
            .get_array("cursors")
            .map_err(|_| MirageError::InvalidArgument("killCursors requires cursors".to_string()))?;
        let mut killed = Array::new();
        let mut not_found = Array::new();
        for id_value in ids {
            let id = match id_value {
                Bson::Int64(id) => *id,
                Bson::Int32(id) => *id as i64,
                _ => continue,
            };
            let mut closed = self.oltp.close_cursor(id).await?;
            if !closed {
                if let Some(olap) = &self.olap {
                    closed = olap.close_cursor(id).await?;
                }
            }
            if closed {
                killed.push(Bson::Int64(id));
            } else {
                not_found.push(Bson::Int64(id));
            }
        }
        Ok(doc! {
            "cursorsKilled": killed,
            "cursorsNotFound": not_found,
            "cursorsAlive": Bson::Array(vec![]),
            "ok": 1.0,
        })
    }

    async fn handle_insert(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "insert")?;
        let documents = command
            .get_array("documents")
            .map_err(|_| MirageError::InvalidArgument("insert requires documents".to_string()))?;

        let mut inserted = 0i32;
        let mut write_errors = Array::new();
        for (index, value) in documents.iter().enumerate() {
            let doc = value.as_document().ok_or_else(|| {
                MirageError::InvalidArgument("insert documents must be objects".to_string())
            })?;
            match self.oltp.insert_one(db, &coll, doc.clone()).await {
                Ok(_) => inserted += 1,
                Err(err @ MirageError::DuplicateKey(_)) => {
                    write_errors.push(Bson::Document(doc! {
                        "index": index as i32,
                        "code": err.code(),
                        "errmsg": err.to_string(),
                    }));
                    // Ordered inserts stop at the first failing document.
                    break;
                }
                Err(other) => return Err(other),
            }
        }

        let mut response = doc! {"n": inserted, "ok": 1.0};
        if !write_errors.is_empty() {
            response.insert("writeErrors", write_errors);
        }
        Ok(response)
    }

    async fn handle_update(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "update")?;
        let updates = command
            .get_array("updates")
            .map_err(|_| MirageError::InvalidArgument("update requires updates".to_string()))?;

        let mut matched = 0i64;
        let mut modified = 0i64;
        let mut upserted = Array::new();
        for (index, entry) in updates.iter().enumerate() {
            let entry = entry.as_document().ok_or_else(|| {
                MirageError::InvalidArgument("update entries must be objects".to_string())
            })?;
            let filter = entry.get_document("q").map_err(|_| {
                MirageError::InvalidArgument("update entry requires q".to_string())
            })?;
            let update_doc = entry.get_document("u").map_err(|_| {
                MirageError::InvalidArgument("update entry requires u".to_string())
            })?;
            let multi = entry.get_bool("multi").unwrap_or(false);
            let upsert = entry.get_bool("upsert").unwrap_or(false);

            let summary = if multi {
                self.oltp.update_many(db, &coll, filter, update_doc).await?
            } else {
                self.oltp.update_one(db, &coll, filter, update_doc).await?
            };
            matched += summary.matched as i64;
            modified += summary.modified as i64;

            if upsert && summary.matched == 0 {
                let seed = upsert_seed(filter);
                let (new_doc, _) = update::apply(update_doc, &seed)?;
                let id = self.oltp.insert_one(db, &coll, new_doc).await?;
                upserted.push(Bson::Document(doc! {"index": index as i32, "_id": id}));
            }
        }

        let mut response = doc! {
            "n": matched + upserted.len() as i64,
            "nModified": modified,
            "ok": 1.0,
        };
        if !upserted.is_empty() {
            response.insert("upserted", upserted);
        }
        Ok(response)
    }

    async fn handle_delete(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "delete")?;
        let deletes = command
            .get_array("deletes")
            .map_err(|_| MirageError::InvalidArgument("delete requires deletes".to_string()))?;

        let mut removed = 0i64;
        for entry in deletes {
            let entry = entry.as_document().ok_or_else(|| {
                MirageError::InvalidArgument("delete entries must be objects".to_string())
            })?;
            let filter = entry.get_document("q").map_err(|_| {
                MirageError::InvalidArgument("delete entry requires q".to_string())
            })?;
            let limit = int_arg(entry, "limit").unwrap_or(0);
            removed += if limit == 1 {
                self.oltp.delete_one(db, &coll, filter).await? as i64
            } else {
                self.oltp.delete_many(db, &coll, filter).await? as i64
            };
        }
        Ok(doc! {"n": removed, "ok": 1.0})
    }

    async fn handle_find_and_modify(
        &self,
        command: &Document,
        db: &str,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let coll = command
            .get_str("findAndModify")
            .or_else(|_| command.get_str("findandmodify"))
            .map_err(|_| {
                MirageError::InvalidArgument("findAndModify requires a collection".to_string())
            })?
            .to_string();
        validate_collection_name(&coll)?;

        let filter = command.get_document("query").ok().cloned().unwrap_or_default();
        let sort = command.get_document("sort").ok().cloned();
        let remove = command.get_bool("remove").unwrap_or(false);
        let return_new = command.get_bool("new").unwrap_or(false);
        let fields = command.get_document("fields").ok().cloned();

        let query = FindQuery {
            filter: Some(filter.clone()),
            sort,
            limit: Some(1),
            ..FindQuery::default()
        };
        let found = self
            .oltp
            .find(db, &coll, query, cancel)
            .await?
            .documents
            .into_iter()
            .next();

        let target = match found {
            Some(target) => target,
            None => {
                return Ok(doc! {
                    "lastErrorObject": {"n": 0, "updatedExisting": false},
                    "value": Bson::Null,
                    "ok": 1.0,
                })
            }
        };
        let id_filter = doc! {"_id": target.get("_id").cloned().unwrap_or(Bson::Null)};

        let value = if remove {
            self.oltp.delete_one(db, &coll, &id_filter).await?;
            target
        } else {
            let update_doc = command.get_document("update").map_err(|_| {
                MirageError::InvalidArgument(
                    "findAndModify requires update or remove".to_string(),
                )
            })?;
            self.oltp
                .update_one(db, &coll, &id_filter, update_doc)
                .await?;
            if return_new {
                let query = FindQuery {
                    filter: Some(id_filter.clone()),
                    limit: Some(1),
                    ..FindQuery::default()
                };
                self.oltp
                    .find(db, &coll, query, cancel)
                    .await?
                    .documents
                    .into_iter()
                    .next()
                    .unwrap_or(target)
            } else {
                target
            }
        };

        let value = match fields {
            Some(projection) => crate::cursor::apply_projection(&value, &projection),
            None => value,
        };
        Ok(doc! {
            "lastErrorObject": {"n": 1, "updatedExisting": !remove},
            "value": Bson::Document(value),
            "ok": 1.0,
        })
    }

    async fn handle_count(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "count")?;
        let filter = command.get_document("query").ok().cloned();

        let request = ReadRequest {
            kind: Some(OperationKind::Count),
            filter: filter.as_ref(),
            backend_hint: backend_hint(command),
            ..ReadRequest::default()
        };
        let decision = self.router.route_read(&request);
        let backend = self.read_backend(&decision);
        let n = backend.count(db, &coll, filter.as_ref()).await?;
        Ok(doc! {"n": n as i64, "ok": 1.0})
    }

    async fn handle_distinct(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "distinct")?;
        let key = command
            .get_str("key")
            .map_err(|_| MirageError::InvalidArgument("distinct requires key".to_string()))?;
        let filter = command.get_document("query").ok().cloned();

        let request = ReadRequest {
            kind: Some(OperationKind::Distinct),
            filter: filter.as_ref(),
            backend_hint: backend_hint(command),
            ..ReadRequest::default()
        };
        let decision = self.router.route_read(&request);
        let backend = self.read_backend(&decision);
        let values = backend.distinct(db, &coll, key, filter.as_ref()).await?;
        Ok(doc! {"values": Bson::Array(values), "ok": 1.0})
    }

    async fn handle_aggregate(
        &self,
        command: &Document,
        db: &str,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let coll = collection_arg(command, "aggregate")?;
        let pipeline = command
            .get_array("pipeline")
            .map_err(|_| MirageError::InvalidArgument("aggregate requires pipeline".to_string()))?;

        let request = ReadRequest {
            kind: Some(OperationKind::Aggregate),
            pipeline: Some(pipeline),
            backend_hint: backend_hint(command),
            ..ReadRequest::default()
        };
        let decision = self.router.route_read(&request);
        mirage_debug!(
            "aggregate {}.{} routed to {}: {}",
            db,
            coll,
            decision.backend,
            decision.reason
        );

        let backend = self.read_backend(&decision);
        let mut results = backend.aggregate(db, &coll, pipeline, cancel).await?;

        let batch_size = command
            .get_document("cursor")
            .ok()
            .and_then(|c| int_arg(c, "batchSize"))
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let (first_batch, cursor_id) = if results.len() > batch_size {
            let rest = results.split_off(batch_size);
            let id = backend.create_cursor(db, &coll, rest, None).await?;
            (results, id)
        } else {
            (results, 0)
        };

        Ok(cursor_response(
            cursor_id,
            &format!("{}.{}", db, coll),
            first_batch.into_iter().map(Bson::Document).collect(),
            true,
        ))
    }

    async fn handle_create_indexes(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "createIndexes")?;
        let specs = command
            .get_array("indexes")
            .map_err(|_| MirageError::InvalidArgument("createIndexes requires indexes".to_string()))?;
        let before = self.oltp.list_indexes(db, &coll).await?.len() as i32;
        let specs: Vec<Document> = specs
            .iter()
            .filter_map(|s| s.as_document().cloned())
            .collect();
        self.oltp.create_indexes(db, &coll, specs).await?;
        let after = self.oltp.list_indexes(db, &coll).await?.len() as i32;
        Ok(doc! {
            "numIndexesBefore": before,
            "numIndexesAfter": after,
            "createdCollectionAutomatically": before == 0,
            "ok": 1.0,
        })
    }

    async fn handle_list_indexes(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "listIndexes")?;
        let indexes = self.oltp.list_indexes(db, &coll).await?;
        Ok(cursor_response(
            0,
            &format!("{}.$cmd.listIndexes.{}", db, coll),
            indexes.into_iter().map(Bson::Document).collect(),
            true,
        ))
    }

    async fn handle_drop_indexes(&self, command: &Document, db: &str) -> Result<Document> {
        let coll = collection_arg(command, "dropIndexes")?;
        let index = command.get_str("index").unwrap_or("*");
        if index == "*" {
            let dropped = self.oltp.drop_indexes(db, &coll).await?;
            Ok(doc! {"nIndexesWas": dropped as i64 + 1, "ok": 1.0})
        } else {
            let dropped = self.oltp.drop_index(db, &coll, index).await?;
            if !dropped {
                mirage_warn!("dropIndexes: index {} not found on {}.{}", index, db, coll);
            }
            Ok(doc! {"ok": 1.0})
        }
    }
}

fn collection_arg(command: &Document, name: &str) -> Result<String> {
    let coll = command
        .get_str(name)
        .map_err(|_| MirageError::InvalidArgument(format!("{} requires a collection", name)))?;
    validate_collection_name(coll)?;
    Ok(coll.to_string())
}

fn int_arg(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key) {
        Some(Bson::Int32(n)) => Some(*n as i64),
        Some(Bson::Int64(n)) => Some(*n),
        Some(Bson::Double(d)) => Some(*d as i64),
        _ => None,
    }
}

fn backend_hint(command: &Document) -> Option<BackendKind> {
    match command.get_str("backendHint") {
        Ok("olap") => Some(BackendKind::Olap),
        Ok("oltp") => Some(BackendKind::Oltp),
        _ => None,
    }
}

/// Equality fields of the filter seed an upserted document.
fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {}
            other => {
                let _ = crate::value::set_path(&mut seed, key, other.clone());
            }
        }
    }
    seed
}

fn binary_payload(value: Option<&Bson>) -> Result<Vec<u8>> {
    match value {
        Some(Bson::Binary(binary)) => Ok(binary.bytes.clone()),
        Some(Bson::String(s)) => Ok(s.clone().into_bytes()),
        _ => Err(MirageError::InvalidArgument(
            "payload must be binary".to_string(),
        )),
    }
}

fn sasl_document(response: &SaslResponse) -> Document {
    doc! {
        "conversationId": response.conversation_id,
        "payload": Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Generic,
            bytes: response.payload.clone(),
        }),
        "done": response.done,
        "ok": 1.0,
    }
}

fn cursor_response(cursor_id: i64, ns: &str, batch: Array, first: bool) -> Document {
    let batch_key = if first { "firstBatch" } else { "nextBatch" };
    doc! {
        "cursor": {
            batch_key: batch,
            "id": cursor_id,
            "ns": ns,
        },
        "ok": 1.0,
    }
}
