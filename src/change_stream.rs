/*!
 * @file change_stream.rs
 * @brief Change-stream event shape and in-process broadcast broker
 */

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    DropDatabase,
    Invalidate,
    Rename,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Invalidate => "invalidate",
            OperationType::Rename => "rename",
        }
    }
}

/// One change event. Only the shape matters here; delivery transport is
/// out of scope.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: String,
    pub operation_type: OperationType,
    pub cluster_time: bson::Timestamp,
    pub ns: (String, String),
    pub document_key: Option<Document>,
    pub full_document: Option<Document>,
    pub update_description: Option<UpdateDescription>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
    pub truncated_arrays: Vec<Document>,
}

impl ChangeEvent {
    pub fn new(operation_type: OperationType, db: &str, coll: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation_type,
            cluster_time: bson::Timestamp {
                time: chrono::Utc::now().timestamp() as u32,
                increment: 0,
            },
            ns: (db.to_string(), coll.to_string()),
            document_key: None,
            full_document: None,
            update_description: None,
        }
    }

    pub fn with_document_key(mut self, id: Bson) -> Self {
        self.document_key = Some(bson::doc! {"_id": id});
        self
    }

    pub fn with_full_document(mut self, doc: Document) -> Self {
        self.full_document = Some(doc);
        self
    }

    pub fn with_update_description(mut self, description: UpdateDescription) -> Self {
        self.update_description = Some(description);
        self
    }

    /// Wire rendering of the event.
    pub fn to_document(&self) -> Document {
        let mut doc = bson::doc! {
            "_id": self.id.clone(),
            "operationType": self.operation_type.as_str(),
            "clusterTime": self.cluster_time,
            "ns": {"db": self.ns.0.clone(), "coll": self.ns.1.clone()},
        };
        if let Some(key) = &self.document_key {
            doc.insert("documentKey", key.clone());
        }
        if let Some(full) = &self.full_document {
            doc.insert("fullDocument", full.clone());
        }
        if let Some(update) = &self.update_description {
            doc.insert(
                "updateDescription",
                bson::doc! {
                    "updatedFields": update.updated_fields.clone(),
                    "removedFields": update.removed_fields.clone(),
                    "truncatedArrays": update.truncated_arrays.clone(),
                },
            );
        }
        doc
    }
}

/// Process-wide fan-out of change events. Writers publish; subscribers
/// receive a broadcast stream. Lagging subscribers drop events.
pub struct ChangeStreamBroker {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeStreamBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeStreamBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_document_shape() {
        let event = ChangeEvent::new(OperationType::Insert, "app", "users")
            .with_document_key(Bson::Int32(7))
            .with_full_document(bson::doc! {"_id": 7, "name": "ada"});
        let doc = event.to_document();
        assert_eq!(doc.get_str("operationType").unwrap(), "insert");
        assert_eq!(
            doc.get_document("ns").unwrap(),
            &bson::doc! {"db": "app", "coll": "users"}
        );
        assert_eq!(
            doc.get_document("documentKey").unwrap().get_i32("_id").unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn test_broker_fan_out() {
        let broker = ChangeStreamBroker::default();
        let mut rx = broker.subscribe();
        broker.publish(ChangeEvent::new(OperationType::Delete, "app", "users"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation_type, OperationType::Delete);
    }
}
