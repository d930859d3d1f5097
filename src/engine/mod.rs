//! The collaboration engine
//!
//! Coordinates the DAG, resolver, documents and storage behind one facade.
//! An accepted operation flows: validate, DAG insert, persist, resolver
//! notification, document apply, document persist, re-index, broadcast.
//! Persistence failures surface to the caller without rolling back the DAG;
//! operations are content-addressed and re-apply harmlessly.

mod broadcast;
mod presence;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::address::{
    AddressError, AddressResolver, MovementRecord, PositionRange, RepositoryId, ResolvedAddress,
    StableAddress,
};
use crate::document::{Document, DocumentError, DocumentSnapshot};
use crate::ops::{DagError, OpId, Operation, OperationDag};
use crate::position::AuthorId;
use crate::storage::{StorageError, Store};

pub use broadcast::{Broadcaster, ClientHandle, ClientId, ClientInfo, CLIENT_SEND_BUFFER};
pub use presence::PresenceTracker;
pub use protocol::{
    AckPayload, ErrorPayload, Message, MessageKind, OperationPayload, PresencePayload,
    PresenceStatus, SyncPayload,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid operation: {0}")]
    Dag(#[from] DagError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("address error: {0}")]
    Address(#[from] AddressError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation metadata is missing document_id")]
    MissingDocumentId,

    #[error("client not found: {0}")]
    ClientNotFound(ClientId),
}

/// The engine facade. Construct once, share behind an `Arc`, hand to the
/// transport.
pub struct Engine {
    dag: Arc<OperationDag>,
    resolver: Arc<AddressResolver>,
    documents: tokio::sync::RwLock<HashMap<String, Arc<Document>>>,
    store: Arc<dyn Store>,
    broadcaster: Broadcaster,
    presence: PresenceTracker,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            dag: Arc::new(OperationDag::new()),
            resolver: Arc::new(AddressResolver::new()),
            documents: tokio::sync::RwLock::new(HashMap::new()),
            store,
            broadcaster: Broadcaster::new(),
            presence: PresenceTracker::new(),
        }
    }

    pub fn dag(&self) -> &OperationDag {
        &self.dag
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    /// Run an operation through the full pipeline. `from_client` names the
    /// submitting connection so the broadcast skips it.
    pub async fn process_operation(
        &self,
        op: Operation,
        from_client: Option<ClientId>,
    ) -> Result<Arc<Operation>, EngineError> {
        OperationDag::validate(&op)?;
        let op = Arc::new(op);

        let missing = self.dag.missing_parents(&op)?;
        if !missing.is_empty() {
            // Detected but not yet enforced.
            warn!(op = %op.id, ?missing, "operation names parents not in the graph");
        }

        self.dag.add(Arc::clone(&op))?;
        self.store.put_operation(&op).await?;
        self.resolver.process_operation(&op)?;

        let document_id = op
            .metadata
            .document_id()
            .ok_or(EngineError::MissingDocumentId)?
            .to_string();

        let doc = self.load_or_create(&document_id).await?;
        doc.apply(&op)?;

        let snapshot = doc.snapshot()?;
        self.store.put_document(&snapshot).await?;
        self.resolver.index_document(&snapshot)?;

        self.broadcast_operation(&op, &document_id, from_client)?;
        debug!(op = %op.id, document = %document_id, "operation applied");
        Ok(op)
    }

    /// The current state of a document, creating an empty one on first
    /// reference. Storage is authoritative for previously seen documents.
    pub async fn document(&self, document_id: &str) -> Result<Arc<Document>, EngineError> {
        self.load_or_create(document_id).await
    }

    pub async fn document_snapshot(
        &self,
        document_id: &str,
    ) -> Result<DocumentSnapshot, EngineError> {
        Ok(self.load_or_create(document_id).await?.snapshot()?)
    }

    /// Every known document path, persisted or only in memory so far.
    pub async fn list_documents(&self) -> Result<Vec<String>, EngineError> {
        let mut paths = self.store.list_documents().await?;
        for key in self.documents.read().await.keys() {
            if !paths.contains(key) {
                paths.push(key.clone());
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn operation(&self, id: &str) -> Result<Arc<Operation>, EngineError> {
        Ok(self.dag.get(id)?)
    }

    pub fn operations_since(
        &self,
        since: chrono::DateTime<Utc>,
    ) -> Result<Vec<Arc<Operation>>, EngineError> {
        Ok(self.dag.since(since)?)
    }

    pub fn operations_by_author(
        &self,
        author: &AuthorId,
    ) -> Result<Vec<Arc<Operation>>, EngineError> {
        Ok(self.dag.by_author(author)?)
    }

    pub fn causal_history(&self, id: &str) -> Result<Vec<Arc<Operation>>, EngineError> {
        Ok(self.dag.causal_history(id)?)
    }

    pub fn create_address(
        &self,
        repository: RepositoryId,
        creation_op_id: OpId,
        range: PositionRange,
    ) -> Result<StableAddress, EngineError> {
        Ok(self.resolver.create_address(repository, creation_op_id, range)?)
    }

    pub fn resolve_address(
        &self,
        address: &StableAddress,
    ) -> Result<ResolvedAddress, EngineError> {
        Ok(self.resolver.resolve(address)?)
    }

    pub fn address_history(
        &self,
        address: &StableAddress,
    ) -> Result<Vec<MovementRecord>, EngineError> {
        Ok(self.resolver.history(address)?)
    }

    pub fn address_history_by_key(&self, key: &str) -> Result<Vec<MovementRecord>, EngineError> {
        Ok(self.resolver.history_by_key(key)?)
    }

    pub fn addresses_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<StableAddress>, EngineError> {
        Ok(self.resolver.addresses_for_document(document_id)?)
    }

    /// Register a connection; the transport drains the returned receiver.
    pub fn connect_client(&self, author: AuthorId) -> (Arc<ClientHandle>, mpsc::Receiver<Message>) {
        let (handle, receiver) = self.broadcaster.register(author);
        info!(client = %handle.id, author = %handle.author, "client connected");
        (handle, receiver)
    }

    pub fn disconnect_client(&self, id: ClientId) {
        self.presence.remove(id);
        if self.broadcaster.remove(id).is_some() {
            info!(client = %id, "client disconnected");
        }
    }

    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.broadcaster.clients()
    }

    pub fn document_clients(&self, document_id: &str) -> Vec<ClientInfo> {
        self.broadcaster.document_clients(document_id)
    }

    pub fn presence_in_document(&self, document_id: &str) -> Vec<PresencePayload> {
        self.presence.in_document(document_id)
    }

    /// Record a presence update and fan it out to co-subscribers.
    pub fn update_presence(
        &self,
        client_id: ClientId,
        presence: PresencePayload,
    ) -> Result<(), EngineError> {
        if self.broadcaster.get(client_id).is_none() {
            return Err(EngineError::ClientNotFound(client_id));
        }
        self.presence.update(client_id, presence.clone());

        if !presence.document_id.is_empty() {
            let message = Message::new(
                MessageKind::Presence,
                &presence,
                presence.author_id.clone(),
            )?;
            self.broadcaster
                .broadcast_to_document(&presence.document_id, &message, Some(client_id));
        }
        Ok(())
    }

    /// Subscribe a client to a document and send it a sync frame with the
    /// current snapshot plus recent operations for that document.
    pub async fn sync_client(
        &self,
        client_id: ClientId,
        document_id: &str,
        since_version: u64,
    ) -> Result<(), EngineError> {
        let client = self
            .broadcaster
            .get(client_id)
            .ok_or(EngineError::ClientNotFound(client_id))?;

        let doc = self.load_or_create(document_id).await?;
        let snapshot = doc.snapshot()?;

        let operations: Vec<Operation> = if since_version > 0 {
            self.dag
                .since(Utc::now() - Duration::hours(1))?
                .into_iter()
                .filter(|op| op.metadata.document_id() == Some(document_id))
                .map(|op| (*op).clone())
                .collect()
        } else {
            Vec::new()
        };

        let payload = SyncPayload {
            document_id: document_id.to_string(),
            operations,
            current_state: Some(snapshot),
            since_version,
        };
        let message = Message::new(MessageKind::Sync, &payload, client.author.clone())?;

        client.subscribe(document_id);
        client.send(message);
        Ok(())
    }

    async fn load_or_create(&self, document_id: &str) -> Result<Arc<Document>, EngineError> {
        if let Some(doc) = self.documents.read().await.get(document_id) {
            return Ok(Arc::clone(doc));
        }

        // Fetch outside the map lock; storage is the authority on restart.
        let loaded = match self.store.document(document_id).await {
            Ok(snapshot) => Document::from_snapshot(snapshot)?,
            Err(StorageError::DocumentNotFound(_)) => Document::new(document_id),
            Err(e) => return Err(e.into()),
        };

        let mut documents = self.documents.write().await;
        let entry = documents
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(loaded));
        Ok(Arc::clone(entry))
    }

    fn broadcast_operation(
        &self,
        op: &Arc<Operation>,
        document_id: &str,
        exclude: Option<ClientId>,
    ) -> Result<(), EngineError> {
        let payload = OperationPayload {
            operation: (**op).clone(),
            document_id: document_id.to_string(),
        };
        let message = Message::new(MessageKind::Operation, &payload, op.author.clone())?;
        self.broadcaster
            .broadcast_to_document(document_id, &message, exclude);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpKind, OperationMeta};
    use crate::position::Position;
    use crate::storage::MemoryStore;
    use sha2::{Digest, Sha256};

    fn engine() -> Engine {
        Engine::new(Arc::new(MemoryStore::new()))
    }

    fn insert(pos: Position, content: &str, author: &str, doc: &str) -> Operation {
        Operation::new(
            OpKind::Insert,
            pos,
            content,
            author,
            vec![],
            OperationMeta::for_document(doc),
        )
    }

    fn delete(pos: Position, author: &str, doc: &str) -> Operation {
        Operation::new(
            OpKind::Delete,
            pos,
            "",
            author,
            vec![],
            OperationMeta::for_document(doc),
        )
    }

    #[tokio::test]
    async fn test_interleave_and_converge() {
        // Author A inserts first; author B squeezes in before it.
        let pos_a = Position::between(None, None, "author-a");
        let pos_b = Position::between(None, Some(&pos_a), "author-b");

        let op_a = insert(pos_a, "from-a", "author-a", "doc.txt");
        let op_b = insert(pos_b, "from-b", "author-b", "doc.txt");

        let forward = engine();
        forward.process_operation(op_a.clone(), None).await.unwrap();
        forward.process_operation(op_b.clone(), None).await.unwrap();

        let reversed = engine();
        reversed.process_operation(op_b, None).await.unwrap();
        reversed.process_operation(op_a, None).await.unwrap();

        let doc_f = forward.document("doc.txt").await.unwrap();
        let doc_r = reversed.document("doc.txt").await.unwrap();

        assert_eq!(doc_f.render().unwrap(), "from-bfrom-a");
        assert_eq!(doc_r.render().unwrap(), "from-bfrom-a");
        assert_eq!(
            doc_f.content_hash().unwrap(),
            doc_r.content_hash().unwrap()
        );
        assert_eq!(doc_f.version().unwrap(), 2);
        assert_eq!(doc_r.version().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stable_address_survives_displacement() {
        let engine = engine();

        let p1 = Position::between(None, None, "alice");
        let hello = insert(p1.clone(), "hello", "alice", "doc.txt");
        let hello_id = engine
            .process_operation(hello, None)
            .await
            .unwrap()
            .id
            .clone();

        let addr = engine
            .create_address(
                "repo".to_string(),
                hello_id,
                PositionRange::at(p1.clone()),
            )
            .unwrap();
        let resolved = engine.resolve_address(&addr).unwrap();
        assert!(resolved.is_valid);
        assert_eq!(resolved.constructs.len(), 1);

        // Insert ahead of the anchored span.
        let p0 = Position::between(None, Some(&p1), "bob");
        let prefix = insert(p0, "SAY ", "bob", "doc.txt");
        engine.process_operation(prefix, None).await.unwrap();

        let doc = engine.document("doc.txt").await.unwrap();
        assert_eq!(doc.render().unwrap(), "SAY hello");

        // The insert happened outside the range: the address is untouched.
        let resolved = engine.resolve_address(&addr).unwrap();
        assert!(resolved.is_valid);
        assert!(resolved.movement_history.is_empty());
        assert_eq!(resolved.constructs.len(), 1);
        assert_eq!(resolved.constructs[0].content, "hello");
    }

    #[tokio::test]
    async fn test_address_invalidated_on_delete() {
        let engine = engine();

        let p1 = Position::between(None, None, "alice");
        let hello = insert(p1.clone(), "hello", "alice", "doc.txt");
        let hello_id = engine
            .process_operation(hello, None)
            .await
            .unwrap()
            .id
            .clone();

        let addr = engine
            .create_address(
                "repo".to_string(),
                hello_id,
                PositionRange::at(p1.clone()),
            )
            .unwrap();

        engine
            .process_operation(delete(p1, "alice", "doc.txt"), None)
            .await
            .unwrap();

        let resolved = engine.resolve_address(&addr).unwrap();
        assert!(!resolved.is_valid);
        assert_eq!(resolved.movement_history.len(), 1);
        let record = &resolved.movement_history[0];
        assert_eq!(record.reason, crate::address::MovementReason::Delete);
        assert!(record.to_range.is_none());
    }

    #[tokio::test]
    async fn test_causal_history_through_engine() {
        let engine = engine();

        let mut position = Position::between(None, None, "alice");
        let o1 = insert(position.clone(), "o1", "alice", "doc.txt");
        let o1_id = o1.id.clone();
        engine.process_operation(o1, None).await.unwrap();

        position = Position::between(Some(&position), None, "alice");
        let o2 = insert(position.clone(), "o2", "alice", "doc.txt")
            .with_parents(vec![o1_id.clone()]);
        let o2_id = o2.id.clone();
        engine.process_operation(o2, None).await.unwrap();

        position = Position::between(Some(&position), None, "alice");
        let o3 = insert(position.clone(), "o3", "alice", "doc.txt")
            .with_parents(vec![o1_id.clone()]);
        let o3_id = o3.id.clone();
        engine.process_operation(o3, None).await.unwrap();

        position = Position::between(Some(&position), None, "alice");
        let o4 = insert(position, "o4", "alice", "doc.txt")
            .with_parents(vec![o2_id.clone(), o3_id.clone()]);
        let o4_id = o4.id.clone();
        engine.process_operation(o4, None).await.unwrap();

        let history = engine.causal_history(&o4_id).unwrap();
        let ids: Vec<&str> = history.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids.len(), 4);

        let idx = |id: &str| ids.iter().position(|x| *x == id).unwrap();
        assert!(idx(&o1_id) < idx(&o2_id));
        assert!(idx(&o1_id) < idx(&o3_id));
        assert!(idx(&o2_id) < idx(&o4_id));
        assert!(idx(&o3_id) < idx(&o4_id));
    }

    #[tokio::test]
    async fn test_idempotent_reapply() {
        let engine = engine();

        let pos = Position::between(None, None, "alice");
        let op = insert(pos, "hello", "alice", "doc.txt");

        engine.process_operation(op.clone(), None).await.unwrap();

        // Same operation again: the DAG stays put, the document apply
        // surfaces the occupied position.
        let err = engine.process_operation(op, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Document(DocumentError::PositionOccupied)
        ));

        assert_eq!(engine.dag().len().unwrap(), 1);

        let doc = engine.document("doc.txt").await.unwrap();
        assert_eq!(doc.version().unwrap(), 1);
        let expected: [u8; 32] = Sha256::digest(b"hello").into();
        assert_eq!(doc.content_hash().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_missing_document_id_rejected() {
        let engine = engine();
        let op = Operation::new(
            OpKind::Insert,
            Position::single(1, "alice"),
            "hello",
            "alice",
            vec![],
            OperationMeta::default(),
        );
        let err = engine.process_operation(op, None).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingDocumentId));
    }

    #[tokio::test]
    async fn test_operation_broadcast_to_subscribers() {
        let engine = engine();
        let (client, mut rx) = engine.connect_client("observer".to_string());
        client.subscribe("doc.txt");

        let op = insert(
            Position::between(None, None, "alice"),
            "hello",
            "alice",
            "doc.txt",
        );
        engine.process_operation(op, None).await.unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.kind, MessageKind::Operation);
        let payload: OperationPayload = serde_json::from_value(frame.payload).unwrap();
        assert_eq!(payload.document_id, "doc.txt");
        assert_eq!(payload.operation.content, "hello");
    }

    #[tokio::test]
    async fn test_sender_excluded_from_broadcast() {
        let engine = engine();
        let (sender, mut sender_rx) = engine.connect_client("alice".to_string());
        sender.subscribe("doc.txt");

        let op = insert(
            Position::between(None, None, "alice"),
            "hello",
            "alice",
            "doc.txt",
        );
        engine
            .process_operation(op, Some(sender.id))
            .await
            .unwrap();

        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_client_sends_snapshot() {
        let engine = engine();
        let op = insert(
            Position::between(None, None, "alice"),
            "hello",
            "alice",
            "doc.txt",
        );
        engine.process_operation(op, None).await.unwrap();

        let (client, mut rx) = engine.connect_client("bob".to_string());
        engine.sync_client(client.id, "doc.txt", 1).await.unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.kind, MessageKind::Sync);
        let payload: SyncPayload = serde_json::from_value(frame.payload).unwrap();
        assert_eq!(payload.document_id, "doc.txt");
        assert_eq!(payload.operations.len(), 1);
        assert_eq!(payload.current_state.unwrap().version, 1);
        assert!(client.is_subscribed("doc.txt"));
    }

    #[tokio::test]
    async fn test_presence_update_fans_out() {
        let engine = engine();
        let (speaker, _speaker_rx) = engine.connect_client("alice".to_string());
        let (listener, mut listener_rx) = engine.connect_client("bob".to_string());
        listener.subscribe("doc.txt");

        let presence = PresencePayload {
            author_id: "alice".to_string(),
            document_id: "doc.txt".to_string(),
            cursor_position: None,
            selection: None,
            last_active: Utc::now(),
            status: PresenceStatus::Active,
        };
        engine.update_presence(speaker.id, presence).unwrap();

        let frame = listener_rx.try_recv().unwrap();
        assert_eq!(frame.kind, MessageKind::Presence);
        assert_eq!(engine.presence_in_document("doc.txt").len(), 1);
    }

    #[tokio::test]
    async fn test_document_survives_restart_through_store() {
        let store = Arc::new(MemoryStore::new());

        let first = Engine::new(Arc::clone(&store) as Arc<dyn Store>);
        let op = insert(
            Position::between(None, None, "alice"),
            "persisted",
            "alice",
            "doc.txt",
        );
        first.process_operation(op, None).await.unwrap();
        drop(first);

        let second = Engine::new(store);
        let doc = second.document("doc.txt").await.unwrap();
        assert_eq!(doc.render().unwrap(), "persisted");
        assert_eq!(doc.version().unwrap(), 1);
    }
}
