//! Author presence tracking

use std::collections::HashMap;
use std::sync::RwLock;

use super::broadcast::ClientId;
use super::protocol::PresencePayload;

/// Last-reported presence per connected client.
#[derive(Default)]
pub struct PresenceTracker {
    entries: RwLock<HashMap<ClientId, PresencePayload>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, client: ClientId, presence: PresencePayload) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(client, presence);
        }
    }

    pub fn remove(&self, client: ClientId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&client);
        }
    }

    pub fn get(&self, client: ClientId) -> Option<PresencePayload> {
        self.entries.read().ok()?.get(&client).cloned()
    }

    /// Presence of everyone currently in the given document.
    pub fn in_document(&self, document_id: &str) -> Vec<PresencePayload> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .values()
                    .filter(|p| p.document_id == document_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::PresenceStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn presence(doc: &str) -> PresencePayload {
        PresencePayload {
            author_id: "alice".to_string(),
            document_id: doc.to_string(),
            cursor_position: None,
            selection: None,
            last_active: Utc::now(),
            status: PresenceStatus::Active,
        }
    }

    #[test]
    fn test_update_and_query() {
        let tracker = PresenceTracker::new();
        let client = Uuid::new_v4();

        tracker.update(client, presence("doc"));
        assert!(tracker.get(client).is_some());
        assert_eq!(tracker.in_document("doc").len(), 1);
        assert!(tracker.in_document("other").is_empty());

        tracker.remove(client);
        assert!(tracker.get(client).is_none());
    }
}
