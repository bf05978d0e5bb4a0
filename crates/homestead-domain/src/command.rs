use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::DomainResult;
use crate::payload::ACK_KEY;
use crate::protocol::Protocol;
use crate::snapshot::SnapshotCache;
use crate::store::{CommandPusher, CommandStore};

/// Delivery lifecycle of a queued command. At-least-once: sent entries
/// stay sent until the device acknowledges them, and a lost
/// acknowledgement only means the entry is delivered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "pending" => Some(CommandStatus::Pending),
            "sent" => Some(CommandStatus::Sent),
            "acknowledged" => Some(CommandStatus::Acknowledged),
            _ => None,
        }
    }
}

/// One queued command for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEntry {
    pub id: Uuid,
    pub device_id: String,
    /// Command tree: `{subdevice: {command: value, ...}, ...}`.
    pub command: Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub ack_at: Option<DateTime<Utc>>,
}

impl CommandEntry {
    pub fn new(device_id: impl Into<String>, command: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            command,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            sent_at: None,
            ack_at: None,
        }
    }
}

/// Extracts command ids from an acknowledgement token.
///
/// Devices are sloppy here, so the parser is forgiving: the token is
/// trimmed; a token that looks like a JSON object has its `_ack`
/// member unwrapped; stray control characters are stripped; and the
/// remainder is split on commas, dropping anything that is not a
/// well-formed id.
pub fn parse_ack_token(token: &str) -> Vec<Uuid> {
    let mut token = token.trim().to_owned();
    if token.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<Value>(&token) {
            if let Some(ack) = json.get(ACK_KEY) {
                token = match ack.as_str() {
                    Some(s) => s.to_owned(),
                    None => ack.to_string(),
                };
            }
        }
    }
    let cleaned: String = token.chars().filter(|c| !c.is_ascii_control()).collect();
    cleaned
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match Uuid::parse_str(part) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(token = part, "dropping malformed command id in ack");
                None
            }
        })
        .collect()
}

/// Merges command trees oldest-first into one delivery document.
/// Sub-device maps are unioned; on key collision the newer command
/// wins, so a later retarget supersedes an earlier one.
pub fn merge_command_trees<'a>(trees: impl IntoIterator<Item = &'a Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for tree in trees {
        let Value::Object(subdevices) = tree else { continue };
        for (subdevice, commands) in subdevices {
            let Value::Object(commands) = commands else { continue };
            let slot = merged
                .entry(subdevice.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(slot) = slot {
                for (key, value) in commands {
                    slot.insert(key.clone(), value.clone());
                }
            }
        }
    }
    merged
}

/// The command queue: durable enqueue, opportunistic immediate push,
/// piggy-backed drain on ingestion responses, and acknowledgement
/// tracking.
pub struct CommandQueue {
    store: Arc<dyn CommandStore>,
    snapshots: Arc<SnapshotCache>,
    pusher: Option<Arc<dyn CommandPusher>>,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn CommandStore>, snapshots: Arc<SnapshotCache>) -> Self {
        Self {
            store,
            snapshots,
            pusher: None,
        }
    }

    pub fn with_pusher(mut self, pusher: Arc<dyn CommandPusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Persists a command, then attempts immediate delivery when the
    /// device last spoke MQTT and a pusher is wired. A failed push
    /// leaves the entry pending for the next drain.
    #[instrument(skip(self, command), fields(device_id = %device_id))]
    pub async fn enqueue(&self, device_id: &str, command: Value) -> DomainResult<Uuid> {
        let entry = CommandEntry::new(device_id, command.clone());
        let id = entry.id;
        self.store.insert(entry).await?;
        info!(command_id = %id, "command queued");

        if let Some(pusher) = &self.pusher {
            if self.snapshots.last_protocol(device_id).await == Some(Protocol::Mqtt) {
                let mut payload = merge_command_trees([&command]);
                payload.insert(ACK_KEY.to_owned(), Value::String(id.to_string()));
                match pusher.push(device_id, &Value::Object(payload)).await {
                    Ok(true) => {
                        self.store.mark_sent(&[id], Utc::now()).await?;
                        info!(command_id = %id, "command pushed to device");
                    }
                    Ok(false) => {
                        debug!(command_id = %id, "device not reachable, command stays pending");
                    }
                    Err(error) => {
                        warn!(command_id = %id, %error, "command push failed, entry stays pending");
                    }
                }
            }
        }
        Ok(id)
    }

    /// Collects every pending command for the device into one merged
    /// tree, marks the batch sent, and tags it with an `_ack` token
    /// listing the batch ids. `None` when the queue is empty.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn drain_pending(
        &self,
        device_id: &str,
    ) -> DomainResult<Option<(Map<String, Value>, Vec<Uuid>)>> {
        let entries = self.store.pending_for(device_id).await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
        let mut merged = merge_command_trees(entries.iter().map(|e| &e.command));
        self.store.mark_sent(&ids, Utc::now()).await?;
        let token = ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        merged.insert(ACK_KEY.to_owned(), Value::String(token));
        info!(count = ids.len(), "draining pending commands");
        Ok(Some((merged, ids)))
    }

    /// Resolves an acknowledgement token and settles the entries it
    /// names. Unknown ids are ignored; entries move to acknowledged
    /// from any status, since a device can ack faster than the sender
    /// records the send.
    #[instrument(skip(self, token))]
    pub async fn acknowledge(&self, token: &str) -> DomainResult<Vec<Uuid>> {
        let ids = parse_ack_token(token);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let acked = self.store.mark_acknowledged(&ids, Utc::now()).await?;
        if !acked.is_empty() {
            info!(count = acked.len(), "commands acknowledged");
        }
        Ok(acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCommandStore;
    use crate::store::MockCommandPusher;
    use serde_json::json;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn plain_token_parses_comma_separated_ids() {
        let a = uuid(1);
        let b = uuid(2);
        let token = format!(" {a} , {b} ");
        assert_eq!(parse_ack_token(&token), vec![a, b]);
    }

    #[test]
    fn json_wrapped_token_unwraps_ack_member() {
        let a = uuid(3);
        let b = uuid(4);
        let token = format!(r#"{{"_ack": "{a},{b}"}}"#);
        assert_eq!(parse_ack_token(&token), vec![a, b]);
    }

    #[test]
    fn control_characters_and_garbage_are_dropped() {
        let a = uuid(5);
        let token = format!("{a}\0,not-a-uuid,,\u{1},");
        assert_eq!(parse_ack_token(&token), vec![a]);
    }

    #[test]
    fn json_token_without_ack_member_is_parsed_raw() {
        assert!(parse_ack_token(r#"{"other": 1}"#).is_empty());
        let a = uuid(6);
        // Unparseable JSON falls back to the raw comma form too.
        let token = format!("{{broken {a}");
        assert!(parse_ack_token(&token).is_empty());
    }

    #[test]
    fn merge_unions_subdevices_and_newest_wins() {
        let older = json!({"fan": {"speed": 1}, "light": {"on": true}});
        let newer = json!({"fan": {"speed": 3}});
        let merged = merge_command_trees([&older, &newer]);
        assert_eq!(
            Value::Object(merged),
            json!({"fan": {"speed": 3}, "light": {"on": true}})
        );
    }

    #[test]
    fn merge_skips_non_object_trees() {
        let tree = json!({"fan": {"speed": 1}});
        let junk = json!("halt");
        let merged = merge_command_trees([&tree, &junk]);
        assert_eq!(Value::Object(merged), json!({"fan": {"speed": 1}}));
    }

    fn queue_without_pusher() -> (CommandQueue, Arc<InMemoryCommandStore>) {
        let store = Arc::new(InMemoryCommandStore::new());
        let snapshots = Arc::new(SnapshotCache::new());
        (CommandQueue::new(store.clone(), snapshots), store)
    }

    #[tokio::test]
    async fn drain_merges_marks_sent_and_tags_ack() {
        let (queue, store) = queue_without_pusher();
        let first = queue
            .enqueue("d", json!({"fan": {"speed": 1}}))
            .await
            .unwrap();
        let second = queue
            .enqueue("d", json!({"light": {"on": true}}))
            .await
            .unwrap();

        let (tree, ids) = queue.drain_pending("d").await.unwrap().unwrap();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(tree["fan"], json!({"speed": 1}));
        assert_eq!(tree["light"], json!({"on": true}));
        assert_eq!(
            tree[ACK_KEY],
            Value::String(format!("{first},{second}"))
        );
        assert_eq!(
            store.status_of(first).await.unwrap(),
            Some(CommandStatus::Sent)
        );

        // Nothing left to drain.
        assert!(queue.drain_pending("d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acknowledge_settles_entries_from_any_status() {
        let (queue, store) = queue_without_pusher();
        let sent = queue.enqueue("d", json!({"fan": {"speed": 1}})).await.unwrap();
        queue.drain_pending("d").await.unwrap();
        let still_pending = queue
            .enqueue("d", json!({"light": {"on": false}}))
            .await
            .unwrap();

        let token = format!("{sent},{still_pending}");
        let mut acked = queue.acknowledge(&token).await.unwrap();
        acked.sort();
        let mut expected = vec![sent, still_pending];
        expected.sort();
        assert_eq!(acked, expected);
        assert_eq!(
            store.status_of(sent).await.unwrap(),
            Some(CommandStatus::Acknowledged)
        );
        assert_eq!(
            store.status_of(still_pending).await.unwrap(),
            Some(CommandStatus::Acknowledged)
        );
    }

    #[tokio::test]
    async fn acknowledge_with_unknown_ids_matches_nothing() {
        let (queue, _) = queue_without_pusher();
        let acked = queue.acknowledge(&uuid(9).to_string()).await.unwrap();
        assert!(acked.is_empty());
        assert!(queue.acknowledge("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_pushes_immediately_to_mqtt_devices() {
        let store = Arc::new(InMemoryCommandStore::new());
        let snapshots = Arc::new(SnapshotCache::new());
        snapshots
            .record("d", json!({"deviceId": "d"}), Protocol::Mqtt)
            .await;

        let mut pusher = MockCommandPusher::new();
        pusher
            .expect_push()
            .withf(|device_id, payload| {
                device_id == "d"
                    && payload["fan"] == json!({"speed": 2})
                    && payload[ACK_KEY].is_string()
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let queue =
            CommandQueue::new(store.clone(), snapshots).with_pusher(Arc::new(pusher));
        let id = queue.enqueue("d", json!({"fan": {"speed": 2}})).await.unwrap();
        assert_eq!(
            store.status_of(id).await.unwrap(),
            Some(CommandStatus::Sent)
        );
    }

    #[tokio::test]
    async fn failed_push_leaves_entry_pending() {
        let store = Arc::new(InMemoryCommandStore::new());
        let snapshots = Arc::new(SnapshotCache::new());
        snapshots
            .record("d", json!({"deviceId": "d"}), Protocol::Mqtt)
            .await;

        let mut pusher = MockCommandPusher::new();
        pusher.expect_push().times(1).returning(|_, _| Ok(false));

        let queue =
            CommandQueue::new(store.clone(), snapshots).with_pusher(Arc::new(pusher));
        let id = queue.enqueue("d", json!({"fan": {"speed": 2}})).await.unwrap();
        assert_eq!(
            store.status_of(id).await.unwrap(),
            Some(CommandStatus::Pending)
        );
    }

    #[tokio::test]
    async fn http_devices_are_never_pushed() {
        let store = Arc::new(InMemoryCommandStore::new());
        let snapshots = Arc::new(SnapshotCache::new());
        snapshots
            .record("d", json!({"deviceId": "d"}), Protocol::Http)
            .await;

        let mut pusher = MockCommandPusher::new();
        pusher.expect_push().times(0);

        let queue = CommandQueue::new(store, snapshots).with_pusher(Arc::new(pusher));
        queue.enqueue("d", json!({"fan": {"speed": 2}})).await.unwrap();
    }
}
