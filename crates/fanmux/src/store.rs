use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::Conversation;
use crate::errors::StoreError;
use crate::model::ProviderId;

/// Current on-disk schema tag.
const SCHEMA_VERSION: u64 = 2;

/// Timestamp substituted when a legacy record predates timestamping.
const EPOCH: &str = "1970-01-01T00:00:00Z";

/// Listing entry for one stored conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub name: String,
    pub turn_count: usize,
    pub providers: Vec<ProviderId>,
    pub updated_at: DateTime<Utc>,
}

/// Filesystem-backed conversation state: one JSON document per conversation.
///
/// Records are loaded and saved as whole units, never patched in place.
/// `load` runs the legacy-shape migration chain, so a recognized record of
/// any age deserializes into the current [`Conversation`]; an unrecognized
/// one is reported as unreadable and can be treated as absent by the caller.
pub struct ConversationStore {
    root: PathBuf,
}

impl ConversationStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Returns the directory this store persists into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Loads one conversation, migrating legacy shapes to the current one.
    ///
    /// `Ok(None)` when no record exists; `StoreError::Unrecognized` when a
    /// record exists but matches no known shape.
    pub fn load(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let path = self.path_for(id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| StoreError::unrecognized(id, format!("not valid JSON: {e}")))?;
        migrate::to_current(id, value).map(Some)
    }

    /// Loads a conversation, falling back to a fresh one when the record is
    /// missing or unreadable. Unreadable records are left on disk untouched.
    pub fn load_or_new(&self, id: Uuid, name: &str) -> Conversation {
        match self.load(id) {
            Ok(Some(conversation)) => conversation,
            Ok(None) => Conversation::with_id(id, name),
            Err(err) => {
                warn!(conversation_id = %id, error = %err, "conversation unreadable, starting fresh");
                Conversation::with_id(id, name)
            }
        }
    }

    /// Saves one conversation atomically (write-new then rename).
    pub fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut value = serde_json::to_value(conversation)?;
        if let Value::Object(map) = &mut value {
            map.insert("schema".into(), Value::from(SCHEMA_VERSION));
        }
        let body = serde_json::to_string_pretty(&value)?;
        let path = self.path_for(conversation.id);
        let tmp = self.root.join(format!("{}.json.tmp", conversation.id));
        fs::write(&tmp, body).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        debug!(conversation_id = %conversation.id, turns = conversation.turn_count(), "conversation saved");
        Ok(())
    }

    /// Deletes one conversation. Returns false when no record existed.
    ///
    /// This is the only way a conversation is ever destroyed.
    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Lists stored conversations. Unreadable records are skipped with a
    /// warning rather than failing the whole listing.
    pub fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match self.load(id) {
                Ok(Some(c)) => summaries.push(ConversationSummary {
                    id: c.id,
                    name: c.name,
                    turn_count: c.shared_user_turns.len(),
                    providers: c.responses.keys().cloned().collect(),
                    updated_at: c.updated_at,
                }),
                Ok(None) => {}
                Err(err) => {
                    warn!(conversation_id = %id, error = %err, "skipping unreadable conversation")
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

/// Order-dependent chain of pure structural transforms.
///
/// Two legacy shapes are recognized besides the current one:
/// a flat interleaved transcript (each message tagged with a role and, for
/// assistant messages, the provider that wrote it), and an intermediate
/// shape whose per-provider responses were plain strings with no reasoning
/// trace. The chain is idempotent: current-shape input passes through both
/// steps unchanged.
pub(crate) mod migrate {
    use super::*;
    use serde_json::{Map, json};

    pub(crate) fn to_current(id: Uuid, mut value: Value) -> Result<Conversation, StoreError> {
        if is_flat_transcript(&value) {
            value = lift_flat_transcript(value);
        }
        if has_plain_responses(&value) {
            value = lift_plain_responses(value);
        }
        let value = finalize(value);
        serde_json::from_value(value)
            .map_err(|e| StoreError::unrecognized(id, format!("no recognized shape: {e}")))
    }

    fn is_flat_transcript(value: &Value) -> bool {
        value.get("messages").is_some_and(Value::is_array)
    }

    fn has_plain_responses(value: &Value) -> bool {
        value
            .get("responses")
            .and_then(Value::as_object)
            .is_some_and(|map| {
                map.values().any(|column| {
                    column
                        .as_array()
                        .is_some_and(|entries| entries.iter().any(Value::is_string))
                })
            })
    }

    /// Oldest shape -> intermediate shape: replay the interleaved transcript,
    /// splitting it into shared user turns and per-provider answer columns.
    /// Assistant messages are attributed through their `provider` tag; ones
    /// with no tag or no preceding user turn are dropped.
    pub(crate) fn lift_flat_transcript(value: Value) -> Value {
        let Value::Object(mut map) = value else {
            return value;
        };
        let messages = match map.remove("messages") {
            Some(Value::Array(messages)) => messages,
            other => {
                if let Some(other) = other {
                    map.insert("messages".into(), other);
                }
                return Value::Object(map);
            }
        };

        let mut turns: Vec<Value> = Vec::new();
        let mut responses: Map<String, Value> = Map::new();
        let mut system_prompt = map.get("system_prompt").cloned().filter(|v| !v.is_null());
        for message in &messages {
            let role = message.get("role").and_then(Value::as_str);
            let text = message
                .get("text")
                .or_else(|| message.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            match role {
                Some("system") => {
                    if system_prompt.is_none() {
                        system_prompt = Some(Value::from(text));
                    }
                }
                Some("user") => turns.push(Value::from(text)),
                Some("assistant") => {
                    let Some(provider) = message.get("provider").and_then(Value::as_str) else {
                        continue;
                    };
                    if turns.is_empty() {
                        continue;
                    }
                    let column = responses
                        .entry(provider.to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(column) = column {
                        // Pad up to the turn being answered, then record it.
                        while column.len() < turns.len() - 1 {
                            column.push(Value::from(""));
                        }
                        if column.len() < turns.len() {
                            column.push(Value::from(text));
                        }
                    }
                }
                _ => {}
            }
        }

        map.insert("shared_user_turns".into(), Value::Array(turns));
        map.insert("responses".into(), Value::Object(responses));
        if let Some(prompt) = system_prompt {
            map.insert("system_prompt".into(), prompt);
        }
        Value::Object(map)
    }

    /// Intermediate shape -> current shape: wrap each plain response string
    /// into a `{content, thinking}` object with an empty reasoning trace.
    pub(crate) fn lift_plain_responses(value: Value) -> Value {
        let Value::Object(mut map) = value else {
            return value;
        };
        if let Some(Value::Object(responses)) = map.get_mut("responses") {
            for column in responses.values_mut() {
                if let Value::Array(entries) = column {
                    for entry in entries.iter_mut() {
                        if let Value::String(content) = entry {
                            *entry = json!({ "content": std::mem::take(content), "thinking": "" });
                        }
                    }
                }
            }
        }
        Value::Object(map)
    }

    /// Restores the alignment invariant and fills structural defaults so the
    /// result deserializes as a current conversation regardless of which
    /// legacy shape it came from.
    fn finalize(value: Value) -> Value {
        let Value::Object(mut map) = value else {
            return value;
        };
        map.insert("schema".into(), Value::from(SCHEMA_VERSION));
        for key in ["created_at", "updated_at"] {
            let missing = map.get(key).is_none_or(Value::is_null);
            if missing {
                map.insert(key.into(), Value::from(EPOCH));
            }
        }
        map.entry("shared_user_turns")
            .or_insert_with(|| Value::Array(Vec::new()));
        map.entry("responses")
            .or_insert_with(|| Value::Object(Map::new()));
        let turn_count = map
            .get("shared_user_turns")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        if let Some(Value::Object(responses)) = map.get_mut("responses") {
            for column in responses.values_mut() {
                if let Value::Array(entries) = column {
                    while entries.len() < turn_count {
                        entries.push(json!({ "content": "", "thinking": "" }));
                    }
                }
            }
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::PersistedResponse;
    use serde_json::json;
    use std::collections::BTreeMap;

    const CONV_ID: &str = "6e9f9884-3e9b-4f1c-9d34-111111111111";

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConversationStore::open(dir.path().join("state")).expect("open");
        (dir, store)
    }

    fn write_record(store: &ConversationStore, id: &str, value: &Value) {
        let path = store.root().join(format!("{id}.json"));
        fs::write(path, serde_json::to_string(value).expect("json")).expect("write");
    }

    /// The same logical conversation in each recognized shape: two user
    /// turns, providers `openai` and `mistral`, `mistral` silent on the
    /// second turn.
    fn flat_shape() -> Value {
        json!({
            "id": CONV_ID,
            "name": "demo",
            "messages": [
                { "role": "system", "text": "be terse" },
                { "role": "user", "text": "first" },
                { "role": "assistant", "provider": "openai", "text": "one" },
                { "role": "assistant", "provider": "mistral", "text": "uno" },
                { "role": "user", "text": "second" },
                { "role": "assistant", "provider": "openai", "text": "two" },
            ],
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-02T10:00:00Z",
        })
    }

    fn plain_strings_shape() -> Value {
        json!({
            "id": CONV_ID,
            "name": "demo",
            "system_prompt": "be terse",
            "shared_user_turns": ["first", "second"],
            "responses": {
                "openai": ["one", "two"],
                "mistral": ["uno"],
            },
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-02T10:00:00Z",
        })
    }

    fn current_shape() -> Value {
        json!({
            "schema": 2,
            "id": CONV_ID,
            "name": "demo",
            "system_prompt": "be terse",
            "shared_user_turns": ["first", "second"],
            "responses": {
                "openai": [
                    { "content": "one", "thinking": "" },
                    { "content": "two", "thinking": "" },
                ],
                "mistral": [
                    { "content": "uno", "thinking": "" },
                    { "content": "", "thinking": "" },
                ],
            },
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-02T10:00:00Z",
        })
    }

    #[test]
    fn every_recognized_shape_loads_to_the_same_conversation() {
        let (_dir, store) = store();
        let id = Uuid::parse_str(CONV_ID).expect("uuid");
        let mut loaded = Vec::new();
        for shape in [flat_shape(), plain_strings_shape(), current_shape()] {
            write_record(&store, CONV_ID, &shape);
            loaded.push(store.load(id).expect("load").expect("present"));
        }
        assert_eq!(loaded[0], loaded[1]);
        assert_eq!(loaded[1], loaded[2]);
        let conversation = &loaded[0];
        assert!(conversation.is_aligned());
        assert_eq!(conversation.shared_user_turns, vec!["first", "second"]);
        assert_eq!(
            conversation.responses[&ProviderId::new("mistral")][1],
            PersistedResponse::placeholder(),
            "migration restores alignment for the silent provider"
        );
        assert_eq!(conversation.system_prompt.as_deref(), Some("be terse"));
    }

    #[test]
    fn migration_steps_are_pure_and_chain_in_order() {
        let after_flat = migrate::lift_flat_transcript(flat_shape());
        assert_eq!(
            after_flat.get("shared_user_turns"),
            plain_strings_shape().get("shared_user_turns")
        );
        let after_plain = migrate::lift_plain_responses(after_flat);
        assert_eq!(
            after_plain.get("responses").unwrap().get("openai"),
            current_shape().get("responses").unwrap().get("openai"),
        );
    }

    #[test]
    fn migration_is_idempotent_on_current_data() {
        let (_dir, store) = store();
        let id = Uuid::parse_str(CONV_ID).expect("uuid");
        write_record(&store, CONV_ID, &current_shape());
        let first = store.load(id).expect("load").expect("present");
        store.save(&first).expect("save");
        let second = store.load(id).expect("load").expect("present");
        assert_eq!(first, second);
    }

    #[test]
    fn unrecognized_shape_is_unreadable_not_fatal() {
        let (_dir, store) = store();
        let id = Uuid::parse_str(CONV_ID).expect("uuid");
        write_record(&store, CONV_ID, &json!({ "id": CONV_ID, "responses": 42 }));
        let err = store.load(id).expect_err("must not parse");
        assert!(matches!(err, StoreError::Unrecognized { .. }));
        // The facade path: fall back to a fresh conversation.
        let fresh = store.load_or_new(id, "demo");
        assert_eq!(fresh.turn_count(), 0);
    }

    #[test]
    fn save_load_round_trip_preserves_the_record() {
        let (_dir, store) = store();
        let mut conversation = Conversation::new("round-trip");
        conversation.push_turn(
            "ask",
            BTreeMap::from([(
                ProviderId::new("openai"),
                PersistedResponse::new("answer", "chain of thought"),
            )]),
        );
        store.save(&conversation).expect("save");
        let loaded = store
            .load(conversation.id)
            .expect("load")
            .expect("present");
        assert_eq!(loaded, conversation);
        assert_eq!(
            loaded.responses[&ProviderId::new("openai")][0].thinking,
            "chain of thought"
        );
    }

    #[test]
    fn missing_record_is_none_and_delete_reports_absence() {
        let (_dir, store) = store();
        let id = Uuid::new_v4();
        assert!(store.load(id).expect("load").is_none());
        assert!(!store.delete(id).expect("delete"));
        store.save(&Conversation::with_id(id, "gone soon")).expect("save");
        assert!(store.delete(id).expect("delete"));
        assert!(store.load(id).expect("load").is_none());
    }

    #[test]
    fn list_returns_newest_first_and_skips_garbage() {
        let (_dir, store) = store();
        let mut old = Conversation::new("old");
        old.updated_at = "2024-01-01T00:00:00Z".parse().expect("ts");
        let mut new = Conversation::new("new");
        new.updated_at = "2025-01-01T00:00:00Z".parse().expect("ts");
        store.save(&old).expect("save");
        store.save(&new).expect("save");
        let garbage_id = Uuid::new_v4();
        fs::write(store.root().join(format!("{garbage_id}.json")), "{nope")
            .expect("write garbage");
        let listing = store.list().expect("list");
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].name, "new");
        assert_eq!(listing[1].name, "old");
    }
}
