//! Snapshot schema migration
//!
//! Every migration is a pure, total and idempotent transform over the raw JSON
//! document. Running it over an already migrated document is a no-op.

use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value, json};

use super::CURRENT_SCHEMA_VERSION;
use crate::error::{Error, Result};

/// Snapshot layout written before sessions carried a tracker-neutral id
pub const LEGACY_SCHEMA_VERSION: &str = "2.0";

/// Primary key of a session in the legacy layout
const LEGACY_SESSION_KEY: &str = "linearAgentActivitySessionId";

/// Legacy snapshots only ever came from a single tracker
const LEGACY_TRACKER_ID: &str = "linear";

const LEGACY_STATE_KEYS: [(&str, &str); 3] = [
    ("agentSessions", "sessions"),
    ("agentSessionEntries", "entries"),
    ("childToParentAgentSession", "childToParentMap"),
];

const LEGACY_RESUME_KEYS: [(&str, &str); 4] = [
    ("claudeSessionId", "claude"),
    ("codexSessionId", "codex"),
    ("geminiSessionId", "gemini"),
    ("cursorSessionId", "cursor"),
];

/// Whether a snapshot with this version can be loaded
pub fn is_supported(version: &str) -> bool {
    version == CURRENT_SCHEMA_VERSION || version == LEGACY_SCHEMA_VERSION
}

/// Bring a snapshot document to the current schema version
///
/// Unknown versions (including future ones) are rejected wholesale.
pub fn migrate_document(document: Value) -> Result<Value> {
    let version = document
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match version.as_str() {
        CURRENT_SCHEMA_VERSION => Ok(document),
        LEGACY_SCHEMA_VERSION => {
            let saved_at = document.get("savedAt").cloned().unwrap_or(Value::Null);
            let state = document.get("state").cloned().unwrap_or_else(|| json!({}));
            Ok(json!({
                "version": CURRENT_SCHEMA_VERSION,
                "savedAt": normalize_timestamp(saved_at),
                "state": migrate_state(state),
            }))
        }
        other => Err(Error::UnsupportedSchemaVersion(other.to_string())),
    }
}

/// Migrate the `state` object of a legacy snapshot
pub fn migrate_state(state: Value) -> Value {
    let Value::Object(mut state) = state else {
        return state;
    };

    for (legacy, current) in LEGACY_STATE_KEYS {
        if let Some(value) = state.remove(legacy)
            && !state.contains_key(current)
        {
            state.insert(current.to_string(), value);
        }
    }

    if let Some(Value::Object(sessions)) = state.remove("sessions") {
        let migrated: Map<String, Value> = sessions
            .into_iter()
            .map(|(key, session)| {
                let session = migrate_session(session);
                let key = session
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(key);
                (key, session)
            })
            .collect();
        state.insert("sessions".to_string(), Value::Object(migrated));
    }

    if let Some(Value::Object(entries)) = state.get_mut("entries") {
        for log in entries.values_mut() {
            if let Value::Array(items) = log {
                for entry in items.iter_mut() {
                    migrate_entry(entry);
                }
            }
        }
    }

    Value::Object(state)
}

fn migrate_session(session: Value) -> Value {
    let Value::Object(mut session) = session else {
        return session;
    };

    if let Some(legacy_id) = session.remove(LEGACY_SESSION_KEY) {
        if !session.contains_key("id") {
            session.insert("id".to_string(), legacy_id.clone());
        }
        if !session.contains_key("externalSessionId") {
            session.insert("externalSessionId".to_string(), legacy_id);
        }
    }

    let issue = session.remove("issue");
    if let Some(Value::String(issue_id)) = session.remove("issueId")
        && !session.contains_key("issueContext")
    {
        let identifier = issue
            .as_ref()
            .and_then(|issue| issue.get("identifier"))
            .and_then(Value::as_str)
            .unwrap_or(issue_id.as_str())
            .to_string();
        session.insert(
            "issueContext".to_string(),
            json!({
                "trackerId": LEGACY_TRACKER_ID,
                "workItemId": issue_id,
                "workItemIdentifier": identifier,
            }),
        );
    }
    if let Some(issue) = issue {
        let metadata = session
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.entry("issue").or_insert(issue);
        }
    }

    for (legacy, slot) in LEGACY_RESUME_KEYS {
        let Some(token) = session.remove(legacy) else {
            continue;
        };
        if !token.is_string() {
            continue;
        }
        let tokens = session
            .entry("resumeTokens")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(tokens) = tokens {
            tokens.entry(slot).or_insert(token);
        }
    }

    if let Some(Value::Object(workspace)) = session.get_mut("workspace")
        && let Some(flag) = workspace.remove("isGitWorktree")
        && !workspace.contains_key("isWorktree")
    {
        workspace.insert("isWorktree".to_string(), flag);
    }

    for key in ["createdAt", "updatedAt"] {
        if let Some(value) = session.remove(key) {
            session.insert(key.to_string(), normalize_timestamp(value));
        }
    }

    session
        .entry("type")
        .or_insert_with(|| Value::String("delegated".to_string()));

    let legacy_status = session
        .get("status")
        .and_then(Value::as_str)
        .and_then(|status| match status {
            "pending" | "awaiting-input" | "awaitingInput" => Some("active"),
            "completed" => Some("complete"),
            "failed" => Some("error"),
            _ => None,
        });
    if let Some(status) = legacy_status {
        session.insert("status".to_string(), Value::from(status));
    }

    Value::Object(session)
}

fn migrate_entry(entry: &mut Value) {
    if let Value::Object(entry) = entry
        && let Some(timestamp) = entry.remove("timestamp")
    {
        entry.insert("timestamp".to_string(), normalize_timestamp(timestamp));
    }
}

/// Epoch milliseconds become RFC 3339 strings; anything else is left alone
fn normalize_timestamp(value: Value) -> Value {
    value
        .as_i64()
        .and_then(DateTime::from_timestamp_millis)
        .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_document() -> Value {
        json!({
            "version": "2.0",
            "savedAt": 1_700_000_000_000i64,
            "state": {
                "agentSessions": {
                    "act-1": {
                        "linearAgentActivitySessionId": "act-1",
                        "issueId": "issue-uuid-1",
                        "issue": { "identifier": "ENG-12", "title": "Fix the build" },
                        "status": "active",
                        "workspace": { "path": "/tmp/ws/ENG-12", "isGitWorktree": true },
                        "claudeSessionId": "claude-abc",
                        "createdAt": 1_700_000_000_000i64,
                        "updatedAt": 1_700_000_100_000i64,
                        "metadata": {}
                    }
                },
                "agentSessionEntries": {
                    "act-1": [
                        { "type": "user", "content": "please fix", "timestamp": 1_700_000_000_500i64 }
                    ]
                },
                "childToParentAgentSession": {}
            }
        })
    }

    #[test]
    fn test_legacy_session_is_rekeyed() {
        let migrated = migrate_document(legacy_document()).unwrap();
        let session = &migrated["state"]["sessions"]["act-1"];

        assert_eq!(migrated["version"], CURRENT_SCHEMA_VERSION);
        assert_eq!(session["id"], "act-1");
        assert_eq!(session["externalSessionId"], "act-1");
        assert!(session.get(LEGACY_SESSION_KEY).is_none());
        assert_eq!(session["issueContext"]["trackerId"], "linear");
        assert_eq!(session["issueContext"]["workItemId"], "issue-uuid-1");
        assert_eq!(session["issueContext"]["workItemIdentifier"], "ENG-12");
        assert_eq!(session["metadata"]["issue"]["title"], "Fix the build");
        assert_eq!(session["resumeTokens"]["claude"], "claude-abc");
        assert_eq!(session["workspace"]["isWorktree"], true);
        assert_eq!(session["type"], "delegated");
        assert!(session["createdAt"].is_string());
        assert!(migrated["state"]["entries"]["act-1"][0]["timestamp"].is_string());
    }

    #[test]
    fn test_migrated_state_deserializes() {
        let migrated = migrate_document(legacy_document()).unwrap();
        let snapshot: crate::persistence::PersistedSnapshot = serde_json::from_value(migrated).unwrap();

        let session = &snapshot.state.sessions["act-1"];
        assert_eq!(session.resume_token(), Some("claude-abc"));
        assert_eq!(snapshot.state.entries["act-1"].len(), 1);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let state = legacy_document()["state"].clone();

        let once = migrate_state(state);
        let twice = migrate_state(once.clone());

        assert_eq!(once, twice);
    }

    #[test]
    fn test_issue_identifier_falls_back_to_issue_id() {
        let state = json!({
            "sessions": {
                "a": { "linearAgentActivitySessionId": "a", "issueId": "ISSUE-7",
                       "workspace": { "path": "/w" } }
            }
        });

        let migrated = migrate_state(state);

        assert_eq!(
            migrated["sessions"]["a"]["issueContext"]["workItemIdentifier"],
            "ISSUE-7"
        );
    }

    #[test]
    fn test_unknown_versions_rejected() {
        for version in [json!("4.0"), json!("1.0"), Value::Null] {
            let document = json!({ "version": version, "state": {} });
            assert!(matches!(
                migrate_document(document),
                Err(Error::UnsupportedSchemaVersion(_))
            ));
        }
    }

    #[test]
    fn test_current_version_passes_through() {
        let document = json!({ "version": CURRENT_SCHEMA_VERSION, "savedAt": "x", "state": {} });
        assert_eq!(migrate_document(document.clone()).unwrap(), document);
    }

    #[test]
    fn test_non_object_state_is_left_alone() {
        assert_eq!(migrate_state(json!([1, 2])), json!([1, 2]));
        assert_eq!(migrate_state(Value::Null), Value::Null);
    }
}
