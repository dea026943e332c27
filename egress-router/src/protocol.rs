//! Message schemas for both sides of the relay: queries submitted by callers and the frames
//! exchanged with instances over their channel.

use crate::pending::RequestId;
use repo_store::Identity;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Frames an instance sends to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceMessage {
    Register(Registration),
    Reply {
        request_id: RequestId,
        body: JsonValue,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub identity: Identity,
    /// Personal-message signature of `identity`, hex encoded.
    pub signature: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
}

/// Frames the relay sends to an instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Request {
        request_id: RequestId,
        query: String,
        variables: Option<JsonValue>,
    },
    VersionMismatch {
        message: String,
        suggested_version: String,
    },
}

/// A query submitted by a caller.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RelayRequest {
    /// Target instance. Required by forwarded operations and the per-identity listings.
    #[serde(default)]
    pub identity: Option<Identity>,
    #[serde(default)]
    pub operation: Operation,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub variables: Option<JsonValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Relay the query verbatim.
    #[default]
    Forward,
    CreateRepo {
        owner: String,
        repo: String,
        contributor_id: String,
    },
    FindIdentityByName {
        repo_name: String,
    },
    FindIdentityById {
        repo_id: String,
    },
    ListRepoNames,
    ListRepoIds,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Forward => "forward",
            Operation::CreateRepo { .. } => "create_repo",
            Operation::FindIdentityByName { .. } => "find_identity_by_name",
            Operation::FindIdentityById { .. } => "find_identity_by_id",
            Operation::ListRepoNames => "list_repo_names",
            Operation::ListRepoIds => "list_repo_ids",
        }
    }
}

/// A repository an instance reports as created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedRepo {
    pub name: Option<String>,
    pub id: String,
}

/// Detects a successful "repository created" reply:
/// `data.createRepo.status == 201` with a non-empty `repoID`.
pub fn created_repo(reply: &JsonValue) -> Option<CreatedRepo> {
    let created = reply.pointer("/data/createRepo")?;
    if created.get("status")?.as_u64()? != 201 {
        return None;
    }

    let id = created
        .get("repoID")
        .or_else(|| created.get("repoId"))?
        .as_str()?;
    if id.is_empty() {
        return None;
    }

    Some(CreatedRepo {
        name: created
            .get("repoName")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        id: id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_messages() {
        let register: InstanceMessage = serde_json::from_value(json!({
            "type": "register",
            "identity": "0xabc",
            "signature": "0x1234",
            "version": "0.0.1",
        }))
        .unwrap();
        assert_eq!(
            register,
            InstanceMessage::Register(Registration {
                identity: "0xabc".into(),
                signature: "0x1234".into(),
                version: "0.0.1".into(),
                repo_name: None,
            })
        );

        let reply: InstanceMessage = serde_json::from_value(json!({
            "type": "reply",
            "request_id": "1700000000000-3",
            "body": {"data": {"ok": true}},
        }))
        .unwrap();
        assert_eq!(
            reply,
            InstanceMessage::Reply {
                request_id: RequestId::from("1700000000000-3"),
                body: json!({"data": {"ok": true}}),
            }
        );

        assert!(serde_json::from_value::<InstanceMessage>(json!({"type": "unknown"})).is_err());
        assert!(serde_json::from_value::<InstanceMessage>(json!({"type": "register"})).is_err());
    }

    #[test]
    fn test_relay_messages() {
        let request = RelayMessage::Request {
            request_id: RequestId::from("1-0"),
            query: "{ getRepo }".into(),
            variables: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"type": "request", "request_id": "1-0", "query": "{ getRepo }", "variables": null})
        );

        let mismatch = RelayMessage::VersionMismatch {
            message: "upgrade".into(),
            suggested_version: "0.0.1".into(),
        };
        assert_eq!(
            serde_json::to_value(&mismatch).unwrap(),
            json!({"type": "version_mismatch", "message": "upgrade", "suggested_version": "0.0.1"})
        );
    }

    #[test]
    fn test_relay_request() {
        let request: RelayRequest =
            serde_json::from_value(json!({"identity": "0xabc", "query": "{ a }"})).unwrap();
        assert_eq!(request.operation, Operation::Forward);
        assert_eq!(request.identity.as_deref(), Some("0xabc"));
        assert_eq!(request.variables, None);

        let request: RelayRequest = serde_json::from_value(json!({
            "identity": "0xabc",
            "operation": {"kind": "create_repo", "owner": "7db9a", "repo": "demo", "contributor_id": "0xc0"},
            "query": "mutation { createRepo }",
            "variables": {"x": 1},
        }))
        .unwrap();
        assert_eq!(
            request.operation,
            Operation::CreateRepo {
                owner: "7db9a".into(),
                repo: "demo".into(),
                contributor_id: "0xc0".into(),
            }
        );

        let request: RelayRequest = serde_json::from_value(json!({
            "operation": {"kind": "find_identity_by_name", "repo_name": "7db9a/demo"},
        }))
        .unwrap();
        assert_eq!(request.identity, None);

        assert!(
            serde_json::from_value::<RelayRequest>(json!({"operation": {"kind": "drop_tables"}}))
                .is_err()
        );
    }

    #[test]
    fn test_created_repo() {
        let reply = json!({"data": {"createRepo": {"status": 201, "repoID": "0xdead", "repoName": "7db9a/demo"}}});
        assert_eq!(
            created_repo(&reply),
            Some(CreatedRepo {
                name: Some("7db9a/demo".into()),
                id: "0xdead".into(),
            })
        );

        let reply = json!({"data": {"createRepo": {"status": 201, "repoId": "0xdead"}}});
        assert_eq!(
            created_repo(&reply),
            Some(CreatedRepo {
                name: None,
                id: "0xdead".into(),
            })
        );

        for reply in [
            json!({"data": {"createRepo": {"status": 403, "repoID": "0xdead"}}}),
            json!({"data": {"createRepo": {"status": 201, "repoID": ""}}}),
            json!({"data": {"createRepo": {"status": 201}}}),
            json!({"data": {"createRepo": {"status": "201", "repoID": "0xdead"}}}),
            json!({"data": {"getRepo": {"status": 201, "repoID": "0xdead"}}}),
            json!({"errors": []}),
        ] {
            assert_eq!(created_repo(&reply), None, "{reply}");
        }
    }
}
