pub mod api;
pub mod channel;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod verifier;

use relay::Relay;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum EgressRouterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] repo_store::StoreError),
}

pub async fn run(config: config::Config) -> Result<(), EgressRouterError> {
    let store = repo_store::get_store(&config.store);
    let relay = Relay::new(store, config.protocol.clone(), config.request_timeout());
    relay.load_known_identities().await?;

    let listener = TcpListener::bind(format!("{}:{}", config.listener.host, config.listener.port)).await?;
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        "Egress router listening"
    );

    let ready_relay = relay.clone();
    let admin_service: AdminService<_, EgressRouterError> =
        AdminService::new(move || ready_relay.is_ready());

    let relay_task = async { api::serve(listener, relay).await.map_err(EgressRouterError::from) };
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(relay_task, admin_task)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::verifier::tests::{sign, test_key};
    use futures_util::{SinkExt, StreamExt};
    use repo_store::{FilesystemRepoStore, RepoStore};
    use serde_json::{Value as JsonValue, json};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    async fn start(relay: Relay) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(api::serve(listener, relay));
        addr
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemRepoStore::new(dir.path()));
        let relay = Relay::new(
            store.clone(),
            ProtocolConfig {
                accepted_versions: vec!["0.0.1".to_string()],
            },
            Duration::from_secs(5),
        );
        let addr = start(relay.clone()).await;
        let client = reqwest::Client::new();
        let graphql = format!("http://{addr}/graphql");

        // Instance connects and registers
        let (key, identity) = test_key(11);
        let (mut instance, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/instances"))
            .await
            .unwrap();
        let register = json!({
            "type": "register",
            "identity": identity,
            "signature": sign(&key, &identity),
            "version": "0.0.1",
        });
        instance
            .send(Message::Text(register.to_string().into()))
            .await
            .unwrap();
        wait_until(|| relay.registry().connected_count() == 1).await;

        // Instance answers the first request it receives
        let responder = tokio::spawn(async move {
            while let Some(Ok(frame)) = instance.next().await {
                let Message::Text(text) = frame else {
                    continue;
                };
                let message: JsonValue = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(message["type"], "request");
                assert_eq!(message["query"], "mutation { createRepo }");
                let reply = json!({
                    "type": "reply",
                    "request_id": message["request_id"],
                    "body": {"data": {"createRepo": {"status": 201, "repoID": "0xdead"}}},
                });
                instance
                    .send(Message::Text(reply.to_string().into()))
                    .await
                    .unwrap();
                return instance;
            }
            panic!("instance connection closed before a request arrived");
        });

        let response = client
            .post(&graphql)
            .json(&json!({
                "identity": identity,
                "operation": {"kind": "create_repo", "owner": "7db9a", "repo": "demo", "contributor_id": "0xc0"},
                "query": "mutation { createRepo }",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(body["data"]["createRepo"]["repoID"], "0xdead");

        let mut instance = responder.await.unwrap();
        assert_eq!(
            store.list_ids(&identity).await.unwrap(),
            vec!["0xdead".to_string()]
        );

        // Store lookups are answered by the relay directly
        let body: JsonValue = client
            .post(&graphql)
            .json(&json!({"operation": {"kind": "find_identity_by_name", "repo_name": "7db9a/demo"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"identity": identity}));

        // Once the instance leaves, its identity is offline
        instance.close(None).await.unwrap();
        wait_until(|| relay.registry().connected_count() == 0).await;

        let response = client
            .post(&graphql)
            .json(&json!({"identity": identity, "query": "{ getRepo }"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn test_version_mismatch_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(
            Arc::new(FilesystemRepoStore::new(dir.path())),
            ProtocolConfig {
                accepted_versions: vec!["0.0.1".to_string()],
            },
            Duration::from_secs(5),
        );
        let addr = start(relay.clone()).await;

        let (key, identity) = test_key(12);
        let (mut instance, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/instances"))
            .await
            .unwrap();
        let register = json!({
            "type": "register",
            "identity": identity,
            "signature": sign(&key, &identity),
            "version": "v0",
        });
        instance
            .send(Message::Text(register.to_string().into()))
            .await
            .unwrap();

        let notice = loop {
            match instance.next().await {
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str::<JsonValue>(text.as_str()).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("expected a version notice, got {other:?}"),
            }
        };
        assert_eq!(notice["type"], "version_mismatch");
        assert_eq!(notice["suggested_version"], "0.0.1");

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/graphql"))
            .json(&json!({"identity": identity, "query": "{ getRepo }"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 409);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_malformed_query() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(
            Arc::new(FilesystemRepoStore::new(dir.path())),
            ProtocolConfig {
                accepted_versions: vec!["0.0.1".to_string()],
            },
            Duration::from_secs(5),
        );
        let addr = start(relay).await;
        let graphql = format!("http://{addr}/graphql");
        let client = reqwest::Client::new();

        let response = client
            .post(&graphql)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        // Forwarded operations need a target
        let response = client
            .post(&graphql)
            .json(&json!({"query": "{ getRepo }"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(body["retryable"], false);
    }
}
