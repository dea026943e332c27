use crate::config::ProtocolConfig;
use crate::errors::{RegistrationError, RelayError, Result, UnresolvedReason};
use crate::metrics_defs::{REGISTRATIONS, REQUEST_DURATION, REQUESTS};
use crate::pending::{PendingRequests, ReplyError, RequestId};
use crate::protocol::{Operation, Registration, RelayMessage, RelayRequest, created_repo};
use crate::registry::{ConnectionHandle, Registry};
use crate::verifier;
use repo_store::{AppendOutcome, Identity, RepoRecord, RepoStore, StoreError, is_record_field};
use serde_json::{Value as JsonValue, json};
use shared::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Routes caller queries to instances and handles everything instances send back.
///
/// Cheap to clone; all clones share the same registry, pending table and store.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: Registry,
    pending: Arc<PendingRequests>,
    store: Arc<dyn RepoStore>,
    protocol: ProtocolConfig,
    request_timeout: Duration,
    ready: AtomicBool,
}

impl Relay {
    pub fn new(
        store: Arc<dyn RepoStore>,
        protocol: ProtocolConfig,
        request_timeout: Duration,
    ) -> Self {
        Relay {
            inner: Arc::new(RelayInner {
                registry: Registry::new(),
                pending: Arc::new(PendingRequests::new()),
                store,
                protocol,
                request_timeout,
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// Seeds the registry with every identity that has a record, so they resolve as known
    /// but offline until their instance connects. Marks the relay ready.
    pub async fn load_known_identities(&self) -> std::result::Result<usize, StoreError> {
        let identities = self.inner.store.identities().await?;
        let count = identities.len();
        self.inner.registry.add_known(identities);
        self.inner.ready.store(true, Ordering::Relaxed);
        tracing::info!(count, "Loaded known identities");
        Ok(count)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.inner.pending
    }

    /// Answers one caller query.
    pub async fn handle_query(&self, request: RelayRequest) -> Result<JsonValue> {
        let started = Instant::now();
        let operation = request.operation.as_str();

        let result = self.dispatch(request).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        counter!(REQUESTS, "operation" => operation, "outcome" => outcome).increment(1);
        histogram!(REQUEST_DURATION, "operation" => operation, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn dispatch(&self, request: RelayRequest) -> Result<JsonValue> {
        let store = &self.inner.store;

        match request.operation {
            Operation::FindIdentityByName { repo_name } => Ok(json!({
                "identity": store.find_identity_by_name(&repo_name).await?
            })),
            Operation::FindIdentityById { repo_id } => Ok(json!({
                "identity": store.find_identity_by_id(&repo_id).await?
            })),
            Operation::ListRepoNames => {
                let identity = request.identity.ok_or(RelayError::MissingIdentity)?;
                Ok(json!({ "repo_names": store.list_names(&identity).await? }))
            }
            Operation::ListRepoIds => {
                let identity = request.identity.ok_or(RelayError::MissingIdentity)?;
                Ok(json!({ "repo_ids": store.list_ids(&identity).await? }))
            }
            Operation::Forward => {
                let identity = request.identity.ok_or(RelayError::MissingIdentity)?;
                self.forward(&identity, request.query, request.variables)
                    .await
            }
            Operation::CreateRepo {
                owner,
                repo,
                contributor_id,
            } => {
                let identity = request.identity.ok_or(RelayError::MissingIdentity)?;
                let repo_name = format!("{owner}/{repo}");
                // Rejected before forwarding, the name could never be recorded
                if !is_record_field(&owner) || !is_record_field(&repo) {
                    return Err(RelayError::InvalidRepoName(repo_name));
                }
                tracing::debug!(
                    identity = %identity,
                    repo_name = %repo_name,
                    contributor_id = %contributor_id,
                    "Forwarding repository creation"
                );

                let reply = self
                    .forward(&identity, request.query, request.variables)
                    .await?;
                self.record_created_repo(&identity, &repo_name, &reply)
                    .await;
                Ok(reply)
            }
        }
    }

    /// Sends a query to the instance serving `identity` and waits for its correlated reply.
    async fn forward(
        &self,
        identity: &str,
        query: String,
        variables: Option<JsonValue>,
    ) -> Result<JsonValue> {
        if self.inner.registry.is_incompatible(identity) {
            return Err(RelayError::Unresolved {
                identity: identity.to_string(),
                reason: UnresolvedReason::IncompatibleVersion,
            });
        }
        let handle = self.inner.registry.resolve(identity).into_handle(identity)?;

        let reply = self
            .inner
            .pending
            .open(handle.id(), self.inner.request_timeout);
        let request_id = reply.id().clone();
        let message = RelayMessage::Request {
            request_id: request_id.clone(),
            query,
            variables,
        };

        // A stalled connection must not hold the caller past its deadline
        match tokio::time::timeout_at(reply.deadline(), handle.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(RelayError::ChannelClosed(identity.to_string())),
            Err(_elapsed) => return Err(timeout_error(identity, request_id)),
        }

        reply.wait().await.map_err(|e| match e {
            ReplyError::TimedOut => timeout_error(identity, request_id),
            ReplyError::Disconnected => RelayError::Disconnected {
                identity: identity.to_string(),
                request_id,
            },
        })
    }

    /// Appends the repository to the identity's record if the reply reports it as created.
    /// The caller still receives the reply if recording fails.
    async fn record_created_repo(&self, identity: &str, repo_name: &str, reply: &JsonValue) {
        let Some(created) = created_repo(reply) else {
            return;
        };

        if let Some(reported) = created.name.as_deref()
            && reported != repo_name
        {
            tracing::warn!(
                identity,
                requested = repo_name,
                reported,
                "Created repository does not match the request, not recording it"
            );
            return;
        }

        let record = RepoRecord::new(repo_name, created.id);
        match self.inner.store.append(identity, &record).await {
            Ok(AppendOutcome::Appended) => {
                tracing::info!(identity, record = %record, "Recorded created repository");
            }
            Ok(AppendOutcome::AlreadyPresent) => {}
            // The store logs conflicts itself
            Ok(AppendOutcome::Conflict) => {}
            Err(e) => {
                tracing::error!(identity, record = %record, error = %e, "Failed to record created repository");
            }
        }
    }

    /// Handles a registration sent over `handle`. A refused registration leaves the
    /// connection open so the instance can try again.
    pub async fn register(
        &self,
        registration: Registration,
        handle: &ConnectionHandle,
    ) -> std::result::Result<(), RegistrationError> {
        let result = self.try_register(registration, handle).await;

        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.outcome(),
        };
        counter!(REGISTRATIONS, "outcome" => outcome).increment(1);

        result
    }

    async fn try_register(
        &self,
        registration: Registration,
        handle: &ConnectionHandle,
    ) -> std::result::Result<(), RegistrationError> {
        let Registration {
            identity,
            signature,
            version,
            repo_name,
        } = registration;
        let protocol = &self.inner.protocol;

        if !protocol.accepts(&version) {
            let suggested = protocol.latest().to_string();
            self.inner.registry.mark_incompatible(&identity, handle);

            let notice = RelayMessage::VersionMismatch {
                message: format!(
                    "Version {version} is not supported by this relay. Please upgrade to version {suggested}."
                ),
                suggested_version: suggested.clone(),
            };
            if handle.send(notice).await.is_err() {
                tracing::debug!(identity = %identity, "Connection closed before version notice was sent");
            }

            tracing::warn!(
                identity = %identity,
                declared = %version,
                suggested = %suggested,
                "Refusing registration with unsupported version"
            );
            return Err(RegistrationError::IncompatibleVersion {
                declared: version,
                suggested,
            });
        }

        if !verifier::verify(&identity, &signature) {
            tracing::warn!(identity = %identity, "Refusing registration with invalid signature");
            return Err(RegistrationError::BadSignature(identity));
        }

        if let Some(name) = repo_name.as_deref()
            && !name.is_empty()
            && !is_record_field(name)
        {
            tracing::warn!(
                identity = %identity,
                repo_name = name,
                "Refusing registration with invalid repository name"
            );
            return Err(RegistrationError::InvalidRepoName(name.to_string()));
        }

        let is_new = self.inner.store.ensure_record(&identity).await?;
        if is_new && let Some(name) = repo_name.filter(|name| !name.is_empty()) {
            self.inner
                .store
                .append(&identity, &RepoRecord::name_only(name))
                .await?;
        }

        self.inner.registry.register(&identity, handle);
        tracing::info!(identity = %identity, connection = handle.id(), "Instance registered");
        Ok(())
    }

    /// Delivers an instance's reply to the caller waiting on it.
    pub fn handle_reply(&self, request_id: &RequestId, body: JsonValue) -> bool {
        self.inner.pending.complete(request_id, body)
    }

    /// Forgets everything bound to a closed connection and fails the requests still waiting
    /// on it. Returns the identities that went offline.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> Vec<Identity> {
        let released = self.inner.registry.unregister(handle);
        let failed = self.inner.pending.fail_connection(handle.id());

        tracing::info!(
            connection = handle.id(),
            identities = ?released,
            failed_requests = failed,
            "Instance disconnected"
        );
        released
    }
}

fn timeout_error(identity: &str, request_id: RequestId) -> RelayError {
    RelayError::Timeout {
        identity: identity.to_string(),
        request_id,
    }
}
