use crate::channel::serve_instance;
use crate::errors::RelayError;
use crate::protocol::RelayRequest;
use crate::relay::Relay;
use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;

/// Routes for caller queries and instance connections.
pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/graphql", post(query_handler))
        .route("/instances", get(instance_handler))
        .with_state(relay)
}

/// Serves the relay on an already bound listener.
pub async fn serve(listener: TcpListener, relay: Relay) -> Result<(), std::io::Error> {
    axum::serve(listener, router(relay)).await
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
    retryable: bool,
}

async fn query_handler(
    State(relay): State<Relay>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let body = Json(ApiErrorResponse {
                error_message: rejection.body_text(),
                retryable: false,
            });
            return (StatusCode::BAD_REQUEST, body).into_response();
        }
    };

    match relay.handle_query(request).await {
        Ok(reply) => (StatusCode::OK, Json::<JsonValue>(reply)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn instance_handler(State(relay): State<Relay>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_instance(socket, relay))
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "Relay query failed");
        }

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
            retryable: self.is_retryable(),
        });

        (status, body).into_response()
    }
}
