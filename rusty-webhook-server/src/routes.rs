use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, MethodRouter};
use axum::{Json, Router};
use rusty_webhook_api::api::{EndpointSpec, ErrorResponse, HEALTH_PATH, TOKEN_FIELD};
use tower_http::trace::TraceLayer;

use crate::config::ConfigSnapshot;
use crate::process::{self, ExecutionFailure};

/// Form bodies larger than this are rejected.
const MAX_FORM_SIZE: usize = 10 << 20;

/// Builds the router of one generation: every configured endpoint plus the health check.
pub fn routes(snapshot: ConfigSnapshot) -> Router {
    let mut router = Router::new();
    for (endpoint, spec) in snapshot {
        log::debug!(
            endpoint = endpoint.as_str(), asynchronous = spec.asynchronous;
            "binding endpoint"
        );
        router = router.route(&endpoint, bind(spec));
    }
    router
        .route(HEALTH_PATH, any(|| async {}))
        .layer(TraceLayer::new_for_http())
}

/// Creates the handler for a single endpoint, owning its spec.
pub fn bind(spec: EndpointSpec) -> MethodRouter {
    let spec = Arc::new(spec);
    any(move |request: Request| {
        let spec = Arc::clone(&spec);
        async move { handle(&spec, request).await }
    })
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid method")]
    Method,
    #[error("{0}")]
    Form(String),
    #[error("Missing argument: {name}")]
    MissingArgument { name: String },
    #[error(transparent)]
    Execution(ExecutionFailure),
}

impl RequestError {
    fn status(&self) -> StatusCode {
        match self {
            RequestError::Method => StatusCode::METHOD_NOT_ALLOWED,
            RequestError::Form(_) | RequestError::MissingArgument { .. } => StatusCode::BAD_REQUEST,
            RequestError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = ErrorResponse::new(self.to_string());
        match self {
            // Output of the commands that already ran stays in front of the error.
            RequestError::Execution(ExecutionFailure { output, .. }) if !output.is_empty() => {
                let mut body = output;
                body.extend(serde_json::to_vec(&error).unwrap_or_default());
                (
                    status,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    body,
                )
                    .into_response()
            }
            _ => (status, Json(error)).into_response(),
        }
    }
}

async fn handle(spec: &EndpointSpec, request: Request) -> Response {
    let id = fastrand::u64(..);
    log::info!(
        id, method = request.method().as_str(), path = request.uri().path();
        "received call"
    );

    match process_request(id, spec, request).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!(id, status = e.status().as_u16(); "{e}");
            e.into_response()
        }
    }
}

async fn process_request(
    id: u64,
    spec: &EndpointSpec,
    request: Request,
) -> Result<Response, RequestError> {
    if request.method() != Method::POST {
        return Err(RequestError::Method);
    }

    let form = FormFields::parse(request).await?;

    // A wrong token gets the same empty answer as a call that ran.
    let token = form.get(TOKEN_FIELD).unwrap_or_default();
    if token != spec.token {
        log::warn!(id; "Invalid token! '{token}'");
        return Ok(StatusCode::OK.into_response());
    }

    let values = spec
        .args
        .iter()
        .map(|name| match form.get(name) {
            Some(value) if !value.is_empty() => Ok(value.to_owned()),
            _ => Err(RequestError::MissingArgument { name: name.clone() }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    log::debug!(id; "arguments: {values:?}");

    if spec.asynchronous {
        process::dispatch(id, spec.commands.clone(), values);
        return Ok(StatusCode::OK.into_response());
    }

    let output = process::execute(id, &spec.commands, &values)
        .await
        .map_err(RequestError::Execution)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
        .into_response())
}

/// Form fields of a call, from the url encoded body first and then the query.
struct FormFields(Vec<(String, String)>);

impl FormFields {
    async fn parse(request: Request) -> Result<Self, RequestError> {
        let (parts, body) = request.into_parts();
        let mut fields = if is_url_encoded(&parts.headers) {
            Self::decode_body(body).await?
        } else {
            Vec::new()
        };
        if let Some(query) = parts.uri.query() {
            let query: Vec<(String, String)> = serde_urlencoded::from_str(query)
                .map_err(|e| RequestError::Form(e.to_string()))?;
            fields.extend(query);
        }
        Ok(Self(fields))
    }

    async fn decode_body(body: Body) -> Result<Vec<(String, String)>, RequestError> {
        let bytes = axum::body::to_bytes(body, MAX_FORM_SIZE)
            .await
            .map_err(|e| RequestError::Form(e.to_string()))?;
        serde_urlencoded::from_bytes(&bytes).map_err(|e| RequestError::Form(e.to_string()))
    }

    /// The first value of `name`.
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn is_url_encoded(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| {
            mime.trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
}
