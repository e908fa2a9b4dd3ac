use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::gateway::{Gateway, GatewayRequest, GatewayResponse};

type Gateways = Arc<Vec<Arc<Gateway>>>;

/// Router serving every path of every gateway.
///
/// Paths are matched exactly; the first gateway that owns a path handles it.
pub fn router(gateways: Vec<Arc<Gateway>>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(gateways))
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    gateways: Vec<Arc<Gateway>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("gateway listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(gateways))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn dispatch(
    State(gateways): State<Gateways>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let mut request = GatewayRequest::new(method.as_str(), target).with_body(body);
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    let Some(gateway) = gateways.iter().find(|g| g.has_path(&request.path)) else {
        let body = json!({ "message": format!("no route for {}", request.path) });
        return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
    };

    into_response(gateway.handle(request).await)
}

fn into_response(response: GatewayResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = (status, response.body).into_response();
    for (name, value) in response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            http.headers_mut().insert(name, value);
        }
    }
    http
}
