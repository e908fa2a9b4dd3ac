use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use super::router;
use crate::function::ComputeFunction;
use crate::function::builtin::BooksApi;
use crate::gateway::{DirectIntegration, Gateway, Integration, QueueBackend};
use crate::policy::{Authorizer, Principal, actions};
use crate::queue::MessageQueue;

fn app(auth: &Authorizer, queue: &MessageQueue) -> axum::Router {
    let books = Gateway::builder("books", auth.clone())
        .route(
            "GET",
            "/books",
            Integration::compute(Arc::new(ComputeFunction::new("books_api", Arc::new(BooksApi)))),
        )
        .build();

    let role = Principal::new("role/gateway-sqs");
    auth.grant(&role, actions::SEND_MESSAGE, queue.resource());
    let direct = DirectIntegration::new(
        Arc::new(QueueBackend::new(queue.clone())),
        role,
        r#"Action=SendMessage&MessageBody=$util.urlEncode("$method.request.querystring.message")"#,
    )
    .response_template(200, r#"{"done": true}"#);
    let ingest = Gateway::builder("ingest", auth.clone())
        .route("GET", "/queue", Integration::direct(direct))
        .build();

    router(vec![books, ingest])
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_get_queue_over_http() {
    let auth = Authorizer::new();
    let queue = MessageQueue::new("ingest", MessageQueue::DEFAULT_VISIBILITY_TIMEOUT, auth.clone());

    let response = app(&auth, &queue)
        .oneshot(
            Request::builder()
                .uri("/queue?message=Hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, r#"{"done": true}"#);
    let batch = queue.receive_batch(1, Duration::ZERO).await;
    assert_eq!(batch.items[0].body_text(), "Hello");
}

#[tokio::test]
async fn test_get_books_over_http_keeps_cors_headers() {
    let auth = Authorizer::new();
    let queue = MessageQueue::new("ingest", MessageQueue::DEFAULT_VISIBILITY_TIMEOUT, auth.clone());

    let response = app(&auth, &queue)
        .oneshot(Request::builder().uri("/books").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-methods"],
        "OPTIONS,GET"
    );
    assert!(body_text(response).await.contains("Hello lambda api gateway"));
}

#[tokio::test]
async fn test_unknown_path_and_method_over_http() {
    let auth = Authorizer::new();
    let queue = MessageQueue::new("ingest", MessageQueue::DEFAULT_VISIBILITY_TIMEOUT, auth.clone());

    let response = app(&auth, &queue)
        .oneshot(Request::builder().uri("/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(&auth, &queue)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/books")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
