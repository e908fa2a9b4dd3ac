use serde_json::json;

use super::{Event, EventSource};

#[test]
fn test_event_builder_keeps_attributes() {
    let event = Event::new(EventSource::ObjectCreated, "body")
        .with_attribute("key", "notify-lambda/a.txt")
        .with_attribute("bucket", "workspace");

    assert_eq!(event.source(), EventSource::ObjectCreated);
    assert_eq!(event.payload().as_ref(), b"body");
    assert_eq!(event.attribute("key"), Some("notify-lambda/a.txt"));
    assert_eq!(event.attributes().len(), 2);
    assert!(event.attribute("missing").is_none());
}

#[test]
fn test_json_payload() {
    let event = Event::json(EventSource::QueueMessage, &json!({"Records": []})).unwrap();
    assert_eq!(event.payload_json().unwrap(), json!({"Records": []}));
}
