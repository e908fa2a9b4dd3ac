use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{Event, EventSource};
use crate::policy::{Authorizer, Principal, actions, resources};
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub key: String,
    pub body: Bytes,
    pub etag: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Listener {
    prefix: String,
    sender: UnboundedSender<Event>,
}

#[derive(Debug)]
struct StoreInner {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    listeners: RwLock<Vec<Listener>>,
    authorizer: Authorizer,
}

/// Handle to one bucket. Clones share the same objects and listeners.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

impl ObjectStore {
    pub fn new(bucket: impl Into<String>, authorizer: Authorizer) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                bucket: bucket.into(),
                objects: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                authorizer,
            }),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    /// Stream of creation events for keys starting with `prefix`.
    ///
    /// The stream ends when the store is dropped; dropping the receiver
    /// unregisters the listener on the next matching upload.
    pub fn on_create(&self, prefix: impl Into<String>) -> UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let prefix = prefix.into();
        debug!(bucket = %self.inner.bucket, %prefix, "creation listener registered");
        self.inner.listeners.write().push(Listener { prefix, sender });
        receiver
    }

    /// Store an object and notify every listener whose prefix matches.
    pub fn put_object(&self, key: &str, body: impl Into<Bytes>) -> Result<StoredObject> {
        let object = StoredObject {
            key: key.to_string(),
            body: body.into(),
            etag: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
        };
        self.inner
            .objects
            .write()
            .insert(key.to_string(), object.clone());

        let event = Event::json(
            EventSource::ObjectCreated,
            &json!({
                "bucket": self.inner.bucket,
                "key": object.key,
                "size": object.body.len(),
                "etag": object.etag,
                "created_at": object.created_at,
            }),
        )?
        .with_attribute("bucket", self.inner.bucket.clone())
        .with_attribute("key", key);

        let mut listeners = self.inner.listeners.write();
        listeners.retain(|listener| {
            if !key.starts_with(&listener.prefix) {
                return !listener.sender.is_closed();
            }
            match listener.sender.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    warn!(prefix = %listener.prefix, "dropping closed creation listener");
                    false
                }
            }
        });
        debug!(bucket = %self.inner.bucket, key, "object stored");
        Ok(object)
    }

    /// `put_object` on behalf of `principal`, which needs `object:PutObject`
    /// on `bucket/<bucket>/<key>`.
    pub fn put_object_as(
        &self,
        principal: &Principal,
        key: &str,
        body: impl Into<Bytes>,
    ) -> Result<StoredObject> {
        self.inner.authorizer.check(
            principal,
            actions::PUT_OBJECT,
            &resources::object(&self.inner.bucket, key),
        )?;
        self.put_object(key, body)
    }

    pub fn get_object(&self, key: &str) -> Option<StoredObject> {
        self.inner.objects.read().get(key).cloned()
    }

    /// Keys starting with `prefix`, sorted.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
