//! Table storage backed by `sled`
//!
//! Layout inside one sled database:
//! - `items`: table key -> JSON item
//! - `changes/<n>`: big-endian sequence number -> JSON `ChangeRecord`, one
//!   tree per partition so iteration yields records in sequence order
//! - `checkpoints`: `<consumer>/<partition>` -> last processed sequence, or
//!   an empty value for a consumer that registered before the partition had
//!   any record
//!
//! Retention mirrors a bounded stream: records older than `max_age` or beyond
//! `max_records_per_partition` are trimmed on write and on read, and nothing
//! can be read from before the oldest retained record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sled::{Db, Tree};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::policy::{Authorizer, Principal, actions, resources};
use crate::table::feed::{ChangeFeedConsumer, ConsumerConfig};
use crate::table::record::{ChangeEventType, ChangeRecord, Item};
use crate::utils::{PipelineError, Result};

/// How long change records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_age: Option<Duration>,
    pub max_records_per_partition: Option<usize>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(24 * 3600)),
            max_records_per_partition: Some(10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableOptions {
    pub partitions: usize,
    pub retention: Retention,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            partitions: 4,
            retention: Retention::default(),
        }
    }
}

struct TableInner {
    name: String,
    db: Db,
    items: Tree,
    segments: Vec<Tree>,
    checkpoints: Tree,
    retention: Retention,
    // serializes mutations so sequence order matches commit order
    write_lock: Mutex<()>,
    latest: watch::Sender<u64>,
    authorizer: Authorizer,
}

/// Handle to a durable table. Clones share the same storage.
#[derive(Clone)]
pub struct DurableTable {
    inner: Arc<TableInner>,
}

impl DurableTable {
    /// Open or create the table's sled database at `path`.
    pub fn open(
        path: &str,
        name: impl Into<String>,
        options: TableOptions,
        authorizer: Authorizer,
    ) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, name.into(), options, authorizer)
    }

    /// A table that lives only as long as the process.
    pub fn temporary(
        name: impl Into<String>,
        options: TableOptions,
        authorizer: Authorizer,
    ) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, name.into(), options, authorizer)
    }

    fn from_db(db: Db, name: String, options: TableOptions, authorizer: Authorizer) -> Result<Self> {
        let partitions = options.partitions.max(1);
        let items = db.open_tree("items")?;
        let checkpoints = db.open_tree("checkpoints")?;
        let segments = (0..partitions)
            .map(|p| db.open_tree(format!("changes/{p}")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut latest = 0;
        for segment in &segments {
            if let Some((key, _)) = segment.last()? {
                latest = latest.max(decode_sequence(&key));
            }
        }
        let (latest, _) = watch::channel(latest);

        Ok(Self {
            inner: Arc::new(TableInner {
                name,
                db,
                items,
                segments,
                checkpoints,
                retention: options.retention,
                write_lock: Mutex::new(()),
                latest,
                authorizer,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn resource(&self) -> String {
        resources::table(&self.inner.name)
    }

    pub fn partitions(&self) -> usize {
        self.inner.segments.len()
    }

    /// Partition a key's change records are written to.
    pub fn partition_for(&self, key: &str) -> usize {
        // FNV-1a, stable across processes so segments survive restarts
        let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
        (hash % self.inner.segments.len() as u64) as usize
    }

    /// Insert or replace an item and append the matching change record.
    pub fn put(&self, key: &str, attributes: Item) -> Result<ChangeRecord> {
        let _guard = self.inner.write_lock.lock();
        let encoded = serde_json::to_vec(&attributes)?;
        let previous = self.inner.items.insert(key.as_bytes(), encoded)?;
        let event_type = if previous.is_some() {
            ChangeEventType::Modify
        } else {
            ChangeEventType::Insert
        };
        self.append_change(key, attributes, event_type)
    }

    /// Delete an item. Returns the `Remove` record, or `None` if the key
    /// did not exist (no record is written then).
    pub fn delete(&self, key: &str) -> Result<Option<ChangeRecord>> {
        let _guard = self.inner.write_lock.lock();
        match self.inner.items.remove(key.as_bytes())? {
            Some(old) => {
                let image: Item = serde_json::from_slice(&old)?;
                self.append_change(key, image, ChangeEventType::Remove)
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Item>> {
        match self.inner.items.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    /// Force buffered writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    /// `put` on behalf of `principal`, which needs `table:PutItem`.
    pub fn put_item(&self, principal: &Principal, key: &str, attributes: Item) -> Result<ChangeRecord> {
        self.inner
            .authorizer
            .check(principal, actions::PUT_ITEM, &self.resource())?;
        self.put(key, attributes)
    }

    /// `delete` on behalf of `principal`, which needs `table:DeleteItem`.
    pub fn delete_item(&self, principal: &Principal, key: &str) -> Result<Option<ChangeRecord>> {
        self.inner
            .authorizer
            .check(principal, actions::DELETE_ITEM, &self.resource())?;
        self.delete(key)
    }

    fn append_change(
        &self,
        key: &str,
        image: Item,
        event_type: ChangeEventType,
    ) -> Result<ChangeRecord> {
        let partition = self.partition_for(key);
        let sequence_number = self.inner.db.generate_id()?;
        let record = ChangeRecord {
            table_key: key.to_string(),
            image,
            sequence_number,
            event_type,
            partition,
            created_at: Utc::now().timestamp_millis(),
        };

        let segment = &self.inner.segments[partition];
        segment.insert(sequence_number.to_be_bytes(), serde_json::to_vec(&record)?)?;
        self.trim(segment)?;

        debug!(
            table = %self.inner.name,
            key,
            partition,
            sequence_number,
            event = ?event_type,
            "change recorded"
        );
        self.inner.latest.send_replace(sequence_number);
        Ok(record)
    }

    /// Read up to `limit` records of a partition that come after `after`
    /// (or from the oldest retained record when `after` is `None`).
    pub fn read_partition(
        &self,
        partition: usize,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let segment = self.segment(partition)?;
        self.trim(segment)?;

        let iter = match after {
            Some(seq) => segment.range(seq.saturating_add(1).to_be_bytes()..),
            None => segment.iter(),
        };

        let mut records = Vec::new();
        for entry in iter.take(limit) {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    /// Highest sequence number currently stored in a partition.
    pub fn latest_sequence(&self, partition: usize) -> Result<Option<u64>> {
        Ok(self
            .segment(partition)?
            .last()?
            .map(|(key, _)| decode_sequence(&key)))
    }

    /// Lowest sequence number still retained in a partition.
    pub fn oldest_sequence(&self, partition: usize) -> Result<Option<u64>> {
        Ok(self
            .segment(partition)?
            .first()?
            .map(|(key, _)| decode_sequence(&key)))
    }

    /// Watch the highest sequence number written so far.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.latest.subscribe()
    }

    /// Register a change feed consumer.
    ///
    /// A consumer that has a stored checkpoint under the same name resumes
    /// from it and ignores `starting_position`.
    pub fn register_consumer(&self, config: ConsumerConfig) -> Result<ChangeFeedConsumer> {
        ChangeFeedConsumer::new(self.clone(), config)
    }

    /// Stored position of `consumer` in `partition`.
    ///
    /// `None` means the consumer never registered. `Some(None)` means it
    /// registered before the partition held any record it had to skip.
    pub(crate) fn load_checkpoint(
        &self,
        consumer: &str,
        partition: usize,
    ) -> Result<Option<Option<u64>>> {
        Ok(self
            .inner
            .checkpoints
            .get(checkpoint_key(consumer, partition))?
            .map(|v| (!v.is_empty()).then(|| decode_sequence(&v))))
    }

    pub(crate) fn store_checkpoint(
        &self,
        consumer: &str,
        partition: usize,
        sequence: Option<u64>,
    ) -> Result<()> {
        let value = sequence.map(|s| s.to_be_bytes().to_vec()).unwrap_or_default();
        self.inner
            .checkpoints
            .insert(checkpoint_key(consumer, partition), value)?;
        Ok(())
    }

    fn segment(&self, partition: usize) -> Result<&Tree> {
        self.inner
            .segments
            .get(partition)
            .ok_or(PipelineError::UnknownPartition {
                partition,
                partitions: self.inner.segments.len(),
            })
    }

    fn trim(&self, segment: &Tree) -> Result<()> {
        if let Some(max) = self.inner.retention.max_records_per_partition {
            let total = segment.len();
            if total > max {
                let excess: Vec<_> = segment
                    .iter()
                    .keys()
                    .take(total - max)
                    .filter_map(|k| k.ok())
                    .collect();
                for key in excess {
                    segment.remove(key)?;
                }
            }
        }

        if let Some(max_age) = self.inner.retention.max_age {
            let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
            let mut expired = Vec::new();
            for entry in segment.iter() {
                let (key, value) = entry?;
                match serde_json::from_slice::<ChangeRecord>(&value) {
                    Ok(record) if record.created_at < cutoff => expired.push(key),
                    Ok(_) => break,
                    Err(e) => {
                        warn!(table = %self.inner.name, "dropping unreadable change record: {e}");
                        expired.push(key);
                    }
                }
            }
            for key in expired {
                segment.remove(key)?;
            }
        }
        Ok(())
    }
}

fn checkpoint_key(consumer: &str, partition: usize) -> String {
    format!("{consumer}/{partition}")
}

fn decode_sequence(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[8 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    u64::from_be_bytes(buf)
}

impl std::fmt::Debug for DurableTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTable")
            .field("name", &self.inner.name)
            .field("db", &"sled::Db")
            .field("partitions", &self.inner.segments.len())
            .finish()
    }
}
