//! Durable cache tier backed by Redis.
//!
//! Each record is stored as one JSON document under its key, optionally namespaced. Redis
//! failures are logged and reported as misses: the tier never fails a store transaction.

use std::collections::HashSet;

use parking_lot::Mutex;
use redis::Commands;
use redis::Connection;
use redis::ErrorKind;
use redis::FromRedisValue;
use redis::RedisError;
use redis::RedisResult;

use super::CacheHeaders;
use super::NormalizedCache;
use crate::record::Record;
use crate::record::RecordFieldKey;

/// A record as read from Redis.
#[derive(Clone, Debug)]
struct RedisRecord(Record);

impl FromRedisValue for RedisRecord {
    fn from_redis_value(v: &redis::Value) -> RedisResult<Self> {
        match v {
            redis::Value::BulkString(data) => {
                serde_json::from_slice(data).map(RedisRecord).map_err(|e| {
                    RedisError::from((
                        ErrorKind::TypeError,
                        "can't deserialize from JSON",
                        e.to_string(),
                    ))
                })
            }
            res => Err(RedisError::from((
                ErrorKind::TypeError,
                "the data is the wrong type",
                format!("{res:?}"),
            ))),
        }
    }
}

/// A [`NormalizedCache`] storing records in Redis.
pub struct RedisNormalizedCache {
    client: redis::Client,
    connection: Mutex<Option<Connection>>,
    namespace: Option<String>,
}

impl RedisNormalizedCache {
    /// Does not connect: the connection is opened on first use and reopened after I/O errors.
    pub fn new(url: &str, namespace: Option<String>) -> Result<Self, RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connection: Mutex::new(None),
            namespace,
        })
    }

    fn namespaced_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}:{key}"),
            None => key.to_string(),
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Option<T> {
        let mut guard = self.connection.lock();
        if guard.is_none() {
            match self.client.get_connection() {
                Ok(connection) => {
                    tracing::trace!("redis connection established");
                    *guard = Some(connection);
                }
                Err(e) => {
                    tracing::error!("could not connect to redis: {e}");
                    return None;
                }
            }
        }
        let connection = guard.as_mut()?;
        match f(connection) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("redis command failed: {e}");
                if e.is_io_error() || e.is_connection_dropped() {
                    *guard = None;
                }
                None
            }
        }
    }

    fn write_record(&self, record: &Record) -> bool {
        let payload = match serde_json::to_vec(record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("could not serialize record '{}': {e}", record.key());
                return false;
            }
        };
        let key = self.namespaced_key(record.key());
        self.with_connection(|connection| connection.set::<_, _, ()>(key, payload))
            .is_some()
    }
}

impl NormalizedCache for RedisNormalizedCache {
    fn load_record(&self, key: &str, _headers: &CacheHeaders) -> Option<Record> {
        let redis_key = self.namespaced_key(key);
        tracing::trace!("getting from redis: {redis_key}");
        self.with_connection(|connection| connection.get::<_, Option<RedisRecord>>(redis_key))
            .flatten()
            .map(|RedisRecord(record)| record)
    }

    fn load_records(&self, keys: &[String], headers: &CacheHeaders) -> Vec<Record> {
        if keys.len() < 2 {
            return keys
                .iter()
                .filter_map(|key| self.load_record(key, headers))
                .collect();
        }
        let redis_keys: Vec<String> = keys.iter().map(|key| self.namespaced_key(key)).collect();
        self.with_connection(|connection| {
            connection.mget::<_, Vec<Option<RedisRecord>>>(redis_keys)
        })
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .map(|RedisRecord(record)| record)
        .collect()
    }

    fn merge(&self, record: Record, headers: &CacheHeaders) -> HashSet<RecordFieldKey> {
        let (merged, changed) = match self.load_record(record.key(), headers) {
            Some(mut existing) => {
                let changed = existing.merge_with(&record);
                (existing, changed)
            }
            None => {
                let changed = record.field_keys();
                (record, changed)
            }
        };
        if changed.is_empty() || !self.write_record(&merged) {
            return HashSet::new();
        }
        changed
    }

    fn clear_all(&self) {
        match &self.namespace {
            Some(namespace) => {
                let pattern = format!("{namespace}:*");
                self.with_connection(|connection| {
                    let keys: Vec<String> = connection.scan_match(&pattern)?.collect();
                    if keys.is_empty() {
                        return Ok(());
                    }
                    connection.del::<_, ()>(keys)
                });
            }
            None => {
                self.with_connection(|connection| redis::cmd("FLUSHDB").query::<()>(connection));
            }
        }
    }

    fn remove(&self, key: &str, cascade: bool) -> bool {
        let mut removed = false;
        let mut pending = vec![key.to_string()];
        let mut visited = HashSet::new();
        while let Some(key) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if cascade {
                if let Some(record) = self.load_record(&key, &CacheHeaders::none()) {
                    pending.extend(record.references().iter().map(|r| r.key().to_string()));
                }
            }
            let redis_key = self.namespaced_key(&key);
            let deleted = self
                .with_connection(|connection| connection.del::<_, usize>(redis_key))
                .unwrap_or_default();
            removed |= deleted > 0;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CacheReference;

    #[test]
    fn keys_are_namespaced() {
        let cache =
            RedisNormalizedCache::new("redis://127.0.0.1:6379", Some("apollo".into())).unwrap();
        assert_eq!(cache.namespaced_key("Character:1000"), "apollo:Character:1000");
        let cache = RedisNormalizedCache::new("redis://127.0.0.1:6379", None).unwrap();
        assert_eq!(cache.namespaced_key("QUERY_ROOT"), "QUERY_ROOT");
    }

    #[test]
    fn records_are_decoded_from_json() {
        let record = Record::builder("Character:1000")
            .add_field("bestFriend", CacheReference::new("Character:1002"))
            .build();
        let payload = serde_json::to_vec(&record).unwrap();
        let decoded = RedisRecord::from_redis_value(&redis::Value::BulkString(payload)).unwrap();
        assert_eq!(decoded.0, record);

        assert!(RedisRecord::from_redis_value(&redis::Value::Int(3)).is_err());
        assert!(
            RedisRecord::from_redis_value(&redis::Value::BulkString(b"not json".to_vec()))
                .is_err()
        );
    }

    #[test]
    fn unreachable_servers_behave_as_misses() {
        let cache = RedisNormalizedCache::new("redis://127.0.0.1:1", None).unwrap();
        let headers = CacheHeaders::none();
        assert!(cache.load_record("a", &headers).is_none());
        assert!(
            cache
                .merge(Record::builder("a").add_field("x", 1_i64).build(), &headers)
                .is_empty()
        );
        assert!(!cache.remove("a", true));
    }

    #[test]
    #[ignore = "needs a redis server on localhost"]
    fn round_trips_through_redis() {
        let cache = RedisNormalizedCache::new(
            "redis://127.0.0.1:6379",
            Some(format!("test-{}", uuid::Uuid::new_v4())),
        )
        .unwrap();
        let headers = CacheHeaders::none();
        let luke = Record::builder("Character:1000")
            .add_field("name", "Luke")
            .add_field("bestFriend", CacheReference::new("Character:1002"))
            .build();
        let han = Record::builder("Character:1002").add_field("name", "Han").build();

        assert_eq!(cache.merge(luke.clone(), &headers).len(), 2);
        assert!(cache.merge(luke.clone(), &headers).is_empty());
        cache.merge(han, &headers);

        let loaded = cache.load_records(
            &["Character:1000".to_string(), "Character:1002".to_string()],
            &headers,
        );
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], luke);

        assert!(cache.remove("Character:1000", true));
        assert!(cache.load_record("Character:1002", &headers).is_none());
        cache.clear_all();
    }
}
