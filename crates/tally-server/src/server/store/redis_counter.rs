use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tally::{ChildKind, CounterKey, CounterStore, Error, Result, SequenceNumber};

const KEY_PREFIX: &str = "tally:";

// Atomic compare-and-raise. Redis runs scripts without interleaving.
const RAISE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local floor = tonumber(ARGV[1])
if floor > current then
    redis.call('SET', KEYS[1], floor)
    return floor
end
return current
"#;

/// Counters held in Redis, one `INCR` key per [`CounterKey`].
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self { conn })
    }
}

fn unavailable(e: redis::RedisError) -> Error {
    Error::unavailable(e.to_string())
}

/// Inverse of [`CounterKey::storage_key`].
fn parse_key(raw: &str) -> Option<CounterKey> {
    let (kind, parent_id) = raw.strip_prefix(KEY_PREFIX)?.split_once(':')?;
    Some(CounterKey::new(
        parent_id.parse().ok()?,
        kind.parse::<ChildKind>().ok()?,
    ))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: CounterKey) -> Result<SequenceNumber> {
        let mut conn = self.conn.clone();
        redis::cmd("INCR")
            .arg(key.storage_key())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn current(&self, key: CounterKey) -> Result<SequenceNumber> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET")
            .arg(key.storage_key())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(value.unwrap_or(0))
    }

    async fn raise_to(&self, key: CounterKey, floor: SequenceNumber) -> Result<SequenceNumber> {
        let mut conn = self.conn.clone();
        redis::cmd("EVAL")
            .arg(RAISE_SCRIPT)
            .arg(1)
            .arg(key.storage_key())
            .arg(floor)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn snapshot(&self) -> Result<Vec<(CounterKey, SequenceNumber)>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut counters = Vec::new();

        loop {
            let (next, raw_keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            let keys: Vec<(String, CounterKey)> = raw_keys
                .into_iter()
                .filter_map(|raw| parse_key(&raw).map(|key| (raw, key)))
                .collect();

            if !keys.is_empty() {
                let values: Vec<Option<i64>> = redis::cmd("MGET")
                    .arg(keys.iter().map(|(raw, _)| raw.as_str()).collect::<Vec<_>>())
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                counters.extend(
                    keys.into_iter()
                        .zip(values)
                        .filter_map(|((_, key), value)| value.map(|v| (key, v))),
                );
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        counters.sort_unstable_by_key(|(key, _)| *key);
        counters.dedup_by_key(|(key, _)| *key);
        Ok(counters)
    }
}
