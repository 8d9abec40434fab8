//! Redis Streams broker (`XADD`, one stream per topic).
//!
//! Each message becomes a stream entry with the fields:
//!
//! - `key`: partition key (aggregate id)
//! - `event_type`: event type header
//! - `value`: message body, verbatim
//!
//! Stream keys are `<prefix>:<topic>`. Consumers read with `XREADGROUP` and must
//! deduplicate: the relay may publish the same entry more than once.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::instrument;

use bazaar_events::{Broker, BrokerError, BrokerMessage};

const DEFAULT_STREAM_PREFIX: &str = "bazaar:events";

pub struct RedisStreamsBroker {
    client: redis::Client,
    prefix: String,
    /// Entries kept per stream (`MAXLEN ~`); unbounded when `None`.
    max_len: Option<usize>,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStreamsBroker {
    /// `redis_url`, e.g. `redis://localhost:6379`.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Unavailable(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            prefix: DEFAULT_STREAM_PREFIX.to_string(),
            max_len: None,
            connection: Mutex::new(None),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget a broken connection; the next publish reconnects.
    async fn reset_connection(&self) {
        self.connection.lock().await.take();
    }
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("prefix", &self.prefix)
            .field("max_len", &self.max_len)
            .finish()
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(
        skip(self, message),
        fields(topic = %message.topic, key = %message.key, event_type = %message.event_type),
        err
    )]
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(&message.topic));
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("key")
            .arg(&message.key)
            .arg("event_type")
            .arg(&message.event_type)
            .arg("value")
            .arg(&message.value);

        let result: Result<String, _> = cmd.query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    self.reset_connection().await;
                }
                Err(map_redis_error(e))
            }
        }
    }
}

fn map_redis_error(err: redis::RedisError) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Rejected(format!("XADD failed: {err}"))
    }
}
