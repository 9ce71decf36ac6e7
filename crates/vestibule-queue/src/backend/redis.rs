//! Redis admission backend.
//!
//! The production backend: a deadpool connection pool for script dispatch
//! and plain commands, a dedicated pub/sub connection per subscribed prefix
//! fanned into a broadcast channel, and the embedded Lua scripts for every
//! state mutation. Connections are short-lived per call; the backend holds
//! no state besides script handles and connection plumbing.
//!
//! Assumes a single Redis instance (or one hash slot's worth of keys):
//! scripts derive keys from the prefix argument, which Redis Cluster would
//! reject.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolSetup, Connection, Pool, PoolConfig, Runtime};
use futures_util::StreamExt;
use redis::{cmd, pipe, AsyncTypedCommands};
use tokio::select;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::error;

use vestibule_core::error::{Error, Result};
use vestibule_core::{KeyPrefix, SessionId, SweepReport, VestibuleConfig};

use super::{AtomicOps, ClockOps, EventOps, LeaseOps, RawStatus, SettingsOps};
use crate::scripts::Scripts;

/// Capacity of each per-prefix event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One pub/sub connection fanned into a broadcast channel.
///
/// The channel keeps one receiver alive for its own lifetime so late
/// subscribers can always attach.
#[derive(Debug, Clone)]
struct Subscriber {
    sender: Arc<broadcast::Sender<String>>,
}

impl Subscriber {
    async fn start(client: &redis::Client, channel: String, cancel: Arc<Notify>) -> Result<Self> {
        let (sender, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sender = Arc::new(sender);

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::transport_with_source("pub/sub connection failed", e))?;
        let (mut sink, mut stream) = pubsub.split();
        sink.subscribe(&channel)
            .await
            .map_err(|e| Error::transport_with_source("pub/sub subscribe failed", e))?;

        let task_sender = sender.clone();
        tokio::spawn(async move {
            // Holding a receiver keeps the channel open with zero subscribers
            let _receiver = receiver;
            loop {
                select! {
                    () = cancel.notified() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            // Pub/sub connection closed; subscribers see a
                            // closed channel and can resubscribe
                            break;
                        };

                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                error!("unreadable event payload: {e:?}");
                                continue;
                            }
                        };

                        let _ = task_sender.send(payload);
                    }
                }
            }
        });

        Ok(Self { sender })
    }

    fn receiver(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

/// Production admission backend over a shared Redis instance.
pub struct RedisBackend {
    pool: Pool,
    client: redis::Client,
    scripts: Scripts,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    cancel: Arc<Notify>,
}

impl RedisBackend {
    /// Creates a backend against the given Redis URL.
    ///
    /// `acquire_timeout` bounds waiting for a pooled connection;
    /// `connect_timeout` bounds establishing a new one.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the URL is invalid or the pool cannot
    /// be built; no connection is attempted yet.
    pub fn connect(
        url: impl Into<String>,
        acquire_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let url = url.into();

        let mut setup = PoolSetup::from_url(&url);
        let mut pool_config = PoolConfig::default();
        pool_config.timeouts.wait = Some(acquire_timeout);
        pool_config.timeouts.create = Some(connect_timeout);
        setup.pool = Some(pool_config);

        let pool = setup
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::transport_with_source("failed to create connection pool", e))?;

        let client = redis::Client::open(url)
            .map_err(|e| Error::transport_with_source("invalid Redis URL", e))?;

        Ok(Self {
            pool,
            client,
            scripts: Scripts::new()?,
            subscribers: RwLock::new(HashMap::new()),
            cancel: Arc::new(Notify::new()),
        })
    }

    /// Creates a backend from a configuration.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the pool cannot be built.
    pub fn from_config(config: &VestibuleConfig) -> Result<Self> {
        Self::connect(
            config.redis_url.clone(),
            config.acquire_timeout(),
            config.connect_timeout(),
        )
    }

    /// Registers every script with the server so later calls invoke by
    /// digest.
    ///
    /// # Errors
    ///
    /// Returns a transport error when Redis is unreachable.
    pub async fn init(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        self.scripts.register(&mut conn).await
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::transport_with_source("failed to acquire connection", e))
    }

    /// The sweep pipeline, returned raw so the caller can distinguish a
    /// flushed script cache from other failures.
    async fn try_sweep(
        &self,
        conn: &mut Connection,
        prefix: &KeyPrefix,
        now: i64,
    ) -> redis::RedisResult<(Option<u64>, Option<u64>, Option<u64>)> {
        pipe()
            .atomic()
            .invoke_script(&self.scripts.queue_timeout.arg(prefix.as_str()).arg(now))
            .invoke_script(&self.scripts.store_timeout.arg(prefix.as_str()).arg(now))
            .invoke_script(&self.scripts.store_promote.arg(prefix.as_str()))
            .set(prefix.queue_sync_timestamp(), now)
            .ignore()
            .query_async(conn)
            .await
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        // Stop the pub/sub forwarding tasks
        self.cancel.notify_waiters();
    }
}

fn command_err(e: redis::RedisError) -> Error {
    Error::transport_with_source("command failed", e)
}

fn script_err(e: redis::RedisError) -> Error {
    Error::transport_with_source("script invocation failed", e)
}

fn flag_reply(script: &str, value: i64) -> Result<bool> {
    match value {
        1 => Ok(true),
        0 => Ok(false),
        other => Err(Error::unexpected_reply(script, format!("flag {other}"))),
    }
}

#[allow(clippy::cast_possible_wrap)]
fn secs(duration: Duration) -> i64 {
    duration.as_secs() as i64
}

#[async_trait]
impl AtomicOps for RedisBackend {
    async fn id_add(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
        quarantine_expiry: Duration,
    ) -> Result<u64> {
        let mut conn = self.conn().await?;
        let position: u64 = self
            .scripts
            .id_add
            .arg(prefix.as_str())
            .arg(id.to_string())
            .arg(now)
            .arg(secs(validated_expiry))
            .arg(secs(quarantine_expiry))
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(position)
    }

    async fn id_position(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
        quarantine_expiry: Duration,
    ) -> Result<(bool, u64)> {
        let mut conn = self.conn().await?;
        let reply: [u64; 2] = self
            .scripts
            .id_position
            .arg(prefix.as_str())
            .arg(id.to_string())
            .arg(now)
            .arg(secs(validated_expiry))
            .arg(secs(quarantine_expiry))
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        let [added, position] = reply;

        match added {
            0 => Ok((false, position)),
            1 => Ok((true, position)),
            other => Err(Error::unexpected_reply(
                "id_position",
                format!("added flag {other}"),
            )),
        }
    }

    async fn id_remove(&self, prefix: &KeyPrefix, id: &SessionId, now: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: Option<String> = self
            .scripts
            .id_remove
            .arg(prefix.as_str())
            .arg(id.to_string())
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(())
    }

    async fn id_promote(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: Option<String> = self
            .scripts
            .id_promote
            .arg(prefix.as_str())
            .arg(id.to_string())
            .arg(now)
            .arg(secs(validated_expiry))
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(())
    }

    async fn store_promote(&self, prefix: &KeyPrefix) -> Result<u64> {
        let mut conn = self.conn().await?;
        let moved: u64 = self
            .scripts
            .store_promote
            .arg(prefix.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(moved)
    }

    async fn store_promote_n(&self, prefix: &KeyPrefix, n: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let moved: u64 = self
            .scripts
            .store_promote_n
            .arg(prefix.as_str())
            .arg(n)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(moved)
    }

    async fn queue_timeout(&self, prefix: &KeyPrefix, now: i64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = self
            .scripts
            .queue_timeout
            .arg(prefix.as_str())
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(removed)
    }

    async fn store_timeout(&self, prefix: &KeyPrefix, now: i64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = self
            .scripts
            .store_timeout
            .arg(prefix.as_str())
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(removed)
    }

    async fn has_ids(&self, prefix: &KeyPrefix) -> Result<bool> {
        let mut conn = self.conn().await?;
        let value: i64 = self
            .scripts
            .has_ids
            .arg(prefix.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        flag_reply("has_ids", value)
    }

    async fn check_sync_keys(&self, prefix: &KeyPrefix) -> Result<bool> {
        let mut conn = self.conn().await?;
        let value: i64 = self
            .scripts
            .check_sync_keys
            .arg(prefix.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        flag_reply("check_sync_keys", value)
    }

    async fn sweep(&self, prefix: &KeyPrefix, now: i64) -> Result<SweepReport> {
        let mut conn = self.conn().await?;

        // Pipelined EVALSHA is not reloaded automatically, so a flushed
        // script cache surfaces here; re-register and retry once
        let reply = match self.try_sweep(&mut conn, prefix, now).await {
            Ok(reply) => reply,
            Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
                self.scripts.register(&mut conn).await?;
                self.try_sweep(&mut conn, prefix, now)
                    .await
                    .map_err(script_err)?
            }
            Err(e) => return Err(script_err(e)),
        };

        let (queue_expired, store_expired, promoted) = reply;
        Ok(SweepReport::new(
            queue_expired.unwrap_or(0),
            store_expired.unwrap_or(0),
            promoted.unwrap_or(0),
        ))
    }
}

#[async_trait]
impl SettingsOps for RedisBackend {
    async fn queue_enabled_raw(&self, prefix: &KeyPrefix) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(prefix.queue_enabled()).await.map_err(command_err)
    }

    async fn store_capacity_raw(&self, prefix: &KeyPrefix) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(prefix.store_capacity()).await.map_err(command_err)
    }

    async fn queue_size(&self, prefix: &KeyPrefix) -> Result<u64> {
        let mut conn = self.conn().await?;
        let size = conn.llen(prefix.queue_ids()).await.map_err(command_err)?;
        Ok(size as u64)
    }

    async fn store_size(&self, prefix: &KeyPrefix) -> Result<u64> {
        let mut conn = self.conn().await?;
        let size = conn.scard(prefix.store_ids()).await.map_err(command_err)?;
        Ok(size as u64)
    }

    async fn waiting_page(&self, prefix: &KeyPrefix) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(prefix.queue_waiting_page())
            .await
            .map_err(command_err)
    }

    async fn set_waiting_page(&self, prefix: &KeyPrefix, body: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.set(prefix.queue_waiting_page(), body)
            .await
            .map_err(command_err)
    }

    async fn status(&self, prefix: &KeyPrefix) -> Result<RawStatus> {
        let mut conn = self.conn().await?;

        // One atomic pipeline so the snapshot is internally consistent
        type Reply = (
            Option<String>,
            Option<String>,
            Option<u64>,
            Option<u64>,
            Option<i64>,
        );
        let reply: Reply = pipe()
            .atomic()
            .get(prefix.queue_enabled())
            .get(prefix.store_capacity())
            .scard(prefix.store_ids())
            .llen(prefix.queue_ids())
            .get(prefix.queue_sync_timestamp())
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;

        Ok(RawStatus {
            enabled: reply.0,
            capacity: reply.1,
            store_size: reply.2.unwrap_or(0),
            queue_size: reply.3.unwrap_or(0),
            sync_timestamp: reply.4,
        })
    }

    async fn write_settings(
        &self,
        prefix: &KeyPrefix,
        enabled: Option<&str>,
        capacity: Option<&str>,
        sync_timestamp: i64,
    ) -> Result<()> {
        let mut conn = self.conn().await?;

        let mut p = pipe();
        let p = p.atomic();
        if let Some(enabled) = enabled {
            p.set(prefix.queue_enabled(), enabled).ignore();
        }
        if let Some(capacity) = capacity {
            p.set(prefix.store_capacity(), capacity).ignore();
        }
        p.set(prefix.queue_sync_timestamp(), sync_timestamp).ignore();

        let () = p.query_async(&mut conn).await.map_err(command_err)?;
        Ok(())
    }
}

#[async_trait]
impl EventOps for RedisBackend {
    async fn publish(&self, prefix: &KeyPrefix, payload: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.publish(prefix.events_channel(), payload)
            .await
            .map_err(command_err)?;
        Ok(())
    }

    async fn subscribe(&self, prefix: &KeyPrefix) -> Result<broadcast::Receiver<String>> {
        {
            let subscribers = self.subscribers.read().await;
            if let Some(subscriber) = subscribers.get(prefix.as_str()) {
                return Ok(subscriber.receiver());
            }
        }

        let mut subscribers = self.subscribers.write().await;
        // Double-checked: another task may have won the write race
        if let Some(subscriber) = subscribers.get(prefix.as_str()) {
            return Ok(subscriber.receiver());
        }

        let subscriber = Subscriber::start(
            &self.client,
            prefix.events_channel(),
            self.cancel.clone(),
        )
        .await?;
        let receiver = subscriber.receiver();
        subscribers.insert(prefix.as_str().to_string(), subscriber);
        Ok(receiver)
    }
}

#[async_trait]
impl LeaseOps for RedisBackend {
    async fn try_lease(&self, prefix: &KeyPrefix, holder: &str, ttl: Duration) -> Result<bool> {
        let key = prefix.sweep_lease();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn().await?;

        let taken: Option<String> = cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        if taken.is_some() {
            return Ok(true);
        }

        // Held: renew only if we are the holder. The GET-then-SET pair is
        // not atomic, but the lease is advisory — a double sweep is safe.
        let current: Option<String> = conn.get(&key).await.map_err(command_err)?;
        if current.as_deref() != Some(holder) {
            return Ok(false);
        }

        let renewed: Option<String> = cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("XX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(renewed.is_some())
    }
}

#[async_trait]
impl ClockOps for RedisBackend {
    async fn current_time(&self) -> Result<DateTime<Utc>> {
        let mut conn = self.conn().await?;
        let (seconds, micros): (Option<i64>, Option<u32>) = cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;

        let seconds =
            seconds.ok_or_else(|| Error::unexpected_reply("TIME", "nil seconds"))?;
        let micros = micros.ok_or_else(|| Error::unexpected_reply("TIME", "nil microseconds"))?;
        DateTime::from_timestamp(seconds, micros.saturating_mul(1000))
            .ok_or_else(|| Error::unexpected_reply("TIME", format!("timestamp {seconds}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_does_not_require_a_server() {
        let backend = RedisBackend::connect(
            "redis://127.0.0.1:6379",
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        assert!(backend.is_ok());
    }

    #[test]
    fn invalid_url_is_a_transport_error() {
        let backend = RedisBackend::connect(
            "not-a-url",
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        assert!(matches!(backend, Err(Error::Transport { .. })));
    }

    #[test]
    fn flag_replies_outside_the_contract_are_rejected() {
        assert!(flag_reply("has_ids", 0).is_ok());
        assert!(flag_reply("has_ids", 1).is_ok());
        assert!(matches!(
            flag_reply("has_ids", 7),
            Err(Error::UnexpectedReply { .. })
        ));
    }
}
