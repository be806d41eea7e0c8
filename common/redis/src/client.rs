use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};
use std::time::Duration;

use crate::{Client, CustomRedisError};

const DEL_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const LREM_LPUSH: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) > 0 then
    redis.call('LPUSH', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

pub struct RedisClient {
    connection: MultiplexedConnection,
    del_if_eq: Script,
    lrem_lpush: Script,
}

impl RedisClient {
    /// Create a new RedisClient with no timeouts.
    ///
    /// Clients used for blocking list commands (`blmove`) should be created
    /// this way, or with a response timeout longer than the blocking timeout,
    /// otherwise the connection gives up before the server answers.
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        Self::with_config(addr, None, None).await
    }

    /// Create a new RedisClient with explicit timeouts
    ///
    /// # Arguments
    /// * `addr` - Redis connection string
    /// * `response_timeout` - Optional timeout for Redis command responses. `None` means no timeout.
    /// * `connection_timeout` - Optional timeout for establishing connections. `None` means no timeout.
    ///
    /// # Errors
    /// Returns `CustomRedisError::InvalidConfiguration` if `Some(Duration::ZERO)` is passed - use `None` for no timeout instead.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        if response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        if connection_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient {
            connection,
            del_if_eq: Script::new(DEL_IF_EQ),
            lrem_lpush: Script::new(LREM_LPUSH),
        })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: Option<String> = conn.get(k).await?;

        match result {
            Some(value) => Ok(value),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(k, v, seconds).await?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("EX")
            .arg(seconds)
            .arg("NX")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => Ok(true), // Key was set successfully
            Ok(None) => Ok(false),   // Key already existed
            Err(e) => Err(e.into()),
        }
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(k).await?;
        Ok(())
    }

    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .del_if_eq
            .key(k)
            .arg(v)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, k: String) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(k).await?;
        Ok(exists)
    }

    async fn lpush(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.lpush::<_, _, ()>(k, v).await?;
        Ok(())
    }

    async fn blmove(
        &self,
        source: String,
        destination: String,
        timeout: Duration,
    ) -> Result<Option<String>, CustomRedisError> {
        let mut conn = self.connection.clone();

        let result: Option<String> = redis::cmd("BLMOVE")
            .arg(&source)
            .arg(&destination)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        Ok(result)
    }

    async fn lrange(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let items: Vec<String> = conn.lrange(k, start, stop).await?;
        Ok(items)
    }

    async fn llen(&self, k: String) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let len: u64 = conn.llen(k).await?;
        Ok(len)
    }

    async fn lrem(&self, k: String, v: String) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.lrem(k, 1, v).await?;
        Ok(removed > 0)
    }

    async fn lrem_lpush(
        &self,
        source: String,
        v: String,
        destination: String,
        replacement: String,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let moved: i64 = self
            .lrem_lpush
            .key(source)
            .key(destination)
            .arg(v)
            .arg(replacement)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved > 0)
    }

    async fn zadd(&self, k: String, member: String, score: f64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.zadd::<_, _, _, ()>(k, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, k: String, member: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.zrem::<_, _, ()>(k, member).await?;
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.zrangebyscore(k, min, max).await?;
        Ok(results)
    }

    async fn xadd(
        &self,
        stream: String,
        max_len: usize,
        fields: Vec<(String, String)>,
    ) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (field, value) in &fields {
            cmd.arg(field).arg(value);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }
}
