use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use gleafd_core::snowflake::{MachineStorage, Metadata};
use gleafd_core::{Error, Result};

/// Records live at `gleafd/snowflakes/{name}/{addr}` as hashes with
/// `machineid` and `timestamp` fields.
const KEY_PREFIX: &str = "gleafd/snowflakes";
/// Shared counter the next machine id is drawn from.
const MACHINE_ID_COUNTER: &str = "gleafd_machineid_gen";

/// Redis-backed machine-id coordination store.
pub struct RedisMachineStorage {
    conn: MultiplexedConnection,
}

impl RedisMachineStorage {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{addr}")).map_err(Error::storage)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::storage)?;
        Ok(Self { conn })
    }

    fn key(name: &str, addr: &str) -> String {
        format!("{KEY_PREFIX}/{name}/{addr}")
    }

    async fn read_record(
        conn: &mut MultiplexedConnection,
        key: &str,
    ) -> Result<(Option<i64>, Option<i64>)> {
        redis::cmd("HMGET")
            .arg(key)
            .arg("machineid")
            .arg("timestamp")
            .query_async(conn)
            .await
            .map_err(Error::storage)
    }
}

#[async_trait]
impl MachineStorage for RedisMachineStorage {
    async fn get_or_new(&self, name: &str, addr: &str) -> Result<Metadata> {
        let key = Self::key(name, addr);
        let mut conn = self.conn.clone();

        let exists: bool = conn.exists(&key).await.map_err(Error::storage)?;
        if !exists {
            let machine_id: i64 = conn
                .incr(MACHINE_ID_COUNTER, 1)
                .await
                .map_err(Error::storage)?;
            tracing::warn!(name, addr, machine_id, "allocating new machine id");
            let _: () = redis::cmd("HSET")
                .arg(&key)
                .arg("machineid")
                .arg(machine_id)
                .arg("timestamp")
                .arg(0i64)
                .query_async(&mut conn)
                .await
                .map_err(Error::storage)?;
            return Ok(Metadata {
                name: name.to_string(),
                addr: addr.to_string(),
                machine_id: machine_id as i32,
                timestamp: 0,
            });
        }

        let (machine_id, timestamp) = Self::read_record(&mut conn, &key).await?;
        Ok(Metadata {
            name: name.to_string(),
            addr: addr.to_string(),
            machine_id: machine_id.unwrap_or(-1) as i32,
            timestamp: timestamp.unwrap_or(0),
        })
    }

    async fn list(&self) -> Result<Vec<Metadata>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(format!("{KEY_PREFIX}*"))
            .await
            .map_err(Error::storage)?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let parts: Vec<&str> = key.split('/').collect();
            if parts.len() != 4 {
                continue;
            }
            let (machine_id, timestamp) = Self::read_record(&mut conn, &key).await?;
            records.push(Metadata {
                name: parts[2].to_string(),
                addr: parts[3].to_string(),
                machine_id: machine_id.unwrap_or(-1) as i32,
                timestamp: timestamp.unwrap_or(0),
            });
        }
        Ok(records)
    }

    async fn update(&self, md: &Metadata) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(Self::key(&md.name, &md.addr))
            .arg("machineid")
            .arg(md.machine_id)
            .arg("timestamp")
            .arg(md.timestamp)
            .query_async(&mut conn)
            .await
            .map_err(Error::storage)?;
        Ok(())
    }
}
