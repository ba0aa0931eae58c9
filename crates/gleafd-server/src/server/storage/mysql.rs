use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

use gleafd_core::segment::{Segment, SegmentRepository};
use gleafd_core::{Error, Result};

const SELECT_ALL: &str = "SELECT `biz_tag`,`max_id`,`step`,`desc`,`updated` FROM `segments`";
const SELECT_ONE: &str =
    "SELECT `biz_tag`,`max_id`,`step`,`desc`,`updated` FROM `segments` WHERE `biz_tag`=?";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS `segments`(\
    `biz_tag` VARCHAR(128) NOT NULL DEFAULT '',\
    `max_id` BIGINT NOT NULL DEFAULT '1',\
    `step` INT NOT NULL,\
    `desc` VARCHAR(256) DEFAULT NULL,\
    `updated` TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,\
    PRIMARY KEY (`biz_tag`)\
)";

#[derive(sqlx::FromRow)]
struct SegmentRow {
    biz_tag: String,
    max_id: i64,
    step: i32,
    #[sqlx(rename = "desc")]
    description: Option<String>,
    updated: DateTime<Utc>,
}

impl From<SegmentRow> for Segment {
    fn from(row: SegmentRow) -> Self {
        Self {
            biz_tag: row.biz_tag,
            max_id: row.max_id,
            step: row.step,
            description: row.description,
            updated: row.updated,
        }
    }
}

/// MySQL-backed segment repository over the `segments` table.
///
/// Both advance operations run `UPDATE … SET max_id = max_id + …` and
/// re-read the row inside one transaction, so the database serializes
/// concurrent advances on the same biztag.
pub struct MySqlSegmentRepository {
    pool: MySqlPool,
}

impl MySqlSegmentRepository {
    /// Connects and prepares the schema: the table is created if missing
    /// and a single `example` row is seeded into an empty table.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .connect(url)
            .await
            .map_err(Error::storage)?;
        let repo = Self { pool };
        repo.init_schema().await?;
        Ok(repo)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM `segments`")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::storage)?;
        if rows == 0 {
            tracing::info!("seeding empty segments table with the example biztag");
            sqlx::query(
                "INSERT INTO `segments`(`biz_tag`,`step`,`desc`) \
                 VALUES('example', 1000, 'gleafd example')",
            )
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;
        }
        Ok(())
    }

    /// Shared tail of both advance operations: bump inside a transaction,
    /// re-read, commit. Zero affected rows means the biztag is unknown.
    async fn advance(&self, biz_tag: &str, step: Option<i32>) -> Result<Segment> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;

        let done = match step {
            Some(step) => {
                sqlx::query("UPDATE `segments` SET `max_id`=`max_id`+? WHERE `biz_tag`=?")
                    .bind(step)
                    .bind(biz_tag)
                    .execute(&mut *tx)
                    .await
            }
            None => {
                sqlx::query("UPDATE `segments` SET `max_id`=`max_id`+`step` WHERE `biz_tag`=?")
                    .bind(biz_tag)
                    .execute(&mut *tx)
                    .await
            }
        }
        .map_err(Error::storage)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }

        let row: SegmentRow = sqlx::query_as(SELECT_ONE)
            .bind(biz_tag)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::storage)?;
        tx.commit().await.map_err(Error::storage)?;
        Ok(row.into())
    }
}

#[async_trait]
impl SegmentRepository for MySqlSegmentRepository {
    async fn list(&self) -> Result<Vec<Segment>> {
        let rows: Vec<SegmentRow> = sqlx::query_as(SELECT_ALL)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::storage)?;
        Ok(rows.into_iter().map(Segment::from).collect())
    }

    async fn get(&self, biz_tag: &str) -> Result<Segment> {
        sqlx::query_as::<_, SegmentRow>(SELECT_ONE)
            .bind(biz_tag)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::storage)?
            .map(Segment::from)
            .ok_or(Error::NotFound)
    }

    async fn list_biz_tags(&self) -> Result<Vec<String>> {
        let tags: Vec<(String,)> = sqlx::query_as("SELECT `biz_tag` FROM `segments`")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::storage)?;
        Ok(tags.into_iter().map(|(tag,)| tag).collect())
    }

    async fn update_max_id(&self, biz_tag: &str) -> Result<Segment> {
        self.advance(biz_tag, None).await
    }

    async fn update_max_id_with_step(&self, biz_tag: &str, step: i32) -> Result<Segment> {
        self.advance(biz_tag, Some(step)).await
    }
}
