use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use tokio::sync::Mutex;

use super::{HybridQuery, StorageEngine, VectorIndex, crud};
use crate::error::StorageError;
use crate::fusion::restrict_to_threshold;
use crate::model::{FusionResult, ImageRecord, QueryMode, RankedHit, StoredImage};
use crate::schema::CollectionSchema;

struct LoadedIndex {
    index: VectorIndex,
    dimension: usize,
    /// 已经加入索引的最大 seq
    last_seq: i64,
}

/// SQLite 存储：记录表 + FTS5 全文索引 + 进程内向量索引
pub struct SqliteStore {
    pool: SqlitePool,
    collection: String,
    index: Mutex<Option<LoadedIndex>>,
}

impl SqliteStore {
    pub async fn open(
        filename: impl AsRef<Path>,
        collection: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let filename = filename.as_ref();
        info!("初始化数据库连接: {}", filename.display());

        let options = SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .filename(filename)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        info!("检查数据库迁移");
        sqlx::migrate!().run(&pool).await?;

        Ok(Self { pool, collection: collection.into(), index: Mutex::new(None) })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn new_index(&self) -> Result<LoadedIndex, StorageError> {
        let schema = self.describe_collection(&self.collection).await?.ok_or_else(|| {
            StorageError::Rejected(format!("集合 {} 不存在", self.collection))
        })?;
        let index = VectorIndex::new(&schema.vector_index, schema.dimension, 0);
        Ok(LoadedIndex { index, dimension: schema.dimension, last_seq: 0 })
    }

    /// 将新写入的记录加入向量索引
    async fn refresh(&self, loaded: &mut LoadedIndex) -> Result<(), StorageError> {
        let rows = crud::vectors_after(&self.pool, &self.collection, loaded.last_seq).await?;
        let Some((last_seq, _, _)) = rows.last() else {
            return Ok(());
        };
        loaded.last_seq = *last_seq;

        let total = rows.len();
        let items: Vec<_> = rows
            .into_iter()
            .filter_map(|(_, id, vector)| {
                if vector.len() == loaded.dimension {
                    Some((id, vector))
                } else {
                    warn!("记录 {} 的向量维度为 {}，已忽略", id, vector.len());
                    None
                }
            })
            .collect();
        debug!("向量索引新增 {} / {} 条记录", items.len(), total);
        loaded.index.add(items);
        Ok(())
    }
}

impl StorageEngine for SqliteStore {
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), StorageError> {
        if schema.name != self.collection {
            return Err(StorageError::Rejected(format!(
                "当前存储绑定的集合为 {}，无法创建 {}",
                self.collection, schema.name
            )));
        }
        let json =
            serde_json::to_string(schema).map_err(|e| StorageError::Rejected(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        crud::create_tables(&mut tx, schema).await?;
        crud::register_collection(&mut *tx, &schema.name, &json).await?;
        tx.commit().await?;

        *self.index.lock().await = None;
        Ok(())
    }

    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionSchema>, StorageError> {
        let Some(json) = crud::get_collection(&self.pool, name).await? else {
            return Ok(None);
        };
        let schema = serde_json::from_str(&json)
            .map_err(|e| StorageError::Rejected(format!("集合 {} 的定义无法解析: {}", name, e)))?;
        Ok(Some(schema))
    }

    async fn insert_batch(&self, records: &[ImageRecord]) -> Result<usize, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for record in records {
            if crud::insert_record(&mut tx, &self.collection, record).await?.is_some() {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn contains(&self, ids: &[String]) -> Result<HashSet<String>, StorageError> {
        Ok(crud::existing_ids(&self.pool, &self.collection, ids).await?)
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        top_k: usize,
        distance_threshold: Option<f32>,
    ) -> Result<Vec<RankedHit>, StorageError> {
        let mut guard = self.index.lock().await;
        let loaded = match guard.take() {
            Some(loaded) => loaded,
            None => self.new_index().await?,
        };
        let loaded = guard.insert(loaded);
        self.refresh(loaded).await?;

        if vector.len() != loaded.dimension {
            return Err(StorageError::Rejected(format!(
                "查询向量维度为 {}，集合维度为 {}",
                vector.len(),
                loaded.dimension
            )));
        }
        Ok(loaded.index.search(vector, top_k, distance_threshold))
    }

    async fn text_search(&self, text: &str, top_k: usize) -> Result<Vec<RankedHit>, StorageError> {
        let Some(query) = crud::fts_query(text) else {
            return Ok(vec![]);
        };
        let rows = crud::search_caption(&self.pool, &self.collection, &query, top_k).await?;
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, (id, relevance))| RankedHit::new(id, relevance, i + 1))
            .collect())
    }

    async fn hybrid_search(&self, query: HybridQuery<'_>) -> Result<FusionResult, StorageError> {
        let pool = query.fusion.candidate_pool(query.top_k);
        let (vector, text) = tokio::try_join!(
            self.vector_search(query.vector, pool, query.distance_threshold),
            self.text_search(query.text, pool),
        )?;
        let text = restrict_to_threshold(&vector, text, query.distance_threshold);
        let hits = query.fusion.fuse(&vector, &text, query.weight, query.top_k);
        Ok(FusionResult { mode: QueryMode::Hybrid, hits })
    }

    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<StoredImage>, StorageError> {
        Ok(crud::get_records(&self.pool, &self.collection, ids).await?)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(crud::count_records(&self.pool, &self.collection).await? as usize)
    }
}
