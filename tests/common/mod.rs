#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use imhybrid::Context;
use imhybrid::error::{ProviderError, StorageError};
use imhybrid::model::{ImageRecord, RankedHit, StoredImage, rerank};
use imhybrid::provider::{CaptionProvider, EmbeddingProvider};
use imhybrid::retry::RetryPolicy;
use imhybrid::schema::{CollectionSchema, IndexAlgorithm};
use imhybrid::store::StorageEngine;

pub const DIM: usize = 4;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

pub type TestContext = Context<MemoryStore, MockEmbedder, MockCaptioner>;

/// 构造一张假图片：PNG 文件头 + 向量 + 描述
///
/// [`MockEmbedder`] 与 [`MockCaptioner`] 会从中原样解析出向量和描述
pub fn fake_image(vector: &[f32], caption: &str) -> Vec<u8> {
    let mut data = PNG_MAGIC.to_vec();
    data.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for v in vector {
        data.extend_from_slice(&v.to_le_bytes());
    }
    data.extend_from_slice(caption.as_bytes());
    data
}

fn parse_image(image: &[u8]) -> Result<(Vec<f32>, String), ProviderError> {
    let invalid = || ProviderError::InvalidImage("not a fake image".to_string());
    let body = image.strip_prefix(PNG_MAGIC).ok_or_else(invalid)?;
    let n = u32::from_le_bytes(body.get(..4).ok_or_else(invalid)?.try_into().unwrap()) as usize;
    let vector_end = 4 + n * 4;
    let vector = body
        .get(4..vector_end)
        .ok_or_else(invalid)?
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let caption = String::from_utf8_lossy(&body[vector_end..]).to_string();
    Ok((vector, caption))
}

#[derive(Default)]
pub struct MockEmbedder {
    pub calls: AtomicUsize,
    /// 设置后每次调用都返回该错误
    pub fail_with: Mutex<Option<ProviderError>>,
    /// 前 N 次调用返回临时错误
    pub transient_failures: AtomicUsize,
}

impl EmbeddingProvider for MockEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }

    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(ProviderError::Unavailable("503".to_string()));
        }
        Ok(parse_image(image)?.0)
    }
}

#[derive(Default)]
pub struct MockCaptioner {
    pub calls: AtomicUsize,
}

impl CaptionProvider for MockCaptioner {
    async fn caption(&self, image: &[u8]) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(parse_image(image)?.1)
    }
}

/// 内存中的存储引擎，向量召回为精确的 L2 距离
#[derive(Default)]
pub struct MemoryStore {
    pub schema: Mutex<Option<CollectionSchema>>,
    pub records: Mutex<BTreeMap<String, ImageRecord>>,
    pub create_calls: AtomicUsize,
    /// 成功写入这么多批次后，之后的写入全部失败
    pub fail_inserts_after: Mutex<Option<usize>>,
    pub insert_calls: AtomicUsize,
    /// 召回时返回存储不可用
    pub unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn count_now(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn ids(&self) -> HashSet<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store is down".to_string()));
        }
        Ok(())
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl StorageEngine for MemoryStore {
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), StorageError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut current = self.schema.lock().unwrap();
        if current.is_none() {
            *current = Some(schema.clone());
        }
        Ok(())
    }

    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionSchema>, StorageError> {
        Ok(self.schema.lock().unwrap().clone().filter(|s| s.name == name))
    }

    async fn insert_batch(&self, records: &[ImageRecord]) -> Result<usize, StorageError> {
        let calls = self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_inserts_after.lock().unwrap() {
            if calls >= limit {
                return Err(StorageError::Rejected("disk full".to_string()));
            }
        }
        let mut stored = self.records.lock().unwrap();
        let mut inserted = 0;
        for record in records {
            if !stored.contains_key(&record.id) {
                stored.insert(record.id.clone(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn contains(&self, ids: &[String]) -> Result<HashSet<String>, StorageError> {
        let stored = self.records.lock().unwrap();
        Ok(ids.iter().filter(|id| stored.contains_key(*id)).cloned().collect())
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        top_k: usize,
        distance_threshold: Option<f32>,
    ) -> Result<Vec<RankedHit>, StorageError> {
        self.check()?;
        let stored = self.records.lock().unwrap();
        let mut hits = stored
            .values()
            .map(|r| {
                let d = r.embedding.iter().zip(vector).map(|(a, b)| (a - b) * (a - b)).sum::<f32>();
                RankedHit::new(r.id.clone(), d.sqrt(), 0)
            })
            .filter(|hit| distance_threshold.is_none_or(|t| hit.score <= t))
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.record_id.cmp(&b.record_id)));
        hits.truncate(top_k);
        rerank(&mut hits);
        Ok(hits)
    }

    async fn text_search(&self, text: &str, top_k: usize) -> Result<Vec<RankedHit>, StorageError> {
        self.check()?;
        let query = tokens(text);
        let stored = self.records.lock().unwrap();
        let mut hits = stored
            .values()
            .filter_map(|r| {
                let caption = tokens(&r.caption);
                let score = query.iter().filter(|q| caption.contains(q)).count();
                (score > 0).then(|| RankedHit::new(r.id.clone(), score as f32, 0))
            })
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.record_id.cmp(&b.record_id)));
        hits.truncate(top_k);
        rerank(&mut hits);
        Ok(hits)
    }

    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<StoredImage>, StorageError> {
        let stored = self.records.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| stored.get(id))
            .map(|r| StoredImage {
                id: r.id.clone(),
                file_name: r.file_name.clone(),
                file_path: r.file_path.clone(),
                caption: r.caption.clone(),
            })
            .collect())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.records.lock().unwrap().len())
    }
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        timeout: Duration::from_secs(5),
        storage_timeout: Duration::from_secs(5),
    }
}

pub fn schema() -> CollectionSchema {
    let mut schema = CollectionSchema::new("test", DIM);
    schema.vector_index.algorithm = IndexAlgorithm::Flat;
    schema
}

pub fn context(store: MemoryStore, captions: bool) -> TestContext {
    let captioner = captions.then(MockCaptioner::default);
    Context::new(store, MockEmbedder::default(), captioner, schema(), fast_retry(3))
}

pub fn record(id: &str, embedding: [f32; DIM], caption: &str) -> ImageRecord {
    ImageRecord {
        id: id.to_string(),
        file_name: format!("{}.png", id),
        file_path: format!("/images/{}.png", id),
        caption: caption.to_string(),
        embedding: embedding.to_vec(),
    }
}
