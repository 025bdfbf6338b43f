use std::collections::HashSet;
use std::fmt::Display;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder};
use futures::StreamExt;
use indicatif::ProgressBar;
use log::{error, info, warn};
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio_tar::Archive;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use zip::ZipArchive;

use super::types::*;
use crate::context::Context;
use crate::error::{ConfigError, Error, ProviderError, StorageError, ValidationError};
use crate::metrics;
use crate::model::ImageRecord;
use crate::provider::{CaptionProvider, EmbeddingProvider, ImageFormat};
use crate::store::StorageEngine;

/// 过滤阶段每次查询存储的最大数量
const FILTER_CHUNK: usize = 64;

/// 各阶段共享的状态
pub struct Pipeline<S, E, C> {
    pub ctx: Context<S, E, C>,
    pub options: IngestOptions,
    /// 集合的向量维度
    pub dimension: usize,
    pub tally: Tally,
    pub pb: ProgressBar,
    /// 调用方令牌的子令牌，致命错误只取消本次导入
    pub cancel: CancellationToken,
    pub fatal: OnceLock<Error>,
}

impl<S, E, C> Pipeline<S, E, C> {
    /// 记录致命错误并停止所有阶段，只保留第一个错误
    fn abort(&self, err: Error) {
        error!("导入中止: {}", err);
        let _ = self.fatal.set(err);
        self.cancel.cancel();
    }

    /// 归档中的文件是否需要读取，需要时返回记录中保存的路径
    fn archive_entry(&self, archive: &Path, entry: &Path) -> Option<String> {
        if entry.components().any(|c| is_ignored(&c.as_os_str().to_string_lossy())) {
            return None;
        }
        self.tally.scanned();
        let full_path = format!("{}!/{}", archive.display(), entry.display());
        if !has_suffix(entry, &self.options.suffix) {
            self.tally.skip(SkipReason::UnsupportedFormat, 1);
            warn!("跳过 {} ({})", full_path, SkipReason::UnsupportedFormat);
            return None;
        }
        self.pb.inc_length(1);
        Some(full_path)
    }

    fn skip(&self, reason: SkipReason, path: &str, detail: impl Display) {
        self.tally.skip(reason, 1);
        self.pb.inc(1);
        if reason == SkipReason::AlreadyIngested {
            self.pb.set_message(format!("跳过已添加图片: {}", path));
        } else {
            warn!("跳过 {} ({}): {}", path, reason, detail);
        }
    }
}

pub fn task_scan<S, E, C>(
    source: ImageSource,
    p: Arc<Pipeline<S, E, C>>,
) -> (JoinHandle<()>, Receiver<ImageData>)
where
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let (tx, rx) = channel(num_cpus::get());
    let t = tokio::spawn(async move {
        let result = match source {
            ImageSource::Directory(path) => scan_directory(path, &tx, &p).await,
            ImageSource::Archive(path) => scan_archive(path, &tx, &p).await,
            ImageSource::Memory(images) => scan_memory(images, &tx, p.as_ref()).await,
        };
        if let Err(err) = result {
            p.abort(err);
        }
    });
    (t, rx)
}

pub fn task_filter<S, E, C>(
    mut lrx: Receiver<ImageData>,
    p: Arc<Pipeline<S, E, C>>,
) -> (JoinHandle<()>, Receiver<KeyedImage>)
where
    S: StorageEngine + 'static,
    E: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let (tx, rx) = channel(num_cpus::get());
    let t = tokio::spawn(async move {
        let mut seen = HashSet::new();
        let mut buffer = vec![];
        while lrx.recv_many(&mut buffer, FILTER_CHUNK).await != 0 {
            if p.cancel.is_cancelled() {
                break;
            }

            let mut keyed = Vec::with_capacity(buffer.len());
            for image in buffer.drain(..) {
                match p.options.dedup.record_id(&image) {
                    Some(id) => keyed.push(KeyedImage { id, image }),
                    None => p.skip(SkipReason::Unreadable, &image.path, "没有可用的文件内容"),
                }
            }

            let ids = keyed.iter().map(|k| k.id.clone()).collect::<Vec<_>>();
            let (store, ids) = (&p.ctx.store, ids.as_slice());
            let result =
                p.ctx.retry.storage(&p.cancel, "contains", move || store.contains(ids)).await;
            let existing = match result {
                Ok(existing) => existing,
                Err(StorageError::Cancelled) => break,
                Err(err) => {
                    p.abort(err.into());
                    break;
                }
            };

            for k in keyed {
                // 同一次导入中重复出现的 ID 也视为已添加
                if existing.contains(&k.id) || !seen.insert(k.id.clone()) {
                    p.skip(SkipReason::AlreadyIngested, &k.image.path, "");
                    continue;
                }
                if tx.send(k).await.is_err() {
                    return;
                }
            }
        }
    });
    (t, rx)
}

pub fn task_derive<S, E, C>(
    mut lrx: Receiver<KeyedImage>,
    p: Arc<Pipeline<S, E, C>>,
) -> (JoinHandle<()>, Receiver<ImageRecord>)
where
    S: Send + Sync + 'static,
    E: EmbeddingProvider + 'static,
    C: CaptionProvider + 'static,
{
    let (tx, rx) = channel(p.options.batch_size.max(1));
    let t = tokio::spawn(async move {
        let workers = p.options.workers.max(1);
        let mut records = pin!(
            futures::stream::poll_fn(|cx| lrx.poll_recv(cx))
                .map(|item| derive(item, p.clone()))
                .buffer_unordered(workers)
                .take_until(p.cancel.cancelled())
        );
        while let Some(record) = records.next().await {
            if let Some(record) = record {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        }
    });
    (t, rx)
}

pub fn task_flush<S, E, C>(
    mut lrx: Receiver<ImageRecord>,
    p: Arc<Pipeline<S, E, C>>,
) -> JoinHandle<()>
where
    S: StorageEngine + 'static,
    E: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    tokio::spawn(async move {
        let batch_size = p.options.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        loop {
            let limit = batch_size - batch.len();
            let closed = tokio::select! {
                biased;
                _ = p.cancel.cancelled() => break,
                n = lrx.recv_many(&mut batch, limit) => n == 0,
            };
            if batch.len() >= batch_size || (closed && !batch.is_empty()) {
                flush(&mut batch, &p).await;
            }
            if closed {
                break;
            }
        }
        // 未写入的记录会在下次导入时重新处理
        if !batch.is_empty() {
            info!("导入已取消，丢弃 {} 条未写入的记录", batch.len());
        }
    })
}

async fn derive<S, E, C>(item: KeyedImage, p: Arc<Pipeline<S, E, C>>) -> Option<ImageRecord>
where
    E: EmbeddingProvider,
    C: CaptionProvider,
{
    let KeyedImage { id, image } = item;
    let data = match image.data {
        Some(data) => data,
        None => match tokio::fs::read(&image.path).await {
            Ok(data) => data,
            Err(err) => {
                p.skip(SkipReason::Unreadable, &image.path, err);
                return None;
            }
        },
    };

    if ImageFormat::sniff(&data).is_none() {
        let err = ValidationError::CorruptImage { path: image.path.clone() };
        p.skip(SkipReason::InvalidImage, &image.path, err);
        return None;
    }

    let ctx = &p.ctx;
    let data = data.as_slice();
    let embed = ctx.retry.provider(&p.cancel, "embed", move || ctx.embedder.embed(data));
    let caption = async {
        match &ctx.captioner {
            Some(captioner) => {
                ctx.retry.provider(&p.cancel, "caption", move || captioner.caption(data)).await
            }
            None => Ok(String::new()),
        }
    };

    let (embedding, caption) = match tokio::try_join!(embed, caption) {
        Ok(derived) => derived,
        Err(ProviderError::Cancelled) => return None,
        Err(err) if err.is_fatal() => {
            p.abort(err.into());
            return None;
        }
        Err(err @ ProviderError::InvalidImage(_)) => {
            p.skip(SkipReason::InvalidImage, &image.path, err);
            return None;
        }
        Err(err) => {
            p.skip(SkipReason::ProviderFailed, &image.path, err);
            return None;
        }
    };

    if embedding.len() != p.dimension {
        let err =
            ValidationError::DimensionMismatch { expected: p.dimension, actual: embedding.len() };
        p.skip(SkipReason::DimensionMismatch, &image.path, err);
        return None;
    }

    Some(ImageRecord { id, file_name: image.file_name, file_path: image.path, caption, embedding })
}

async fn flush<S, E, C>(batch: &mut Vec<ImageRecord>, p: &Pipeline<S, E, C>)
where
    S: StorageEngine,
{
    let now = Instant::now();
    let records = batch.as_slice();
    let store = &p.ctx.store;
    let result =
        p.ctx.retry.storage(&p.cancel, "insert_batch", move || store.insert_batch(records)).await;
    match result {
        Ok(inserted) => {
            p.tally.accepted(inserted);
            // 处理期间被其他导入写入的记录
            let raced = records.len().saturating_sub(inserted);
            if raced > 0 {
                p.tally.skip(SkipReason::AlreadyIngested, raced);
            }
            p.tally.batch();
            let elapsed = now.elapsed().as_secs_f32();
            metrics::observe_flush_duration(elapsed);
            info!("写入 {} 条记录，耗时 {:.2}s", inserted, elapsed);
        }
        Err(StorageError::Cancelled) => {
            info!("导入已取消，丢弃 {} 条未写入的记录", records.len());
        }
        Err(err) => {
            error!("写入失败，丢弃 {} 条记录: {}", records.len(), err);
            p.tally.skip(SkipReason::FlushFailed, records.len());
        }
    }
    p.pb.inc(batch.len() as u64);
    batch.clear();
}

/// 隐藏文件与 macOS 生成的元数据目录
fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name == "__MACOSX"
}

fn has_suffix(path: &Path, suffix: &Regex) -> bool {
    path.extension().is_some_and(|ext| suffix.is_match(&ext.to_string_lossy()))
}

/// 目录扫描结果
#[derive(Debug, Default)]
struct Walked {
    images: Vec<PathBuf>,
    unsupported: Vec<PathBuf>,
    unreadable: usize,
}

fn walk(root: &Path, suffix: &Regex) -> Walked {
    let mut walked = Walked::default();
    let entries = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !is_ignored(&entry.file_name().to_string_lossy())
        });
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("无法读取 {}", err);
                walked.unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if has_suffix(entry.path(), suffix) {
            walked.images.push(entry.into_path());
        } else {
            walked.unsupported.push(entry.into_path());
        }
    }
    walked
}

async fn scan_directory<S, E, C>(
    path: PathBuf,
    tx: &Sender<ImageData>,
    p: &Arc<Pipeline<S, E, C>>,
) -> Result<(), Error>
where
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let root = path
        .canonicalize()
        .map_err(|e| ConfigError::invalid("path", format!("{}: {}", path.display(), e)))?;
    info!("开始扫描目录: {}", root.display());

    let suffix = p.options.suffix.clone();
    let walked = spawn_blocking(move || walk(&root, &suffix))
        .await
        .map_err(|e| ConfigError::invalid("path", e.to_string()))?;
    info!("扫描完成，共 {} 张图片", walked.images.len());

    for path in &walked.unsupported {
        p.tally.scanned();
        p.tally.skip(SkipReason::UnsupportedFormat, 1);
        warn!("跳过 {} ({})", path.display(), SkipReason::UnsupportedFormat);
    }
    for _ in 0..walked.unreadable {
        p.tally.scanned();
        p.tally.skip(SkipReason::Unreadable, 1);
    }
    p.pb.set_length(walked.images.len() as u64);

    let read_now = p.options.dedup == DedupKey::Content;
    futures::stream::iter(walked.images)
        .take_until(p.cancel.cancelled())
        .for_each_concurrent(32, |path| {
            let (p, tx) = (p.clone(), tx.clone());
            async move {
                p.tally.scanned();
                let path = path.to_string_lossy().to_string();
                let file_name = file_name_of(&path);
                let data = if read_now {
                    match tokio::fs::read(&path).await {
                        Ok(data) => Some(data),
                        Err(err) => {
                            p.skip(SkipReason::Unreadable, &path, err);
                            return;
                        }
                    }
                } else {
                    None
                };
                let _ = tx.send(ImageData { path, file_name, data }).await;
            }
        })
        .await;

    Ok(())
}

async fn scan_archive<S, E, C>(
    path: PathBuf,
    tx: &Sender<ImageData>,
    p: &Arc<Pipeline<S, E, C>>,
) -> Result<(), Error>
where
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let format = ArchiveFormat::from_path(&path).ok_or_else(|| {
        ConfigError::invalid("path", format!("不支持的归档格式: {}", path.display()))
    })?;
    info!("开始读取归档: {} ({:?})", path.display(), format);

    if format == ArchiveFormat::Zip {
        let (tx, p) = (tx.clone(), p.clone());
        return spawn_blocking(move || scan_zip(&path, &tx, &p))
            .await
            .map_err(|e| ConfigError::invalid("path", e.to_string()))?;
    }

    let file = File::open(&path)
        .await
        .map_err(|e| ConfigError::invalid("path", format!("{}: {}", path.display(), e)))?;
    let file = BufReader::new(file);
    let reader: Box<dyn AsyncRead + Unpin + Send> = match format {
        ArchiveFormat::TarGz => {
            let mut decoder = GzipDecoder::new(file);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(file)),
        ArchiveFormat::TarXz => Box::new(XzDecoder::new(file)),
        _ => Box::new(file),
    };
    scan_tar(&path, reader, tx, p).await
}

async fn scan_tar<S, E, C>(
    path: &Path,
    reader: impl AsyncRead + Unpin,
    tx: &Sender<ImageData>,
    p: &Pipeline<S, E, C>,
) -> Result<(), Error> {
    let invalid =
        |e: std::io::Error| ConfigError::invalid("path", format!("{}: {}", path.display(), e));
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().map_err(invalid)?;

    // NOTE: tar 的 entries 必须按顺序读取，不能乱序并发
    while let Some(entry) = entries.next().await {
        if p.cancel.is_cancelled() {
            break;
        }
        let mut entry = entry.map_err(invalid)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let entry_path = entry.path().map_err(invalid)?.into_owned();
        let Some(full_path) = p.archive_entry(path, &entry_path) else {
            continue;
        };

        let mut data = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
        if let Err(err) = entry.read_to_end(&mut data).await {
            p.skip(SkipReason::Unreadable, &full_path, err);
            continue;
        }
        if tx.send(ImageData::new(full_path, data)).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// zip 只能同步读取，在阻塞线程中运行
fn scan_zip<S, E, C>(
    path: &Path,
    tx: &Sender<ImageData>,
    p: &Pipeline<S, E, C>,
) -> Result<(), Error> {
    let invalid =
        |e: &dyn Display| ConfigError::invalid("path", format!("{}: {}", path.display(), e));
    let file = std::fs::File::open(path).map_err(|e| invalid(&e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| invalid(&e))?;

    for i in 0..archive.len() {
        if p.cancel.is_cancelled() {
            break;
        }
        let mut entry = archive.by_index(i).map_err(|e| invalid(&e))?;
        if entry.is_dir() {
            continue;
        }
        let Some(entry_path) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("跳过路径不安全的条目: {}", entry.name());
            continue;
        };
        let Some(full_path) = p.archive_entry(path, &entry_path) else {
            continue;
        };

        let mut data = Vec::with_capacity(entry.size() as usize);
        if let Err(err) = entry.read_to_end(&mut data) {
            p.skip(SkipReason::Unreadable, &full_path, err);
            continue;
        }
        if tx.blocking_send(ImageData::new(full_path, data)).is_err() {
            break;
        }
    }
    Ok(())
}

async fn scan_memory<S, E, C>(
    images: Vec<ImageData>,
    tx: &Sender<ImageData>,
    p: &Pipeline<S, E, C>,
) -> Result<(), Error> {
    let (images, unsupported): (Vec<_>, Vec<_>) = images
        .into_iter()
        .partition(|image| has_suffix(Path::new(&image.file_name), &p.options.suffix));
    for image in &unsupported {
        p.tally.scanned();
        p.tally.skip(SkipReason::UnsupportedFormat, 1);
        warn!("跳过 {} ({})", image.path, SkipReason::UnsupportedFormat);
    }

    p.pb.set_length(images.len() as u64);
    for image in images {
        if p.cancel.is_cancelled() {
            break;
        }
        p.tally.scanned();
        if tx.send(image).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_is_ignored() {
        assert!(is_ignored(".DS_Store"));
        assert!(is_ignored(".hidden.jpg"));
        assert!(is_ignored("__MACOSX"));
        assert!(!is_ignored("a.jpg"));
        assert!(!is_ignored("MACOSX"));
    }

    #[test]
    fn test_walk() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("__MACOSX")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        for name in [
            "a.jpg",
            "b.png",
            "c.txt",
            "noext",
            ".hidden.jpg",
            "sub/e.JPG",
            "__MACOSX/._a.jpg",
            ".cache/f.png",
        ] {
            fs::write(root.join(name), b"x").unwrap();
        }

        let suffix = IngestOptions::default().suffix;
        let walked = walk(root, &suffix);
        let names = walked
            .images
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.jpg", "b.png", "sub/e.JPG"]);
        assert_eq!(walked.unsupported.len(), 2);
        assert_eq!(walked.unreadable, 0);
    }

    #[test]
    fn test_has_suffix() {
        let suffix = Regex::new("(?i)^(jpg|png)$").unwrap();
        assert!(has_suffix(Path::new("/a/b.PNG"), &suffix));
        assert!(!has_suffix(Path::new("/a/b.jpeg"), &suffix));
        assert!(!has_suffix(Path::new("/a/jpg"), &suffix));
    }
}
