mod common;

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;

use async_compression::tokio::write::{BzEncoder, GzipEncoder, XzEncoder};
use common::*;
use imhybrid::error::{Error, ProviderError};
use imhybrid::ingest::*;
use indicatif::ProgressBar;
use rstest::*;
use tempfile::TempDir;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn options(batch_size: usize, workers: usize) -> IngestOptions {
    IngestOptions { batch_size, workers, ..Default::default() }
}

async fn run(source: ImageSource, ctx: &TestContext, options: &IngestOptions) -> IngestReport {
    ingest(source, ctx, options, &CancellationToken::new(), ProgressBar::hidden()).await
}

fn write_images(dir: &Path, count: usize) {
    for i in 0..count {
        let image = fake_image(&[i as f32, 0., 0., 0.], &format!("picture {}", i));
        fs::write(dir.join(format!("{:02}.png", i)), image).unwrap();
    }
}

#[fixture]
fn dir() -> TempDir {
    TempDir::new().unwrap()
}

#[rstest]
#[tokio::test]
async fn unsupported_file_is_skipped(dir: TempDir) {
    fs::write(dir.path().join("a.jpg"), fake_image(&[1., 0., 0., 0.], "cat")).unwrap();
    fs::write(dir.path().join("b.png"), fake_image(&[0., 1., 0., 0.], "dog")).unwrap();
    fs::write(dir.path().join("c.txt"), b"hello").unwrap();

    let ctx = context(MemoryStore::default(), true);
    let report = run(ImageSource::Directory(dir.path().into()), &ctx, &options(32, 4)).await;

    assert_eq!(report.scanned, 3);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.skipped(SkipReason::UnsupportedFormat), 1);
    assert_eq!(report.total_skipped(), 1);
    assert_eq!(report.batches, 1);
    assert!(report.fatal.is_none());
    assert!(!report.cancelled);

    let records = ctx.store.records.lock().unwrap();
    let mut captions = records.values().map(|r| r.caption.as_str()).collect::<Vec<_>>();
    captions.sort();
    assert_eq!(captions, vec!["cat", "dog"]);
}

#[rstest]
#[tokio::test]
async fn hidden_files_are_ignored(dir: TempDir) {
    fs::create_dir_all(dir.path().join("__MACOSX")).unwrap();
    fs::write(dir.path().join("__MACOSX/._a.png"), b"resource fork").unwrap();
    fs::write(dir.path().join(".b.png"), b"hidden").unwrap();
    fs::write(dir.path().join("a.png"), fake_image(&[1., 0., 0., 0.], "cat")).unwrap();

    let ctx = context(MemoryStore::default(), true);
    let report = run(ImageSource::Directory(dir.path().into()), &ctx, &options(32, 4)).await;

    assert_eq!(report.scanned, 1);
    assert_eq!(report.accepted, 1);
    assert_eq!(report.total_skipped(), 0);
}

#[rstest]
#[tokio::test]
async fn corrupt_and_mismatched_images_do_not_abort(dir: TempDir) {
    write_images(dir.path(), 3);
    fs::write(dir.path().join("broken.png"), b"definitely not a png").unwrap();
    fs::write(dir.path().join("short.png"), fake_image(&[1., 2.], "too short")).unwrap();

    let ctx = context(MemoryStore::default(), true);
    let report = run(ImageSource::Directory(dir.path().into()), &ctx, &options(2, 4)).await;

    assert_eq!(report.accepted, 3);
    assert_eq!(report.skipped(SkipReason::InvalidImage), 1);
    assert_eq!(report.skipped(SkipReason::DimensionMismatch), 1);
    assert_eq!(report.batches, 2);
    assert!(report.fatal.is_none());
}

#[rstest]
#[tokio::test]
async fn resume_after_failed_flush(dir: TempDir) {
    write_images(dir.path(), 5);
    let source = ImageSource::Directory(dir.path().into());

    let baseline = context(MemoryStore::default(), true);
    let report = run(source.clone(), &baseline, &options(2, 2)).await;
    assert_eq!(report.accepted, 5);

    let store = MemoryStore::default();
    *store.fail_inserts_after.lock().unwrap() = Some(1);
    let ctx = context(store, true);
    let report = run(source.clone(), &ctx, &options(2, 2)).await;
    assert_eq!(report.accepted, 2);
    assert_eq!(report.skipped(SkipReason::FlushFailed), 3);

    *ctx.store.fail_inserts_after.lock().unwrap() = None;
    let report = run(source, &ctx, &options(2, 2)).await;
    assert_eq!(report.accepted, 3);
    assert_eq!(report.skipped(SkipReason::AlreadyIngested), 2);
    assert_eq!(ctx.store.ids(), baseline.store.ids());
}

#[rstest]
#[tokio::test]
async fn already_ingested_skips_provider_calls(dir: TempDir) {
    write_images(dir.path(), 4);
    let source = ImageSource::Directory(dir.path().into());
    let ctx = context(MemoryStore::default(), true);

    run(source.clone(), &ctx, &options(32, 4)).await;
    assert_eq!(ctx.embedder.calls.load(Ordering::SeqCst), 4);

    let report = run(source, &ctx, &options(32, 4)).await;
    assert_eq!(report.accepted, 0);
    assert_eq!(report.skipped(SkipReason::AlreadyIngested), 4);
    assert_eq!(ctx.embedder.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn content_dedup_within_one_run() {
    let image = fake_image(&[1., 1., 0., 0.], "same");
    let source = ImageSource::Memory(vec![
        ImageData::new("/upload/a.png", image.clone()),
        ImageData::new("/upload/b.png", image),
        ImageData::new("/upload/c.png", fake_image(&[0., 0., 1., 1.], "other")),
    ]);
    let ctx = context(MemoryStore::default(), true);
    let options = IngestOptions { dedup: DedupKey::Content, ..Default::default() };
    let report = run(source, &ctx, &options).await;

    assert_eq!(report.accepted, 2);
    assert_eq!(report.skipped(SkipReason::AlreadyIngested), 1);
}

#[tokio::test]
async fn auth_failure_is_fatal() {
    let images = (0..3)
        .map(|i| ImageData::new(format!("/upload/{}.png", i), fake_image(&[0.; DIM], "x")))
        .collect();
    let ctx = context(MemoryStore::default(), true);
    *ctx.embedder.fail_with.lock().unwrap() = Some(ProviderError::Auth("401".to_string()));

    let report = run(ImageSource::Memory(images), &ctx, &options(32, 1)).await;

    assert_eq!(report.accepted, 0);
    assert!(matches!(report.fatal, Some(Error::Provider(ProviderError::Auth(_)))));
    assert!(!report.cancelled);
    assert_eq!(ctx.store.count_now(), 0);
}

#[tokio::test]
async fn permanent_provider_error_skips_record() {
    let ctx = context(MemoryStore::default(), true);
    *ctx.embedder.fail_with.lock().unwrap() =
        Some(ProviderError::QuotaExhausted("quota".to_string()));
    let source = ImageSource::Memory(vec![ImageData::new("/a.png", fake_image(&[0.; DIM], "x"))]);

    let report = run(source, &ctx, &options(32, 1)).await;

    assert_eq!(report.skipped(SkipReason::ProviderFailed), 1);
    assert!(report.fatal.is_none());
    assert_eq!(ctx.embedder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_provider_error_is_retried() {
    let ctx = context(MemoryStore::default(), true);
    ctx.embedder.transient_failures.store(2, Ordering::SeqCst);
    let source = ImageSource::Memory(vec![ImageData::new("/a.png", fake_image(&[0.; DIM], "x"))]);

    let report = run(source, &ctx, &options(32, 1)).await;

    assert_eq!(report.accepted, 1);
    assert_eq!(ctx.embedder.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn captions_are_optional() {
    let ctx = context(MemoryStore::default(), false);
    let source = ImageSource::Memory(vec![ImageData::new("/a.png", fake_image(&[0.; DIM], "x"))]);

    let report = run(source, &ctx, &options(32, 1)).await;

    assert_eq!(report.accepted, 1);
    let records = ctx.store.records.lock().unwrap();
    assert!(records.values().all(|r| r.caption.is_empty()));
}

#[rstest]
#[tokio::test]
async fn cancelled_before_start(dir: TempDir) {
    write_images(dir.path(), 3);
    let ctx = context(MemoryStore::default(), true);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = ingest(
        ImageSource::Directory(dir.path().into()),
        &ctx,
        &options(32, 2),
        &cancel,
        ProgressBar::hidden(),
    )
    .await;

    assert!(report.cancelled);
    assert_eq!(report.accepted, 0);
    assert_eq!(ctx.store.count_now(), 0);
}

#[rstest]
#[tokio::test]
async fn missing_directory_is_fatal(dir: TempDir) {
    let ctx = context(MemoryStore::default(), true);
    let source = ImageSource::Directory(dir.path().join("missing"));

    let report = run(source, &ctx, &options(32, 2)).await;

    assert!(matches!(report.fatal, Some(Error::Config(_))));
    assert_eq!(report.accepted, 0);
}

fn archive_entries() -> [(&'static str, Vec<u8>); 4] {
    [
        ("pack/a.png", fake_image(&[1., 0., 0., 0.], "cat")),
        ("pack/b.jpg", fake_image(&[0., 1., 0., 0.], "dog")),
        ("pack/readme.md", b"# readme".to_vec()),
        ("__MACOSX/pack/._a.png", b"resource fork".to_vec()),
    ]
}

async fn assert_archive_ingested(archive: &Path) {
    let ctx = context(MemoryStore::default(), true);
    let report = run(ImageSource::from_path(archive), &ctx, &options(32, 2)).await;

    assert!(report.fatal.is_none(), "{:?}", report.fatal);
    assert_eq!(report.scanned, 3);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.skipped(SkipReason::UnsupportedFormat), 1);

    let records = ctx.store.records.lock().unwrap();
    let mut names = records.values().map(|r| r.file_name.as_str()).collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["a.png", "b.jpg"]);
    let prefix = format!("{}!/pack/", archive.display());
    assert!(records.values().all(|r| r.file_path.starts_with(&prefix)));
}

#[rstest]
#[case::tar("pack.tar")]
#[case::gzip("pack.tar.gz")]
#[case::bzip2("pack.tar.bz2")]
#[case::xz("pack.tar.xz")]
#[tokio::test]
async fn ingest_tar_archive(dir: TempDir, #[case] name: &str) {
    let tar_path = dir.path().join(name);
    let file = tokio::fs::File::create(&tar_path).await.unwrap();
    let writer: Box<dyn AsyncWrite + Unpin + Send> = match name.rsplit_once('.').unwrap().1 {
        "gz" => Box::new(GzipEncoder::new(file)),
        "bz2" => Box::new(BzEncoder::new(file)),
        "xz" => Box::new(XzEncoder::new(file)),
        _ => Box::new(file),
    };
    let mut builder = tokio_tar::Builder::new(writer);
    for (path, data) in &archive_entries() {
        let mut header = tokio_tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_slice()).await.unwrap();
    }
    let mut writer = builder.into_inner().await.unwrap();
    writer.shutdown().await.unwrap();

    assert_archive_ingested(&tar_path).await;
}

#[rstest]
#[tokio::test]
async fn ingest_zip_archive(dir: TempDir) {
    let zip_path = dir.path().join("pack.zip");
    let mut writer = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
    let options = zip::write::FileOptions::default();
    writer.add_directory("pack/", options).unwrap();
    for (path, data) in &archive_entries() {
        writer.start_file(*path, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();

    assert_archive_ingested(&zip_path).await;
}

#[rstest]
#[tokio::test]
async fn unknown_archive_format_is_fatal(dir: TempDir) {
    let path = dir.path().join("pack.rar");
    fs::write(&path, b"not an archive").unwrap();
    let ctx = context(MemoryStore::default(), true);

    let report = run(ImageSource::from_path(&path), &ctx, &options(32, 2)).await;

    assert!(matches!(report.fatal, Some(Error::Config(_))), "{:?}", report.fatal);
    assert_eq!(report.accepted, 0);
}
