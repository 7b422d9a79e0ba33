mod common;

use anyhow::Result;
use card_show_scraper::domain::ShowStatus;
use card_show_scraper::pipeline::extractor::ExtractionError;
use card_show_scraper::pipeline::fetcher::FetchError;
use card_show_scraper::pipeline::{Pipeline, RunOptions, SourceStatus};
use card_show_scraper::storage::{InMemoryStorage, SqliteStorage, Storage};
use chrono::NaiveDate;
use common::{register, test_config, today, MockExtractionClient, MockFetcher};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const S1: &str = "https://cardshows.example/indiana";
const S2: &str = "https://events.example/pa";
const S3: &str = "https://calendar.example/pa";

fn options() -> RunOptions {
    RunOptions {
        include_disabled: false,
        today: today(),
    }
}

/// Two listings far enough apart to land in separate chunks.
fn indiana_page() -> String {
    format!(
        "<ul><li>Monthly Card Show - Aug 2, 2025, Indianapolis, IN, LaQuinta Inn</li>{}<li>Card Show Extravaganza - July 10, 2019, Boston, MA</li></ul>",
        "<p>filler</p>".repeat(30)
    )
}

fn indiana_client() -> MockExtractionClient {
    MockExtractionClient::new()
        .on(
            "Indianapolis",
            json!({
                "name": "Monthly Card Show",
                "startDate": "Aug 2, 2025",
                "city": "Indianapolis",
                "state": "IN",
                "venueName": "LaQuinta Inn"
            }),
        )
        .on(
            "Boston",
            json!({
                "name": "Card Show Extravaganza",
                "startDate": "July 10, 2019",
                "city": "Boston",
                "state": "MA"
            }),
        )
}

#[tokio::test]
async fn test_recent_show_kept_and_past_show_dropped() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    register(storage.as_ref(), &[S1]).await;
    let fetcher = Arc::new(MockFetcher::new().page(S1, &indiana_page()));
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(indiana_client()));

    let report = pipeline.run(options()).await?;

    let pending = storage.list_pending(Some(ShowStatus::Pending)).await?;
    assert_eq!(pending.len(), 1);
    let show = &pending[0].raw_payload;
    assert_eq!(show.name, "Monthly Card Show");
    assert_eq!(show.start_date, NaiveDate::from_ymd_opt(2025, 8, 2).unwrap());
    assert_eq!(show.city.as_deref(), Some("Indianapolis"));
    assert!(pending.iter().all(|p| p.raw_payload.city.as_deref() != Some("Boston")));

    let source = report.source(S1).unwrap();
    assert_eq!(source.status, SourceStatus::Succeeded);
    assert!(source.chunks_total >= 2);
    assert_eq!(source.inserted, 1);
    assert_eq!(source.dropped, 1);
    Ok(())
}

#[tokio::test]
async fn test_rescrape_is_idempotent() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    register(storage.as_ref(), &[S1]).await;
    let fetcher = Arc::new(MockFetcher::new().page(S1, &indiana_page()));
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(indiana_client()));

    let first = pipeline.run(options()).await?;
    let second = pipeline.run(options()).await?;

    assert_eq!(first.inserted(), 1);
    assert_eq!(second.inserted(), 0);
    assert_eq!(second.merged(), 1);
    assert_eq!(storage.list_pending(None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_rescrape_is_idempotent_on_sqlite() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("shows.db"))?);
    register(storage.as_ref(), &[S1]).await;
    let fetcher = Arc::new(MockFetcher::new().page(S1, &indiana_page()));
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(indiana_client()));

    pipeline.run(options()).await?;
    pipeline.run(options()).await?;

    assert_eq!(storage.list_pending(None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_same_show_from_two_sources_is_one_pending_row() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    register(storage.as_ref(), &[S2, S3]).await;
    let fetcher = Arc::new(
        MockFetcher::new()
            .page(S2, "<div>EXPO-A Sports Card Expo at Liberty Convention Center</div>")
            .page(S3, "<div>EXPO-B Sports Card Expo at Liberty Convention Hall</div>"),
    );
    let client = MockExtractionClient::new()
        .on(
            "EXPO-A",
            json!({
                "name": "Sports Card Expo",
                "startDate": "2025-08-15",
                "venueName": "Liberty Convention Center",
                "city": "Philadelphia",
                "state": "PA"
            }),
        )
        .on(
            "EXPO-B",
            json!({
                "name": "Sports Card Expo",
                "startDate": "2025-08-16",
                "venueName": "Liberty Convention Hall",
                "city": "Philadelphia",
                "state": "Pennsylvania",
                "entryFee": "$5"
            }),
        );
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(client));

    let report = pipeline.run(options()).await?;

    let pending = storage.list_pending(Some(ShowStatus::Pending)).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(report.inserted(), 1);
    assert_eq!(report.merged(), 1);
    // The fee only one source had is filled in
    assert_eq!(pending[0].raw_payload.entry_fee, Some(5.0));
    Ok(())
}

#[tokio::test]
async fn test_failed_source_does_not_abort_batch() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let down = "https://down.example/shows";
    let broken_ai = "https://garbled.example/shows";
    register(storage.as_ref(), &[S1, down, broken_ai]).await;
    let fetcher = Arc::new(
        MockFetcher::new()
            .page(S1, &indiana_page())
            .failing(down, FetchError::Timeout)
            .page(broken_ai, "<p>GARBLED listings</p>"),
    );
    let client = indiana_client().raw_on("GARBLED", "Sorry, I can't help with that.");
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(client));

    let report = pipeline.run(options()).await?;

    assert_eq!(report.sources.len(), 3);
    assert_eq!(report.source(S1).unwrap().status, SourceStatus::Succeeded);
    assert_eq!(report.source(down).unwrap().status, SourceStatus::Failed);
    let garbled = report.source(broken_ai).unwrap();
    assert_eq!(garbled.status, SourceStatus::Failed);
    assert_eq!(garbled.chunks_failed, 1);
    assert_eq!(report.inserted(), 1);

    let down_source = storage.get_source(down).await?.unwrap();
    assert_eq!(down_source.error_streak, 1);
    assert!(down_source.last_error_at.is_some());
    // The page was fetched fine; only extraction failed
    let garbled_source = storage.get_source(broken_ai).await?.unwrap();
    assert_eq!(garbled_source.error_streak, 0);
    assert!(garbled_source.last_success_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_crashed_worker_still_reported() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let crashing = "https://crash.example/shows";
    register(storage.as_ref(), &[S1, crashing]).await;
    let fetcher = Arc::new(
        MockFetcher::new()
            .page(S1, &indiana_page())
            .panicking(crashing),
    );
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(indiana_client()));

    let report = pipeline.run(options()).await?;

    assert_eq!(report.sources.len(), 2);
    let crashed = report.source(crashing).unwrap();
    assert_eq!(crashed.status, SourceStatus::Failed);
    assert!(crashed.error.as_deref().unwrap_or_default().contains("worker aborted"));
    assert_eq!(report.source(S1).unwrap().status, SourceStatus::Succeeded);
    assert_eq!(report.inserted(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_chunk_skipped_other_chunks_kept() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    register(storage.as_ref(), &[S1]).await;
    let fetcher = Arc::new(MockFetcher::new().page(S1, &indiana_page()));
    let client = indiana_client().fail_on("Boston", ExtractionError::Timeout);
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(client));

    let report = pipeline.run(options()).await?;

    let source = report.source(S1).unwrap();
    assert_eq!(source.status, SourceStatus::Succeeded);
    assert_eq!(source.chunks_failed, 1);
    assert_eq!(source.inserted, 1);
    Ok(())
}

#[tokio::test]
async fn test_repeated_fetch_failures_disable_source() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let down = "https://down.example/shows";
    register(storage.as_ref(), &[down]).await;
    let mut config = test_config();
    config.feedback.error_streak_threshold = 2;
    let fetcher = Arc::new(MockFetcher::new().failing(down, FetchError::HttpStatus(503)));
    let pipeline = Pipeline::new(&config, storage.clone(), fetcher.clone(), Arc::new(MockExtractionClient::new()));

    pipeline.run(options()).await?;
    pipeline.run(options()).await?;
    assert!(!storage.get_source(down).await?.unwrap().enabled);

    // Disabled sources are skipped unless explicitly included
    let report = pipeline.run(options()).await?;
    assert!(report.sources.is_empty());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_between_sources_keeps_completed_work() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let urls = [S1, "https://b.example", "https://c.example"];
    register(storage.as_ref(), &urls).await;
    let mut config = test_config();
    config.pipeline.worker_pool_size = 1;
    let fetcher = Arc::new(
        MockFetcher::new()
            .page(urls[0], &indiana_page())
            .page(urls[1], &indiana_page())
            .page(urls[2], &indiana_page()),
    );
    let pipeline = Pipeline::new(&config, storage.clone(), fetcher.clone(), Arc::new(indiana_client()));
    fetcher.cancel_on_fetch(pipeline.cancel_flag());

    let report = pipeline.run(options()).await?;

    assert!(report.cancelled);
    assert_eq!(report.sources.len(), 3);
    assert_eq!(report.count(SourceStatus::Cancelled), 2);
    assert_eq!(report.count(SourceStatus::Succeeded), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(storage.list_pending(Some(ShowStatus::Pending)).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_budget_marks_source_partial() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    register(storage.as_ref(), &[S1]).await;
    let mut config = test_config();
    config.pipeline.source_budget_secs = 0;
    let fetcher = Arc::new(MockFetcher::new().page(S1, &indiana_page()));
    let client = Arc::new(indiana_client());
    let pipeline = Pipeline::new(&config, storage.clone(), fetcher, client.clone());

    let report = pipeline.run(options()).await?;

    let source = report.source(S1).unwrap();
    assert_eq!(source.status, SourceStatus::PartiallyProcessed);
    assert!(source.chunks_processed < source.chunks_total);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_prose_wrapped_response_is_repaired() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    register(storage.as_ref(), &[S1]).await;
    let fetcher = Arc::new(MockFetcher::new().page(S1, "<p>WRAPPED</p>"));
    let client = MockExtractionClient::new().raw_on(
        "WRAPPED",
        "Here is what I found:\n```json\n[{\"name\": \"Hobby Show\", \"startDate\": \"2025-03-08\", \"city\": \"Dayton\", \"state\": \"Ohio\"}]\n```",
    );
    let pipeline = Pipeline::new(&test_config(), storage.clone(), fetcher, Arc::new(client));

    pipeline.run(options()).await?;

    let pending = storage.list_pending(None).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].raw_payload.state.as_deref(), Some("OH"));
    Ok(())
}
