//! Integration tests for the media-relay pipeline
//!
//! Each test runs real transfers against a local wiremock host and records
//! delivery on the in-memory surface.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use media_relay::surface::memory::ScriptedFailure;
use media_relay::surface::SendStrategy;
use media_relay::{
    Coordinator, FailureKind, HostRule, MemorySurface, RelayConfig, ShutdownPolicy,
    SourceResolver, TransferRequest, TransferState,
};
use tempfile::{tempdir, TempDir};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Share-link rule for the local test host, shaped like the pixeldrain one
fn local_share_link(url: &Url) -> Option<Url> {
    let id = url.path().strip_prefix("/u/")?.to_string();
    let mut out = url.clone();
    out.set_path(&format!("/api/file/{id}"));
    out.set_query(Some("download"));
    Some(out)
}

fn local_resolver() -> SourceResolver {
    SourceResolver::empty().with_rule(HostRule::new("local", "127.0.0.1", local_share_link))
}

fn test_config(temp: &TempDir) -> RelayConfig {
    RelayConfig {
        temp_dir: temp.path().join("artifacts"),
        download_time_ceiling: Duration::from_secs(20),
        upload_time_ceiling: Duration::from_secs(20),
        staleness_threshold: Duration::from_secs(90 * 60),
        retry_attempts: 0,
        ..Default::default()
    }
}

fn start(
    config: RelayConfig,
    resolver: SourceResolver,
) -> (Coordinator, Arc<MemorySurface>) {
    let surface = Arc::new(MemorySurface::new());
    let coordinator = Coordinator::with_resolver(config, surface.clone(), resolver).unwrap();
    (coordinator, surface)
}

fn artifact_count(temp: &TempDir) -> usize {
    std::fs::read_dir(temp.path().join("artifacts")).unwrap().count()
}

fn last_status_text(surface: &MemorySurface) -> String {
    use media_relay::surface::memory::SurfaceEvent;
    surface
        .events()
        .iter()
        .rev()
        .find_map(|event| match event {
            SurfaceEvent::StatusSent { text, .. } | SurfaceEvent::Edited { text, .. } => {
                Some(text.clone())
            }
            _ => None,
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_share_link_is_rewritten_delivered_and_scheduled_for_expiry() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..50_000).map(|i| (i % 256) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/api/file/abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, surface) = start(test_config(&temp), local_resolver());

    let raw_url = format!("{}/u/abc123", server.uri());
    let request = TransferRequest::new(7, "12", "720p", raw_url, "Big Movie");
    let before = Utc::now();
    let state = coordinator.begin_transfer(request).wait().await;

    let TransferState::Delivered { message, expires_at } = state else {
        panic!("Expected delivery, got {state:?}");
    };
    let ttl = (expires_at - before).num_seconds();
    assert!((899..=905).contains(&ttl), "expiry {ttl}s from now");

    let sent = surface.sent_files();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, message);
    assert_eq!(sent[0].1, SendStrategy::InlineMedia);
    assert_eq!(sent[0].2, "Big_Movie_720p.mp4");
    assert_eq!(surface.content_of(&message).unwrap(), body);

    assert_eq!(coordinator.expiry().pending(), 1);
    assert_eq!(artifact_count(&temp), 0, "artifact must be cleaned up");
    assert!(last_status_text(&surface).starts_with("Sent Big Movie (720p)"));
}

#[tokio::test]
async fn test_size_hint_above_ceiling_fails_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
        .expect(0)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, surface) = start(test_config(&temp), local_resolver());

    let raw_url = format!("{}/u/huge", server.uri());
    let request = TransferRequest::new(7, "13", "1080p", raw_url.clone(), "Huge Movie")
        .with_size_hint(Some(3 * 1024 * 1024 * 1024));
    let state = coordinator.begin_transfer(request).wait().await;

    assert_eq!(
        state,
        TransferState::Failed {
            reason: FailureKind::TooLarge,
            raw_url: raw_url.clone()
        }
    );
    assert!(surface.sent_files().is_empty());
    assert_eq!(artifact_count(&temp), 0);
    assert!(last_status_text(&surface).contains(&raw_url));
}

#[tokio::test]
async fn test_declared_length_above_ceiling_leaves_no_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/big.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 8192]))
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let config = RelayConfig {
        size_ceiling: 4096,
        ..test_config(&temp)
    };
    let (coordinator, surface) = start(config, SourceResolver::empty());

    let raw_url = format!("{}/files/big.mp4", server.uri());
    let state = coordinator
        .begin_transfer(TransferRequest::new(1, "14", "720p", raw_url.clone(), "Big"))
        .wait()
        .await;

    assert_eq!(
        state,
        TransferState::Failed {
            reason: FailureKind::TooLarge,
            raw_url
        }
    );
    assert!(surface.sent_files().is_empty());
    assert_eq!(artifact_count(&temp), 0);
}

#[tokio::test]
async fn test_extension_classified_url_is_downloaded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/clip.mkv"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![2u8; 4096]))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, surface) = start(test_config(&temp), SourceResolver::empty());

    let raw_url = format!("{}/files/clip.mkv", server.uri());
    let state = coordinator
        .begin_transfer(TransferRequest::new(1, "15", "480p", raw_url, "Clip"))
        .wait()
        .await;

    assert!(matches!(state, TransferState::Delivered { .. }), "{state:?}");
    assert_eq!(surface.sent_files()[0].2, "Clip_480p.mkv");
}

#[tokio::test]
async fn test_unstreamable_url_becomes_fallback_link_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, surface) = start(test_config(&temp), SourceResolver::empty());

    let raw_url = format!("{}/watch/42", server.uri());
    let state = coordinator
        .begin_transfer(TransferRequest::new(1, "16", "720p", raw_url.clone(), "Page"))
        .wait()
        .await;

    assert_eq!(
        state,
        TransferState::FallbackLink {
            raw_url: raw_url.clone()
        }
    );
    assert!(last_status_text(&surface).contains(&raw_url));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_transfer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/slow.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![3u8; 2048])
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, surface) = start(test_config(&temp), SourceResolver::empty());

    let raw_url = format!("{}/files/slow.mp4", server.uri());
    let request = TransferRequest::new(9, "17", "720p", raw_url, "Slow");

    let first = coordinator.begin_transfer(request.clone());
    let second = coordinator.begin_transfer(request.clone());
    assert!(!first.attached());
    assert!(second.attached());
    assert_eq!(coordinator.in_flight(), 1);

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert_eq!(a, b);
    assert_eq!(surface.sent_files().len(), 1);

    coordinator.shutdown().await;
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_inline_rejection_falls_back_to_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/movie.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 1024]))
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, surface) = start(test_config(&temp), SourceResolver::empty());
    surface.fail_next(SendStrategy::InlineMedia, ScriptedFailure::Rejected);

    let raw_url = format!("{}/files/movie.mp4", server.uri());
    let state = coordinator
        .begin_transfer(TransferRequest::new(2, "18", "720p", raw_url, "Movie"))
        .wait()
        .await;

    assert!(matches!(state, TransferState::Delivered { .. }), "{state:?}");
    let sent = surface.sent_files();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, SendStrategy::Document);
    assert_eq!(artifact_count(&temp), 0);
}

#[tokio::test]
async fn test_rejected_everywhere_surfaces_raw_link() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/movie.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 1024]))
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, surface) = start(test_config(&temp), SourceResolver::empty());
    surface.reject_always(SendStrategy::InlineMedia);
    surface.reject_always(SendStrategy::Document);

    let raw_url = format!("{}/files/movie.mp4", server.uri());
    let state = coordinator
        .begin_transfer(TransferRequest::new(2, "19", "720p", raw_url.clone(), "Movie"))
        .wait()
        .await;

    assert_eq!(
        state,
        TransferState::Failed {
            reason: FailureKind::UploadRejected,
            raw_url: raw_url.clone()
        }
    );
    assert_eq!(artifact_count(&temp), 0);
    assert!(last_status_text(&surface).contains(&raw_url));
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/gone.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let (coordinator, _surface) = start(test_config(&temp), SourceResolver::empty());

    let raw_url = format!("{}/files/gone.mp4", server.uri());
    let state = coordinator
        .begin_transfer(TransferRequest::new(2, "20", "720p", raw_url.clone(), "Gone"))
        .wait()
        .await;

    assert_eq!(
        state,
        TransferState::Failed {
            reason: FailureKind::NotFound,
            raw_url
        }
    );
    assert_eq!(artifact_count(&temp), 0);
}

#[tokio::test]
async fn test_shutdown_expires_delivered_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/movie.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![6u8; 512]))
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let config = RelayConfig {
        shutdown_policy: ShutdownPolicy::ExpireNow,
        ..test_config(&temp)
    };
    let (coordinator, surface) = start(config, SourceResolver::empty());

    let raw_url = format!("{}/files/movie.mp4", server.uri());
    let state = coordinator
        .begin_transfer(TransferRequest::new(3, "21", "720p", raw_url, "Movie"))
        .wait()
        .await;
    let TransferState::Delivered { message, .. } = state else {
        panic!("Expected delivery, got {state:?}");
    };
    assert!(surface.is_live(&message));

    coordinator.shutdown().await;
    assert!(!surface.is_live(&message));
    assert_eq!(coordinator.expiry().pending(), 0);
}

#[tokio::test]
async fn test_transfer_finishes_after_caller_stops_listening() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/episode.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![6u8; 20_000])
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let config = RelayConfig {
        shutdown_policy: ShutdownPolicy::Abandon,
        ..test_config(&temp)
    };
    let (coordinator, surface) = start(config, SourceResolver::empty());

    let raw_url = format!("{}/files/episode.mp4", server.uri());
    drop(coordinator.begin_transfer(TransferRequest::new(4, "30", "480p", raw_url, "Show")));
    coordinator.shutdown().await;

    let sent = surface.sent_files();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].3, 20_000);
    assert!(surface.is_live(&sent[0].0), "abandoned expiry leaves the file");
    assert_eq!(coordinator.in_flight(), 0);
    assert_eq!(artifact_count(&temp), 0);
    assert!(last_status_text(&surface).starts_with("Sent Show (480p)"));
}

/// The binary resolves share links without touching the network
#[test]
fn test_cli_resolve_prints_direct_link() {
    let output = Command::new(env!("CARGO_BIN_EXE_media-relay"))
        .args(["resolve", "https://pixeldrain.com/u/abc123"])
        .env_remove("TELEGRAM_BOT_TOKEN")
        .output()
        .expect("Failed to run media-relay");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), "https://pixeldrain.com/api/file/abc123?download");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("streamable"));
}
