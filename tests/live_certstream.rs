//! Live test against a real certificate stream.
//!
//! Needs network access and is enabled with the `live-tests` feature:
//! `cargo test --test live_certstream --features live-tests -- --ignored --nocapture`
//!
//! Set `CABALWATCH_LIVE_URL` to use a server other than the default one.

#![cfg(feature = "live-tests")]

mod helpers;

use cabalwatch::config::StreamConfig;
use cabalwatch::network::{ConnectionState, StreamConnection, StreamSettings, TungsteniteConnector};
use helpers::mock_output::RecordingObserver;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ignore]
async fn test_live_stream_delivers_certificates() {
    let mut stream = StreamConfig::default();
    if let Ok(url) = std::env::var("CABALWATCH_LIVE_URL") {
        stream.certstream_url = url;
    }

    let connector = Arc::new(TungsteniteConnector::new(
        stream.allow_invalid_certs,
        stream.connect_timeout(),
    ));
    let observer = RecordingObserver::default();
    let connection = StreamConnection::new(
        stream.certstream_url.clone(),
        connector,
        observer.clone(),
        StreamSettings::from(&stream),
    );
    let handle = connection.spawn(2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while observer.seen().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let seen = observer.seen();
    assert!(
        !seen.is_empty(),
        "no certificate from {} within 30s",
        stream.certstream_url
    );
    assert!(seen[0].iter().all(|domain| !domain.is_empty()));
    assert_eq!(handle.state(), ConnectionState::Connected);

    handle.disconnect();
    assert!(handle.join().await.is_ok());
}
