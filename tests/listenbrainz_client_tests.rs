use listenbrainz_playlist_sync::api::listenbrainz::ListenBrainzClient;
use listenbrainz_playlist_sync::api::Catalog;
use listenbrainz_playlist_sync::error::{RemoteError, RemoteErrorKind};
use mockito::{Matcher, Server};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use std::time::Duration;

fn client(base: &str) -> ListenBrainzClient {
    ListenBrainzClient::new(base).with_retry_policy(2, Duration::from_millis(1))
}

#[tokio::test]
async fn created_for_playlists_are_parsed_with_source_patch() {
    let mut server = Server::new_async().await;
    let body = json!({
        "playlists": [{
            "playlist": {
                "identifier": "https://listenbrainz.org/playlist/pl-1",
                "title": "Daily Jams for alice",
                "date": "2024-05-01T00:00:00+00:00",
                "extension": {
                    "https://musicbrainz.org/doc/jspf#playlist": {
                        "additional_metadata": { "algorithm_metadata": { "source_patch": "daily-jams" } }
                    }
                },
                "track": []
            }
        }]
    });
    let m = server
        .mock("GET", "/user/alice/playlists/createdfor")
        .match_header("authorization", "Token tok")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await;

    let playlists = client(&server.url()).created_for_playlists("alice", "tok").await.unwrap();
    m.assert_async().await;
    assert_eq!(playlists.len(), 1);
    assert_eq!(playlists[0].id, "pl-1");
    assert_eq!(playlists[0].source_patch, "daily-jams");
}

#[tokio::test]
async fn error_body_becomes_remote_error_without_retry() {
    let mut server = Server::new_async().await;
    let m = server
        .mock("GET", "/playlist/missing")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(r#"{"code":404,"error":"Cannot find playlist: missing"}"#)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server.url()).playlist("missing", "").await.unwrap_err();
    m.assert_async().await;
    assert_eq!(err.kind(), RemoteErrorKind::Remote);
    assert_eq!(
        err.to_string(),
        "ListenBrainz HTTP Error. Code: 404, Error: Cannot find playlist: missing"
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn malformed_error_body_is_a_decode_error() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/playlist/pl-1")
        .with_status(500)
        .with_body("<html>oops</html>")
        .create_async()
        .await;

    let err = client(&server.url()).playlist("pl-1", "").await.unwrap_err();
    assert_eq!(err.kind(), RemoteErrorKind::Decode);
}

#[tokio::test]
async fn too_many_requests_is_retried_then_surfaced() {
    let mut server = Server::new_async().await;
    let m = server
        .mock("GET", "/playlist/pl-1")
        .with_status(429)
        .with_body(r#"{"code":429,"error":"slow down"}"#)
        .expect(3)
        .create_async()
        .await;

    let err = client(&server.url()).playlist("pl-1", "").await.unwrap_err();
    m.assert_async().await;
    assert!(matches!(err, RemoteError::RateLimited));
}

#[tokio::test]
async fn empty_recommendations_are_a_domain_error() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/cf/recommendation/user/alice/recording")
        .match_query(Matcher::UrlEncoded("count".into(), "1000".into()))
        .with_status(204)
        .create_async()
        .await;

    let err = client(&server.url()).recommendations("alice", "").await.unwrap_err();
    assert_eq!(err.kind(), RemoteErrorKind::Domain);
    assert_eq!(err.to_string(), "No recommendations found for user alice");
}

#[tokio::test]
async fn recommendations_keep_feed_order() {
    let mut server = Server::new_async().await;
    let body = json!({
        "payload": {
            "last_updated": 1700000000,
            "mbids": [{ "recording_mbid": "m2" }, { "recording_mbid": "m1" }]
        }
    });
    let _m = server
        .mock("GET", "/cf/recommendation/user/alice/recording")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(body.to_string())
        .create_async()
        .await;

    let recs = client(&server.url()).recommendations("alice", "").await.unwrap();
    assert_eq!(recs.mbids, vec!["m2".to_string(), "m1".to_string()]);
    assert_eq!(recs.last_updated, 1_700_000_000);
}

#[tokio::test]
async fn recording_lookup_posts_mbids_and_maps_artists() {
    let mut server = Server::new_async().await;
    let m = server
        .mock("POST", "/metadata/recording")
        .match_body(Matcher::PartialJson(json!({ "recording_mbids": ["m1"], "inc": "artist" })))
        .with_status(200)
        .with_body(
            json!({
                "m1": {
                    "recording": { "name": "Song" },
                    "artist": { "artists": [{ "artist_mbid": "a1", "name": "Band" }] }
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let metadata = client(&server.url()).lookup_recordings(&["m1".to_string()], "tok").await.unwrap();
    m.assert_async().await;
    let song = &metadata["m1"];
    assert_eq!(song.name, "Song");
    assert_eq!(song.artist_mbids, vec!["a1".to_string()]);
}

#[tokio::test]
async fn low_remaining_quota_delays_for_reset_interval() {
    let lbz = ListenBrainzClient::new("http://localhost").with_rate_limit_threshold(5);

    let mut headers = HeaderMap::new();
    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("2"));
    headers.insert("x-ratelimit-reset-in", HeaderValue::from_static("0"));
    assert_eq!(lbz.process_rate_limit(&headers).await, Some(Duration::from_secs(0)));

    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("40"));
    assert_eq!(lbz.process_rate_limit(&headers).await, None);

    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("many"));
    assert_eq!(lbz.process_rate_limit(&headers).await, None);

    assert_eq!(lbz.process_rate_limit(&HeaderMap::new()).await, None);
}

#[tokio::test]
async fn error_response_with_low_quota_still_waits_for_reset() {
    let mut server = Server::new_async().await;
    let m = server
        .mock("GET", "/playlist/gone")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_header("x-ratelimit-remaining", "1")
        .with_header("x-ratelimit-reset-in", "1")
        .with_body(r#"{"code":404,"error":"nope"}"#)
        .expect(1)
        .create_async()
        .await;

    let started = std::time::Instant::now();
    let err = client(&server.url()).playlist("gone", "").await.unwrap_err();
    m.assert_async().await;
    assert!(started.elapsed() >= Duration::from_secs(1), "waited only {:?}", started.elapsed());
    assert_eq!(err.kind(), RemoteErrorKind::Remote);
    assert_eq!(err.to_string(), "ListenBrainz HTTP Error. Code: 404, Error: nope");
}
