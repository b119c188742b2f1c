/// Integration tests with a mocked lead store
/// Exercises the store client and backend adapter against a fake Realtime Database REST API
use rust_phone_leads::errors::{AppError, WriteFailure};
use rust_phone_leads::integrations::adapter::{AdapterSettings, BackendAdapter};
use rust_phone_leads::integrations::store::{LeadStore, RtdbStore};
use rust_phone_leads::models::{LeadLocation, LeadSlot};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper function to create an adapter pointing at the mock server
fn create_test_adapter(server: &MockServer, write_timeout: Duration) -> BackendAdapter {
    let store = RtdbStore::new(&server.uri(), None, Duration::from_secs(10)).unwrap();
    BackendAdapter::new(
        Arc::new(store),
        AdapterSettings {
            write_timeout,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(2),
        },
    )
}

fn entry_location(slot: &str) -> LeadLocation {
    LeadLocation {
        city: "Austin".to_string(),
        business_type: "plumber".to_string(),
        batch_key: "b1".to_string(),
        slot: LeadSlot::Entry(slot.to_string()),
    }
}

fn lead_json(name: &str, score: f64) -> serde_json::Value {
    json!({
        "name": name,
        "phone": "(512) 472-3400",
        "overall_score": score,
        "analysis": {
            "tech_stack": {"score": 6},
            "operations": {"score": 7},
            "growth_potential": {"score": 8},
            "software_opportunity": {"score": 9}
        }
    })
}

async fn mount_exists(server: &MockServer, lead_path: &str) {
    Mock::given(method("GET"))
        .and(path(lead_path))
        .and(query_param("shallow", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_update_notes_patches_exact_path() {
    let mock_server = MockServer::start().await;
    mount_exists(&mock_server, "/phoneLeads/Austin/plumber/b1/leads/Joe's%20Plumbing.json").await;

    Mock::given(method("PATCH"))
        .and(path("/phoneLeads/Austin/plumber/b1/leads/Joe's%20Plumbing.json"))
        .and(body_json(json!({"notes": "call back after 5"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"notes": "call back after 5"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_secs(5));
    let result = adapter
        .update_notes(&entry_location("Joe's Plumbing"), "call back after 5")
        .await;

    assert!(result.is_ok(), "expected success, got {:?}", result);
}

#[tokio::test]
async fn test_mark_called_writes_flag_and_timestamp() {
    let mock_server = MockServer::start().await;
    mount_exists(&mock_server, "/phoneLeads/Austin/plumber/b1.json").await;

    Mock::given(method("PATCH"))
        .and(path("/phoneLeads/Austin/plumber/b1.json"))
        .and(body_partial_json(json!({
            "called": true,
            "called_at": "2024-03-30T15:04:05.123Z"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_secs(5));
    let single = LeadLocation {
        slot: LeadSlot::BatchNode,
        ..entry_location("unused")
    };
    let at = chrono::DateTime::parse_from_rfc3339("2024-03-30T15:04:05.123Z")
        .unwrap()
        .with_timezone(&chrono::Utc);

    adapter.mark_called(&single, at).await.unwrap();
}

#[tokio::test]
async fn test_delete_issues_delete() {
    let mock_server = MockServer::start().await;
    mount_exists(&mock_server, "/phoneLeads/Austin/plumber/b1/leads/0.json").await;

    Mock::given(method("DELETE"))
        .and(path("/phoneLeads/Austin/plumber/b1/leads/0.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_secs(5));
    adapter.delete_lead(&entry_location("0")).await.unwrap();
}

#[tokio::test]
async fn test_missing_lead_is_not_found_and_never_written() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/phoneLeads/Austin/plumber/b1/leads/3.json"))
        .and(query_param("shallow", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .mount(&mock_server)
        .await;

    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_secs(5));
    let err = adapter
        .update_notes(&entry_location("3"), "hello")
        .await
        .unwrap_err();

    assert!(err.is_not_found(), "expected NotFound, got {:?}", err);
}

#[tokio::test]
async fn test_store_rejection_is_write_failed() {
    let mock_server = MockServer::start().await;
    mount_exists(&mock_server, "/phoneLeads/Austin/plumber/b1/leads/0.json").await;

    Mock::given(method("PATCH"))
        .and(path("/phoneLeads/Austin/plumber/b1/leads/0.json"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_secs(5));
    let err = adapter
        .update_notes(&entry_location("0"), "x")
        .await
        .unwrap_err();

    match err {
        AppError::WriteFailed(WriteFailure::Rejected { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/phoneLeads/Austin/plumber/b1/leads/0.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!(true))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_millis(300));
    let err = adapter.delete_lead(&entry_location("0")).await.unwrap_err();

    assert!(matches!(err, AppError::WriteFailed(WriteFailure::Timeout)));
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(query_param("shallow", "true"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(5)
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_secs(5));
    let location = entry_location("0");

    for _ in 0..5 {
        let err = adapter.delete_lead(&location).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::WriteFailed(WriteFailure::Rejected { status: 503, .. })
        ));
    }

    let err = adapter.delete_lead(&location).await.unwrap_err();
    assert!(matches!(err, AppError::WriteFailed(WriteFailure::CircuitOpen)));
}

#[tokio::test]
async fn test_auth_token_is_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/phoneLeads.json"))
        .and(query_param("auth", "secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = RtdbStore::new(
        &mock_server.uri(),
        Some("secret-token".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();

    let tree = store.fetch_tree().await.unwrap();
    assert_eq!(tree, json!({}));
}

#[tokio::test]
async fn test_subscription_delivers_flattened_snapshot() {
    let mock_server = MockServer::start().await;

    // One valid array batch, one null batch, one single-lead batch
    let tree = json!({
        "Austin": {
            "plumber": {
                "b1": {"metadata": {"source": "maps"}, "leads": [lead_json("Joe's Plumbing", 8.0), null, lead_json("Ace Pipes", 3.0)]},
                "b2": null,
                "b3": lead_json("Solo Drains", 6.0)
            }
        }
    });
    let body = format!(
        "event: put\ndata: {}\n\nevent: keep-alive\ndata: null\n\n",
        json!({"path": "/", "data": tree})
    );

    Mock::given(method("GET"))
        .and(path("/phoneLeads.json"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&mock_server)
        .await;

    let adapter = create_test_adapter(&mock_server, Duration::from_secs(5));
    let (snapshots_tx, mut snapshots) = mpsc::unbounded_channel();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();

    let subscription = adapter.subscribe(
        move |snapshot| {
            let _ = snapshots_tx.send(snapshot);
        },
        move |err| {
            let _ = errors_tx.send(err);
        },
    );

    let snapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("no snapshot delivered")
        .unwrap();

    let mut names: Vec<&str> = snapshot
        .records
        .iter()
        .map(|r| r.lead.name.as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Ace Pipes", "Joe's Plumbing", "Solo Drains"]);
    assert!(snapshot.records.iter().all(|r| r.city == "Austin"));
    assert_eq!(snapshot.malformed.len(), 1);

    // The body ends after two events, which reads as a dropped connection.
    let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("no feed error delivered")
        .unwrap();
    assert!(matches!(err, AppError::SubscriptionFailed(_)));

    subscription.unsubscribe();
}
