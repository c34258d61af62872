//! End-to-end dispatch: embedded workers, offline users, degraded relay.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use ridenow::queue::{MemoryProcessedSet, MemoryRideQueue};
use ridenow::rides::{NewUser, RideRepository, RideStore};
use ridenow::worker::{AssignmentOutcome, AssignmentWorker, WorkerSettings};
use ridenow::{App, AppConfig, Role};
use ridenow_protocol::{RideId, RideStatus, UserId};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

mod common;
use common::{
    DRIVER, OTHER_DRIVER, RIDER, TestServer, assert_silent, eventually, next_event,
    seeded_database, send_json, test_config,
};

fn with_embedded_worker() -> AppConfig {
    let mut config = test_config();
    config.worker.embedded = true;
    config.worker.instances = 1;
    config
}

async fn post_ride(server: &TestServer, user_id: &str) -> (StatusCode, Value) {
    let response = server
        .app
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/rides")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", server.token(user_id)),
                )
                .body(Body::from(json!({"pickup": "A", "dropoff": "B"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn ride_status(repo: &RideRepository, ride_id: i64) -> RideStatus {
    repo.get_ride(RideId::new(ride_id))
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn test_worker_assigns_first_driver_and_notifies_both() {
    let server = TestServer::start_with(with_embedded_worker()).await;
    let mut rider = server.connect(RIDER).await;
    let mut driver = server.connect(DRIVER).await;

    send_json(
        &mut rider,
        json!({"event": "ride_request", "payload": {"pickup": "A", "dropoff": "B"}}),
    )
    .await;
    let ack = next_event(&mut rider).await;
    assert_eq!(ack["event"], "ride_created");
    assert_eq!(ack["payload"]["queued"], true);

    assert_eq!(next_event(&mut driver).await["event"], "new_ride");

    let assigned = next_event(&mut rider).await;
    assert_eq!(assigned["event"], "ride_assigned");
    assert_eq!(assigned["payload"]["driver_id"], DRIVER);

    let assigned = next_event(&mut driver).await;
    assert_eq!(assigned["event"], "ride_assigned");
    assert_eq!(assigned["payload"]["ride_id"], ack["payload"]["ride_id"]);

    assert_eq!(server.app.worker_stats().snapshot().assigned, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_offline_rider_is_not_an_error() {
    let server = TestServer::start_with(with_embedded_worker()).await;
    let repo = RideRepository::new(server.database.pool().clone());

    let (status, created) = post_ride(&server, RIDER).await;
    assert_eq!(status, StatusCode::CREATED);
    let ride_id = created["id"].as_i64().unwrap();

    let repo_ref = &repo;
    eventually(|| async move { ride_status(repo_ref, ride_id).await == RideStatus::Assigned })
        .await;

    // Reconnecting later shows the stored result.
    let mut rider = server.connect(RIDER).await;
    assert_silent(&mut rider, Duration::from_millis(200)).await;
    let ride = repo.get_ride(RideId::new(ride_id)).await.unwrap().unwrap();
    assert_eq!(ride.driver_id, Some(UserId::from(DRIVER)));

    let stats = server.app.worker_stats().snapshot();
    assert_eq!(stats.assigned, 1);
    assert_eq!(stats.exhausted, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_no_drivers_exhausts_retries() {
    let server = TestServer::start_with(with_embedded_worker()).await;
    let repo = RideRepository::new(server.database.pool().clone());
    for id in [DRIVER, OTHER_DRIVER] {
        repo.upsert_user(&NewUser {
            id: UserId::from(id),
            name: format!("user {id}"),
            email: None,
            is_driver: false,
        })
        .await
        .unwrap();
    }

    let mut rider = server.connect(RIDER).await;
    let (status, created) = post_ride(&server, RIDER).await;
    assert_eq!(status, StatusCode::CREATED);
    let ride_id = created["id"].as_i64().unwrap();

    let stats = server.app.worker_stats().clone();
    eventually(|| {
        let stats = stats.clone();
        async move { stats.snapshot().exhausted == 1 }
    })
    .await;

    assert_eq!(ride_status(&repo, ride_id).await, RideStatus::Requested);
    assert_silent(&mut rider, Duration::from_millis(200)).await;
    server.stop().await;
}

#[tokio::test]
async fn test_late_queue_delivery_leaves_accepted_ride_alone() {
    let server = TestServer::start().await;
    let mut rider = server.connect(RIDER).await;
    let mut other_driver = server.connect(OTHER_DRIVER).await;

    send_json(
        &mut rider,
        json!({"event": "ride_request", "payload": {"pickup": "A", "dropoff": "B"}}),
    )
    .await;
    let ride_id = next_event(&mut rider).await["payload"]["ride_id"]
        .as_i64()
        .unwrap();
    next_event(&mut other_driver).await;

    send_json(
        &mut other_driver,
        json!({"event": "ride_accept", "payload": {"ride_id": ride_id}}),
    )
    .await;
    assert_eq!(
        next_event(&mut other_driver).await["event"],
        "ride_assigned_success"
    );
    assert_eq!(next_event(&mut rider).await["event"], "ride_assigned");

    // A worker that only now dequeues the id must not reassign it.
    let repo = Arc::new(RideRepository::new(server.database.pool().clone()));
    let worker = AssignmentWorker::new(
        "late",
        repo.clone(),
        Arc::new(MemoryRideQueue::new()),
        Arc::new(MemoryProcessedSet::new()),
        server.app.state().dispatcher().clone(),
        WorkerSettings::default(),
    );
    let outcome = worker
        .process(RideId::new(ride_id), &CancellationToken::new())
        .await;
    assert_eq!(
        outcome,
        AssignmentOutcome::AlreadyAdvanced {
            status: Some(RideStatus::Assigned)
        }
    );

    let ride = repo.get_ride(RideId::new(ride_id)).await.unwrap().unwrap();
    assert_eq!(ride.driver_id, Some(UserId::from(OTHER_DRIVER)));
    assert_silent(&mut rider, Duration::from_millis(200)).await;
    server.stop().await;
}

#[tokio::test]
async fn test_standalone_worker_polls_store() {
    let database = seeded_database().await;
    let mut config = test_config();
    config.queue.poll_interval_ms = 20;

    let mut app = App::build(config, &database, Role::Worker).await.unwrap();
    app.start_background();

    let repo = RideRepository::new(database.pool().clone());
    let ride = repo
        .create_ride(&UserId::from(RIDER), "A", "B")
        .await
        .unwrap();

    let repo_ref = &repo;
    let ride_id = ride.id.get();
    eventually(|| async move { ride_status(repo_ref, ride_id).await == RideStatus::Assigned })
        .await;
    assert_eq!(app.worker_stats().snapshot().assigned, 1);
    app.shutdown().await;
}

#[tokio::test]
async fn test_server_without_workers_hands_rides_to_standalone_worker() {
    let server = TestServer::start().await;
    let mut rider = server.connect(RIDER).await;

    let (status, created) = post_ride(&server, RIDER).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["queued"], false);
    let ride_id = created["id"].as_i64().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let repo = RideRepository::new(server.database.pool().clone());
    assert_eq!(ride_status(&repo, ride_id).await, RideStatus::Requested);

    let mut config = test_config();
    config.queue.poll_interval_ms = 20;
    let mut worker = App::build(config, &server.database, Role::Worker)
        .await
        .unwrap();
    worker.start_background();

    let repo_ref = &repo;
    eventually(|| async move { ride_status(repo_ref, ride_id).await == RideStatus::Assigned })
        .await;
    assert_eq!(worker.worker_stats().snapshot().assigned, 1);

    // Local relay: the worker's process has no sessions to notify.
    assert_silent(&mut rider, Duration::from_millis(200)).await;
    worker.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_redis_degrades_to_local_delivery() {
    let mut config = test_config();
    config.relay.backend = ridenow::config::RelayBackend::Redis;
    config.relay.redis_url = "redis://127.0.0.1:1".to_string();
    config.relay.connect_timeout_ms = 200;

    let server = TestServer::start_with(config).await;
    assert_eq!(
        server.app.relay_mode(),
        ridenow::relay::RelayMode::Degraded
    );

    let response = server
        .app
        .router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["relay_mode"], "degraded");

    let mut rider = server.connect(RIDER).await;
    let mut driver = server.connect(DRIVER).await;
    send_json(
        &mut rider,
        json!({"event": "ride_request", "payload": {"pickup": "A", "dropoff": "B"}}),
    )
    .await;
    assert_eq!(next_event(&mut rider).await["event"], "ride_created");
    assert_eq!(next_event(&mut driver).await["event"], "new_ride");
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_redis_without_degraded_mode_fails() {
    let mut config = test_config();
    config.relay.backend = ridenow::config::RelayBackend::Redis;
    config.relay.redis_url = "redis://127.0.0.1:1".to_string();
    config.relay.connect_timeout_ms = 200;
    config.relay.allow_degraded = false;

    let database = seeded_database().await;
    assert!(App::build(config, &database, Role::Server).await.is_err());
}
