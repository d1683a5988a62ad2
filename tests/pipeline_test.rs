//! End-to-end pipeline runs against the in-memory ledger and a mock backend.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jobmarket_sync::ledger::memory::{DisputeFixture, JobFixture};
use jobmarket_sync::ledger::LedgerFixture;
use jobmarket_sync::model::{ChatRole, Resolution};
use jobmarket_sync::transport::{MemoryTokenStore, SessionTokens};
use jobmarket_sync::{
    Address, AuthTransport, IdentityInput, LedgerError, LedgerProvider, MarketApi, MarketError,
    MemoryLedger, Pipeline, PipelineConfig, ProfileCache, TransportConfig,
};

fn addr(byte: u8) -> Address {
    Address::from_bytes([byte; 20])
}

fn job(address: u8, employer: u8, title: &str) -> JobFixture {
    JobFixture {
        address: addr(address),
        job_id: address as u64,
        employer: addr(employer),
        title: title.into(),
        ..Default::default()
    }
}

/// Backend with no registered users and empty threads.
async fn backend() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path_regex("^/users/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/messages/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    server
}

fn pipeline(
    server: &MockServer,
    read_only: Option<&MemoryLedger>,
    tokens: SessionTokens,
) -> Arc<Pipeline> {
    let transport = AuthTransport::new(
        TransportConfig {
            base_url: server.uri(),
            request_timeout: Duration::from_secs(5),
        },
        Arc::new(MemoryTokenStore::new(tokens)),
    );
    let api = Arc::new(MarketApi::new(Arc::new(transport)));
    let cache = Arc::new(ProfileCache::new(api.clone()));
    Arc::new(Pipeline::new(
        api,
        cache,
        read_only.map(|l| Arc::new(l.clone()) as Arc<dyn LedgerProvider>),
        PipelineConfig::default(),
    ))
}

#[tokio::test]
async fn scenario_a_cancelled_job_is_excluded() {
    let server = backend().await;
    let mut cancelled = job(0x02, 0xaa, "Second");
    cancelled.cancelled = true;
    let ledger = MemoryLedger::new(LedgerFixture {
        jobs: vec![job(0x01, 0xaa, "First"), cancelled, job(0x03, 0xcc, "Third")],
        ..Default::default()
    });

    let pipeline = pipeline(&server, Some(&ledger), SessionTokens::default());
    pipeline.set_identity(IdentityInput::disconnected());
    pipeline.refresh().await;

    let jobs = pipeline.snapshot().jobs;
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.address != addr(0x02)));
    assert!(pipeline.snapshot().diagnostics.is_empty());
}

#[tokio::test]
async fn scenario_b_tied_resolved_dispute_goes_against_worker() {
    let server = backend().await;
    let mut disputed = job(0x01, 0xaa, "Frontend build");
    disputed.assigned_workers = vec![addr(0xbb)];
    let ledger = MemoryLedger::new(LedgerFixture {
        jobs: vec![disputed],
        disputes: vec![DisputeFixture {
            job: addr(0x01),
            initiator: addr(0xbb),
            resolved: true,
            votes_for: 3,
            votes_against: 3,
            reason: "scope disagreement".into(),
            block_number: Some(42),
            ..Default::default()
        }],
        blocks: BTreeMap::from([(42, 1_710_000_000)]),
        ..Default::default()
    });

    let pipeline = pipeline(&server, Some(&ledger), SessionTokens::default());
    pipeline.set_identity(IdentityInput::disconnected());
    pipeline.refresh().await;

    let snapshot = pipeline.snapshot();
    let dispute = &snapshot.disputes[0];
    assert_eq!(dispute.resolution, Some(Resolution::AgainstWorker));
    assert_eq!(dispute.employer.name, "Unknown");

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["disputes"][0]["resolution"], "against_worker");
    assert_eq!(json["disputes"][0]["votes"]["for"], 3);
}

#[tokio::test]
async fn scenario_c_conversations_grouped_newest_first() {
    let server = backend().await;
    let (me, bb, cc) = (
        "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        "0xBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB",
        "0xcccccccccccccccccccccccccccccccccccccccc",
    );
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "sender": cc,
                "receiver": me,
                "content": "from cc",
                "createdAt": "2024-05-01T09:00:00Z"
            },
            {
                "sender": me,
                "receiver": bb,
                "content": "to bb",
                "createdAt": "2024-05-01T08:00:00Z"
            },
            {
                "sender": bb,
                "receiver": me,
                "content": "latest from bb",
                "createdAt": "2024-05-01T10:00:00Z"
            }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    let wallet = MemoryLedger::new(LedgerFixture::default()).with_id("wallet");

    let pipeline = pipeline(&server, None, SessionTokens::new("access", "refresh"));
    pipeline.set_identity(IdentityInput::connected(addr(0xaa), Arc::new(wallet)));
    pipeline.refresh().await;

    let conversations = pipeline.snapshot().conversations;
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].counterparty_address, addr(0xbb));
    assert_eq!(conversations[0].messages.len(), 2);
    assert_eq!(conversations[0].last_message.content, "latest from bb");
    assert_eq!(conversations[0].counterparty_display_name, "0xbbbb…bbbb");
    assert_eq!(conversations[1].counterparty_address, addr(0xcc));
}

#[tokio::test]
async fn scenario_d_tag_scan_stops_at_first_failure() {
    let server = backend().await;
    let mut tagged = job(0x01, 0xaa, "Tagged");
    tagged.tags = vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()];
    let ledger = MemoryLedger::new(LedgerFixture {
        jobs: vec![tagged],
        ..Default::default()
    });
    ledger.fail_tag(addr(0x01), 3, LedgerError::Reverted("execution reverted".into()));

    let pipeline = pipeline(&server, Some(&ledger), SessionTokens::default());
    pipeline.set_identity(IdentityInput::disconnected());
    pipeline.refresh().await;

    assert_eq!(pipeline.snapshot().jobs[0].tags, vec!["a", "b", "c"]);
    assert_eq!(ledger.call_count("tag"), 4);
}

#[tokio::test]
async fn profile_lookups_are_shared_across_stages() {
    let server = backend().await;
    let ledger = MemoryLedger::new(LedgerFixture {
        jobs: vec![
            job(0x01, 0xaa, "One"),
            job(0x02, 0xaa, "Two"),
            job(0x03, 0xaa, "Three"),
        ],
        disputes: vec![DisputeFixture {
            job: addr(0x01),
            initiator: addr(0xbb),
            ..Default::default()
        }],
        ..Default::default()
    });

    let pipeline = pipeline(&server, Some(&ledger), SessionTokens::default());
    pipeline.set_identity(IdentityInput::disconnected());
    pipeline.refresh().await;

    // One employer referenced by three jobs and one dispute.
    let stats = pipeline.cache().stats();
    assert_eq!(stats.lookups, 1);
    let head_requests = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "HEAD")
        .count();
    assert_eq!(head_requests, 1);
}

#[tokio::test]
async fn driver_restages_on_identity_change() {
    let server = backend().await;
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    let ledger = MemoryLedger::new(LedgerFixture {
        jobs: vec![job(0x01, 0xaa, "Owned")],
        ..Default::default()
    });

    let pipeline = pipeline(&server, Some(&ledger), SessionTokens::new("access", "refresh"));
    let (identity_tx, identity_rx) = watch::channel(IdentityInput::disconnected());
    let mut snapshots = pipeline.subscribe();
    let driver = tokio::spawn(Arc::clone(&pipeline).drive(identity_rx));

    identity_tx
        .send(IdentityInput::connected(addr(0xaa), Arc::new(ledger.clone())))
        .unwrap();

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        snapshots.wait_for(|s| s.identity.is_connected && !s.employer_jobs.is_empty()),
    )
    .await
    .expect("connected snapshot")
    .unwrap()
    .clone();
    assert_eq!(snapshot.employer_jobs[0].summary.title, "Owned");

    drop(identity_tx);
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver stops when identity source closes")
        .unwrap();
}

#[tokio::test]
async fn forced_logout_resets_identity() {
    let server = backend().await;
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    let ledger = MemoryLedger::new(LedgerFixture {
        jobs: vec![job(0x01, 0xaa, "Listed")],
        ..Default::default()
    });

    let pipeline = pipeline(&server, Some(&ledger), SessionTokens::new("expired", "revoked"));
    let (identity_tx, identity_rx) =
        watch::channel(IdentityInput::connected(addr(0xaa), Arc::new(ledger.clone())));
    let mut snapshots = pipeline.subscribe();
    tokio::spawn(Arc::clone(&pipeline).drive(identity_rx));

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        snapshots.wait_for(|s| s.generation >= 2 && !s.identity.is_connected && !s.jobs.is_empty()),
    )
    .await
    .expect("snapshot after forced logout")
    .unwrap()
    .clone();

    // Public browsing continues on the read-only provider.
    assert_eq!(snapshot.jobs.len(), 1);
    assert!(snapshot.conversations.is_empty());
    drop(identity_tx);
}

/// Job 0x01 posted by 0xaa with 0xbb assigned, under dispute by 0xbb.
fn disputed_ledger() -> MemoryLedger {
    let mut disputed = job(0x01, 0xaa, "Disputed");
    disputed.assigned_workers = vec![addr(0xbb)];
    MemoryLedger::new(LedgerFixture {
        jobs: vec![disputed],
        disputes: vec![DisputeFixture {
            job: addr(0x01),
            initiator: addr(0xbb),
            ..Default::default()
        }],
        ..Default::default()
    })
}

async fn empty_conversations(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn slow_dispute_thread_does_not_hold_back_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path_regex("^/users/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/messages/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    empty_conversations(&server).await;
    let ledger = disputed_ledger();

    let pipeline = pipeline(&server, None, SessionTokens::new("access", "refresh"));
    pipeline.set_identity(IdentityInput::connected(addr(0xaa), Arc::new(ledger.clone())));
    let mut snapshots = pipeline.subscribe();
    let runner = Arc::clone(&pipeline);
    let refresh = tokio::spawn(async move { runner.refresh().await });

    let early = tokio::time::timeout(
        Duration::from_secs(1),
        snapshots.wait_for(|s| !s.jobs.is_empty() && !s.employer_jobs.is_empty()),
    )
    .await
    .expect("jobs published while the dispute thread is pending")
    .unwrap()
    .clone();
    assert_eq!(early.jobs.len(), 1);
    assert_eq!(early.employer_jobs[0].summary.title, "Disputed");
    assert!(early.disputes.is_empty());

    refresh.await.unwrap();
    assert_eq!(pipeline.snapshot().disputes.len(), 1);
}

#[tokio::test]
async fn dispute_message_is_appended_with_sender_role() {
    let server = backend().await;
    empty_conversations(&server).await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "disputeId": 0,
            "sender": addr(0xbb).to_string(),
            "content": "work was delivered",
            "createdAt": "2024-05-01T10:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let ledger = disputed_ledger();

    let pipeline = pipeline(&server, None, SessionTokens::new("access", "refresh"));
    pipeline.set_identity(IdentityInput::connected(addr(0xbb), Arc::new(ledger)));
    pipeline.refresh().await;

    let message = pipeline.post_dispute_message(0, "work was delivered").await.unwrap();
    assert_eq!(message.role, ChatRole::Worker);
    assert_eq!(message.sender_display_name, "Unknown");

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.disputes[0].messages, vec![message.clone()]);
    assert_eq!(snapshot.my_disputes[0].messages, vec![message]);

    assert!(matches!(
        pipeline.post_dispute_message(9, "lost").await,
        Err(MarketError::DisputeNotFound(9))
    ));
}

#[tokio::test]
async fn sent_chat_message_regroups_conversations() {
    let server = backend().await;
    let (me, bb, cc) = (addr(0xaa).to_string(), addr(0xbb).to_string(), addr(0xcc).to_string());
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "sender": cc,
                "receiver": me,
                "content": "from cc",
                "createdAt": "2024-05-01T09:00:00Z"
            }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sender": me,
            "receiver": bb,
            "content": "hello bb",
            "createdAt": "2024-05-01T10:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let wallet = MemoryLedger::new(LedgerFixture::default());

    let pipeline = pipeline(&server, None, SessionTokens::new("access", "refresh"));
    pipeline.set_identity(IdentityInput::connected(addr(0xaa), Arc::new(wallet)));
    pipeline.refresh().await;
    assert_eq!(pipeline.snapshot().conversations.len(), 1);

    let sent = pipeline.send_chat_message(&addr(0xbb), "hello bb").await.unwrap();
    assert_eq!(sent.receiver, addr(0xbb));

    let conversations = pipeline.snapshot().conversations;
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].counterparty_address, addr(0xbb));
    assert_eq!(conversations[0].last_message.content, "hello bb");
    assert_eq!(conversations[1].counterparty_address, addr(0xcc));
}

#[tokio::test]
async fn load_thread_returns_requested_page_oldest_first() {
    let server = backend().await;
    empty_conversations(&server).await;
    let (me, bb) = (addr(0xaa).to_string(), addr(0xbb).to_string());
    Mock::given(method("GET"))
        .and(path(format!("/chat/messages/{bb}")))
        .and(query_param("page", "2"))
        .and(query_param("limit", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "sender": bb,
                "receiver": me,
                "content": "third",
                "createdAt": "2024-05-01T10:00:00Z"
            },
            {
                "sender": me,
                "receiver": bb,
                "content": "first",
                "createdAt": "2024-05-01T08:00:00Z"
            },
            {
                "sender": bb,
                "receiver": me,
                "content": "second",
                "createdAt": "2024-05-01T09:00:00Z"
            }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    let wallet = MemoryLedger::new(LedgerFixture::default());

    let pipeline = pipeline(&server, None, SessionTokens::new("access", "refresh"));
    pipeline.set_identity(IdentityInput::connected(addr(0xaa), Arc::new(wallet)));

    let thread = pipeline.load_thread(&addr(0xbb), 2).await.unwrap();
    let contents: Vec<_> = thread.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["first", "second", "third"]);
}

#[tokio::test]
async fn created_dispute_appears_after_stage_rerun() {
    let server = backend().await;
    empty_conversations(&server).await;
    let mut assigned = job(0x01, 0xaa, "Assigned");
    assigned.assigned_workers = vec![addr(0xbb)];
    let wallet = MemoryLedger::new(LedgerFixture {
        jobs: vec![assigned],
        ..Default::default()
    });

    let pipeline = pipeline(&server, None, SessionTokens::new("access", "refresh"));
    pipeline.set_identity(IdentityInput::connected(addr(0xbb), Arc::new(wallet.clone())));
    pipeline.refresh().await;
    assert!(pipeline.snapshot().disputes.is_empty());

    let receipt = pipeline.create_dispute(&addr(0x01), "payment withheld").await.unwrap();
    assert!(receipt.block_number > 0);

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.disputes.len(), 1);
    assert_eq!(snapshot.my_disputes.len(), 1);
    let dispute = &snapshot.disputes[0];
    assert_eq!(dispute.initiator, addr(0xbb));
    assert_eq!(dispute.reason, "payment withheld");
    let opened = dispute.opened_date.expect("opened from the DisputeCreated block");
    assert_eq!(dispute.voting_ends, Some(opened + chrono::Duration::days(7)));
    assert_eq!(wallet.call_count("create_dispute"), 1);
}
