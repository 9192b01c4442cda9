//! End-to-end flows against a stand-in SWISH server.

use std::sync::Arc;
use std::time::Duration;

use clause_core::errors::ErrorKind;
use clause_core::instance::{AuthMode, BindMount, ContainerSpec, InstanceState};
use clause_core::query::QueryResult;
use clause_engine::mock::FakeEngine;
use clause_engine::{BridgeConfig, LifecycleConfig, LifecycleManager, QueryBridge, StatusAggregator, SwishClient};
use clause_store::{DocumentStore, NewDocument};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Stack {
    _dir: tempfile::TempDir,
    data_dir: std::path::PathBuf,
    engine: Arc<FakeEngine>,
    lifecycle: Arc<LifecycleManager>,
    store: Arc<DocumentStore>,
    bridge: QueryBridge,
    status: StatusAggregator,
}

fn stack(server: &MockServer) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("swish-data");
    let spec = ContainerSpec {
        image: "swipl/swish:latest".into(),
        name: "clause-scenario".into(),
        host_port: server.address().port(),
        container_port: 3050,
        mounts: vec![BindMount {
            host_path: data_dir.clone(),
            container_path: "/data".into(),
            read_only: false,
        }],
        owner: None,
        auth_mode: AuthMode::Anon,
        https: false,
        labels: Default::default(),
        memory_limit: None,
        cpus: None,
    };
    let engine = Arc::new(FakeEngine::new());
    let interpreter = Arc::new(SwishClient::new(false));
    let lifecycle = LifecycleManager::new(
        engine.clone(),
        interpreter.clone(),
        spec,
        LifecycleConfig {
            poll_interval: Duration::from_millis(10),
            poll_max_attempts: 3,
            probe_timeout: Duration::from_millis(500),
            unhealthy_threshold: 2,
            stop_grace: Duration::ZERO,
            pull_image: false,
            log_tail: 20,
            endpoint_host: "127.0.0.1".into(),
        },
    );
    let store = Arc::new(DocumentStore::open(&data_dir).unwrap());
    let bridge = QueryBridge::new(
        lifecycle.clone(),
        interpreter.clone(),
        store.clone(),
        BridgeConfig {
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(10),
            max_solutions: 100,
            max_retries: 1,
            retry_base_delay: Duration::from_millis(5),
            auto_start: true,
        },
    );
    let status = StatusAggregator::new(lifecycle.clone(), interpreter, Duration::from_millis(500));
    Stack {
        _dir: dir,
        data_dir,
        engine,
        lifecycle,
        store,
        bridge,
        status,
    }
}

async fn swish() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>SWISH</html>"))
        .mount(&server)
        .await;
    server
}

fn family_facts() -> Vec<String> {
    vec![
        "parent(tom, bob).".into(),
        "parent(tom, liz).".into(),
        "parent(bob, ann).".into(),
    ]
}

#[tokio::test]
async fn family_query_returns_bindings_in_interpreter_order() {
    let server = swish().await;
    Mock::given(method("POST"))
        .and(path("/pengine/create"))
        .and(body_partial_json(json!({
            "src_text": "parent(tom, bob).\n\nparent(tom, liz).\n\nparent(bob, ann).",
            "ask": "parent(tom, X)",
            "format": "json",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event": "create",
            "id": "pengine-1",
            "answer": {
                "event": "success",
                "data": [{"X": "liz"}, {"X": "bob"}],
                "more": false
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let s = stack(&server);
    s.store
        .create(
            "family",
            NewDocument {
                background: family_facts(),
                ..Default::default()
            },
        )
        .unwrap();

    let result = s.bridge.execute("family", "?- parent(tom, X).", None).await.unwrap();
    match &result {
        QueryResult::Bindings { solutions, truncated } => {
            let xs: Vec<&str> = solutions.iter().map(|b| b["X"].as_str()).collect();
            assert_eq!(xs, ["liz", "bob"]);
            assert!(!truncated);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(s.engine.create_count(), 1);

    let doc = s.store.read("family").unwrap();
    assert_eq!(doc.cells.len(), 4);
    assert_eq!(doc.cells[3].query_result(), Some(result));
}

#[tokio::test]
async fn appended_rule_is_visible_to_the_next_query() {
    let server = swish().await;
    Mock::given(method("POST"))
        .and(path("/pengine/create"))
        .and(body_partial_json(json!({
            "src_text": "parent(tom, bob).\n\nparent(tom, liz).\n\nparent(bob, ann).\n\ngrandparent(X, Z) :- parent(X, Y), parent(Y, Z).",
            "ask": "grandparent(tom, Who)",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event": "create",
            "answer": {"event": "success", "data": [{"Who": "ann"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let s = stack(&server);
    s.store
        .create(
            "family",
            NewDocument {
                background: family_facts(),
                ..Default::default()
            },
        )
        .unwrap();
    s.store
        .append_background("family", "grandparent(X, Z) :- parent(X, Y), parent(Y, Z).")
        .unwrap();

    let result = s.bridge.execute("family", "grandparent(tom, Who)", None).await.unwrap();
    let QueryResult::Bindings { solutions, .. } = result else {
        panic!("expected bindings");
    };
    assert_eq!(solutions[0]["Who"], "ann");
}

#[tokio::test]
async fn ground_query_succeeds_without_bindings() {
    let server = swish().await;
    Mock::given(method("POST"))
        .and(path("/pengine/create"))
        .and(body_partial_json(json!({
            "src_text": "parent(tom,bob).\n\nparent(bob,ann).\n\ngrandparent(X,Z) :- parent(X,Y), parent(Y,Z).",
            "ask": "grandparent(tom,ann)",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event": "create",
            "answer": {"event": "success", "data": [{}], "more": false}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let s = stack(&server);
    s.store
        .create(
            "family",
            NewDocument {
                background: vec!["parent(tom,bob).".into(), "parent(bob,ann).".into()],
                ..Default::default()
            },
        )
        .unwrap();
    s.store
        .append_background("family", "grandparent(X,Z) :- parent(X,Y), parent(Y,Z).")
        .unwrap();

    let result = s.bridge.execute("family", "grandparent(tom,ann).", None).await.unwrap();
    assert_eq!(result, QueryResult::Success);
    let doc = s.store.read("family").unwrap();
    assert_eq!(doc.cells.last().unwrap().query_result(), Some(QueryResult::Success));
}

#[tokio::test]
async fn undefined_procedure_is_reported_verbatim() {
    let server = swish().await;
    Mock::given(method("POST"))
        .and(path("/pengine/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event": "create",
            "answer": {
                "event": "error",
                "code": "existence_error",
                "data": "Unknown procedure: sibling/2"
            }
        })))
        .mount(&server)
        .await;

    let s = stack(&server);
    s.store
        .create(
            "family",
            NewDocument {
                background: family_facts(),
                ..Default::default()
            },
        )
        .unwrap();

    let result = s.bridge.execute("family", "sibling(bob, liz)", None).await.unwrap();
    assert_eq!(
        result,
        QueryResult::Error {
            kind: ErrorKind::UndefinedProcedure,
            message: "Unknown procedure: sibling/2".into(),
        }
    );
    let err = result.into_answer("family").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedProcedure);
    assert!(!err.is_retryable());
    assert_eq!(s.store.read("family").unwrap().cells.len(), 3);
}

#[tokio::test]
async fn knowledge_survives_a_restart() {
    let server = swish().await;
    Mock::given(method("POST"))
        .and(path("/pengine/create"))
        .and(body_partial_json(json!({
            "src_text": "likes(mary, wine).\n\nlikes(john, X) :- likes(mary, X).",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event": "success", "data": [{"X": "wine"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let s = stack(&server);
    s.store
        .create(
            "likes",
            NewDocument {
                background: vec!["likes(mary, wine).".into()],
                ..Default::default()
            },
        )
        .unwrap();
    s.store
        .append_background("likes", "likes(john, X) :- likes(mary, X).")
        .unwrap();

    let reopened = Arc::new(DocumentStore::open(&s.data_dir).unwrap());
    let bridge = QueryBridge::new(
        s.lifecycle.clone(),
        Arc::new(SwishClient::new(false)),
        reopened,
        BridgeConfig::default(),
    );
    let result = bridge.execute("likes", "likes(john, X)", None).await.unwrap();
    assert!(matches!(result, QueryResult::Bindings { .. }));
}

#[tokio::test]
async fn server_errors_exhaust_into_interpreter_unavailable() {
    let server = swish().await;
    Mock::given(method("POST"))
        .and(path("/pengine/create"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(2)
        .mount(&server)
        .await;

    let s = stack(&server);
    s.store.create("family", NewDocument::default()).unwrap();
    let err = s.bridge.execute("family", "true", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InterpreterUnavailable);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn status_follows_the_lifecycle() {
    let server = swish().await;
    let s = stack(&server);

    let before = s.status.status().await;
    assert_eq!(before.instance.state, InstanceState::Absent);
    assert!(before.interpreter.reachable);
    assert!(!before.ready);

    s.lifecycle.ensure().await.unwrap();
    let up = s.status.status().await;
    assert_eq!(up.instance.state, InstanceState::Healthy);
    assert!(up.ready);

    s.lifecycle.teardown().await.unwrap();
    s.lifecycle.teardown().await.unwrap();
    let down = s.status.status().await;
    assert_eq!(down.instance.state, InstanceState::Stopped);
    assert!(!down.ready);
    assert_eq!(s.engine.running_count(), 0);
}
