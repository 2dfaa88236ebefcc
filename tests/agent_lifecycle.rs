//! End-to-end lifecycle tests: a PluginManager wired to the in-memory store,
//! driven through config churn, crash loops, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use synagent::{
    AgentConfig, Broadcaster, MemoryStore, PluginError, PluginFn, PluginId, PluginManager,
    PluginRegistry, PluginStatus, RunTimeInfo, StateMap, SynTestConfig,
};

const AGENT_ID: &str = "synagent-0/infra";

fn agent_config() -> AgentConfig {
    AgentConfig {
        sync_frequency: Duration::from_secs(30),
        grace_period: Duration::from_secs(1),
        runtime: RunTimeInfo {
            node_name: "node-a7".into(),
            pod_name: "synagent-0".into(),
            namespace: "infra".into(),
            pod_labels: std::collections::HashMap::from([(
                "synagent.io/discover".to_string(),
                "true".to_string(),
            )]),
        },
        agent_id: AGENT_ID.into(),
        ..AgentConfig::default()
    }
}

/// Registry with an `echo` plugin: emits one passing result carrying the
/// config's `tag` runtime value, then parks until cancelled.
fn echo_registry() -> PluginRegistry {
    let registry = PluginRegistry::new();
    registry.register("echo", |cfg: &SynTestConfig| {
        let tag = cfg.runtime.get("tag").cloned().unwrap_or_default();
        PluginFn::arc(move |ctx, emitter| {
            let tag = tag.clone();
            async move {
                emitter.emit(true, tag);
                ctx.cancelled().await;
                Ok(())
            }
        })
    });
    registry
}

fn echo_config(tag: &str) -> SynTestConfig {
    SynTestConfig {
        name: "t".into(),
        plugin_name: "echo".into(),
        namespace: "infra".into(),
        runtime: std::collections::HashMap::from([("tag".to_string(), tag.to_string())]),
        ..Default::default()
    }
}

struct Agent {
    store: Arc<MemoryStore>,
    state: StateMap,
    broadcaster: Broadcaster,
    token: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), synagent::AgentError>>,
}

fn spawn_agent(store: Arc<MemoryStore>, registry: PluginRegistry) -> Agent {
    let mut manager = PluginManager::new(agent_config(), store.clone(), registry);
    let state = manager.state();
    let broadcaster = manager.broadcaster();
    let token = CancellationToken::new();
    let task = {
        let token = token.clone();
        tokio::spawn(async move { manager.start(token).await })
    };
    Agent {
        store,
        state,
        broadcaster,
        token,
        task,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    // Generous in virtual time: these tests run under a paused clock, so
    // the sleeps auto-advance and cost nothing in wall time.
    for _ in 0..4000 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test(start_paused = true)]
async fn start_from_empty_runs_a_matching_test() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = echo_config("v1");
    cfg.name = "ping-test".into();
    cfg.node_selector = "node-a*".into();
    store.put_test_config("ping-test", "v1", cfg);

    let agent = spawn_agent(store, echo_registry());
    let id = PluginId::compute(AGENT_ID, "ping-test");

    let state = agent.state.clone();
    wait_for(
        || {
            state
                .get(&id)
                .is_some_and(|s| s.status == PluginStatus::Running)
        },
        "ping-test to reach Running",
    )
    .await;

    // The new-agent presence event went out during startup.
    assert!(agent
        .store
        .agent_events()
        .iter()
        .any(|e| e == &format!("new agent: {AGENT_ID}")));

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn selector_rejection_keeps_the_test_off_this_agent() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = echo_config("v1");
    cfg.node_selector = "node-b*".into();
    store.put_test_config("t", "v1", cfg);

    let mut other_ns = echo_config("v1");
    other_ns.name = "elsewhere".into();
    other_ns.namespace = "other".into();
    store.put_test_config("elsewhere", "v1", other_ns);

    let mut config = agent_config();
    config.watch_own_namespace_only = true;
    let mut manager = PluginManager::new(config, store.clone(), echo_registry());
    let state = manager.state();
    let token = CancellationToken::new();
    let task = {
        let token = token.clone();
        tokio::spawn(async move { manager.start(token).await })
    };

    // Give the first sync (plus jitter) ample virtual time, then confirm
    // neither test was started.
    sleep(Duration::from_secs(10)).await;
    assert!(state.is_empty());

    token.cancel();
    task.await.expect("joins").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn version_bump_restarts_with_the_new_config() {
    let store = Arc::new(MemoryStore::new());
    store.put_test_config("t", "v1", echo_config("v1"));

    let agent = spawn_agent(store, echo_registry());
    let id = PluginId::compute(AGENT_ID, "t");
    let mut results = agent.broadcaster.subscribe(32);

    let state = agent.state.clone();
    wait_for(
        || {
            state
                .get(&id)
                .is_some_and(|s| s.status == PluginStatus::Running)
        },
        "t@v1 to reach Running",
    )
    .await;
    assert_eq!(results.recv().await.expect("first result").details, "v1");

    // Bump the version; the signal triggers a diff, which stops v1 and
    // starts v2.
    agent.store.put_test_config("t", "v2", echo_config("v2"));
    loop {
        let got = results.recv().await.expect("result stream alive");
        if got.details == "v2" {
            break;
        }
        assert_eq!(got.details, "v1", "only v1/v2 results expected");
    }

    // The state was recreated: fresh counters, new config snapshot.
    let s = agent.state.get(&id).expect("state for t@v2");
    assert_eq!(s.status, PluginStatus::Running);
    assert_eq!(s.total_restarts, 0);
    assert_eq!(s.config.runtime["tag"], "v2");

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn applying_the_same_version_twice_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.put_test_config("t", "v1", echo_config("v1"));

    let agent = spawn_agent(store, echo_registry());
    let id = PluginId::compute(AGENT_ID, "t");

    let state = agent.state.clone();
    wait_for(
        || {
            state
                .get(&id)
                .is_some_and(|s| s.status == PluginStatus::Running)
        },
        "t to reach Running",
    )
    .await;
    let before = agent.state.get(&id).expect("running state");

    // Same version again: the diff must be a no-op.
    agent.store.signal();
    sleep(Duration::from_secs(10)).await;

    let after = agent.state.get(&id).expect("still present");
    assert_eq!(after.status, PluginStatus::Running);
    assert_eq!(after.total_restarts, before.total_restarts);
    assert_eq!(after.running_since, before.running_since);

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn deletion_stops_the_supervisor_and_purges_its_data() {
    let store = Arc::new(MemoryStore::new());
    store.put_test_config("t", "v1", echo_config("v1"));

    let agent = spawn_agent(store, echo_registry());
    let id = PluginId::compute(AGENT_ID, "t");

    let state = agent.state.clone();
    wait_for(
        || {
            state
                .get(&id)
                .is_some_and(|s| s.status == PluginStatus::Running)
        },
        "t to reach Running",
    )
    .await;

    agent.store.remove_test_config("t");
    let state = agent.state.clone();
    wait_for(|| state.get(&id).is_none(), "state entry to be removed").await;

    let store = agent.store.clone();
    wait_for(
        || store.deleted_run_info().contains(&id),
        "run info deletion to be issued",
    )
    .await;

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn unknown_plugin_name_records_an_error_state() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = echo_config("v1");
    cfg.plugin_name = "no-such-plugin".into();
    store.put_test_config("t", "v1", cfg);

    let agent = spawn_agent(store, echo_registry());
    let id = PluginId::compute(AGENT_ID, "t");

    let state = agent.state.clone();
    wait_for(
        || {
            state
                .get(&id)
                .is_some_and(|s| s.status == PluginStatus::Error)
        },
        "error state for unknown plugin",
    )
    .await;
    let s = agent.state.get(&id).expect("state");
    assert!(s.status_msg.contains("no-such-plugin"));

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn crash_loop_cycles_running_and_backoff() {
    let store = Arc::new(MemoryStore::new());
    let registry = PluginRegistry::new();
    registry.register("crash", |_cfg| {
        PluginFn::arc(|_ctx, emitter| async move {
            emitter.emit(false, "boom");
            Err(PluginError::fail("boom"))
        })
    });
    let mut cfg = echo_config("v1");
    cfg.plugin_name = "crash".into();
    store.put_test_config("t", "v1", cfg);

    let agent = spawn_agent(store, registry);
    let id = PluginId::compute(AGENT_ID, "t");

    // Three attempts: backoffs of 10 s and 20 s in between, all within
    // virtual time.
    let state = agent.state.clone();
    wait_for(
        || {
            state.get(&id).is_some_and(|s| {
                s.total_restarts >= 2 && s.status == PluginStatus::RestartBackOff
            })
        },
        "third failed attempt",
    )
    .await;

    let s = agent.state.get(&id).expect("state");
    assert!(s.status_msg.contains("boom"));
    assert_eq!(s.restarts, s.total_restarts);

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_runs_the_full_sequence() {
    let store = Arc::new(MemoryStore::new());
    store.put_test_config("a", "v1", {
        let mut c = echo_config("a");
        c.name = "a".into();
        c
    });
    store.put_test_config("b", "v1", {
        let mut c = echo_config("b");
        c.name = "b".into();
        c
    });

    let agent = spawn_agent(store, echo_registry());
    let id_a = PluginId::compute(AGENT_ID, "a");
    let id_b = PluginId::compute(AGENT_ID, "b");

    let state = agent.state.clone();
    wait_for(
        || {
            [&id_a, &id_b].iter().all(|id| {
                state
                    .get(id)
                    .is_some_and(|s| s.status == PluginStatus::Running)
            })
        },
        "both tests Running",
    )
    .await;

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");

    // Everything was unwound: state purged, per-test data deleted, status
    // gone, exit announced, broadcaster closed.
    assert!(agent.state.is_empty());
    let deleted = agent.store.deleted_run_info();
    assert!(deleted.contains(&id_a) && deleted.contains(&id_b));
    assert!(agent.store.agent_status_for(AGENT_ID).is_none());
    assert!(agent
        .store
        .agent_events()
        .iter()
        .any(|e| e == &format!("exiting agent: {AGENT_ID}")));
    assert!(!agent
        .broadcaster
        .publish(synagent::TestRunResult::now(id_a, true, "late")));
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_at_tick_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    store.put_test_config("t", "v1", echo_config("v1"));

    let agent = spawn_agent(store, echo_registry());
    let id = PluginId::compute(AGENT_ID, "t");

    let state = agent.state.clone();
    wait_for(
        || {
            state
                .get(&id)
                .is_some_and(|s| s.status == PluginStatus::Running)
        },
        "t to reach Running",
    )
    .await;

    // The next tick pings the store, fails, and trips the fatal path; the
    // manager still unwinds through the normal shutdown sequence. Cleanup
    // writes fail too, which must not hang shutdown.
    agent.store.set_unreachable(true);
    let err = agent.task.await.expect("joins").unwrap_err();
    assert_eq!(err.as_label(), "agent_store");
}

#[tokio::test(start_paused = true)]
async fn results_flow_through_to_the_store() {
    let store = Arc::new(MemoryStore::new());
    store.put_test_config("t", "v1", echo_config("v1"));

    let agent = spawn_agent(store, echo_registry());
    let id = PluginId::compute(AGENT_ID, "t");

    let store_handle = agent.store.clone();
    wait_for(
        || !store_handle.test_runs_for(&id).is_empty(),
        "result persisted by the storage handler",
    )
    .await;
    let persisted = agent.store.test_runs_for(&id);
    assert_eq!(persisted[0].details, "v1");
    assert!(persisted[0].passed);

    // The periodic status writeback lands within one sync period.
    let store_handle = agent.store.clone();
    wait_for(
        || store_handle.agent_status_for(AGENT_ID).is_some(),
        "agent status snapshot written",
    )
    .await;
    let snapshot = agent.store.agent_status_for(AGENT_ID).expect("snapshot");
    assert_eq!(snapshot[&id].status, PluginStatus::Running);

    agent.token.cancel();
    agent.task.await.expect("joins").expect("clean shutdown");
}
