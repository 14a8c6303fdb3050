//! Sweeper convergence: after expiry and one sweep, nothing of a session is
//! left in the store, the object registry or on disk.

use std::sync::Arc;
use std::time::Duration;

use agentgraph_core::config::SessionsConfig;
use agentgraph_core::{
    AgentGraphConfig, AgentGraphError, BuildError, Footprint, MemoryKvStore,
    SessionDirectoryAllocator, SessionId,
};
use agentgraph_server::state::AppState;

#[derive(Debug)]
struct Agent {
    session_id: SessionId,
}

impl Footprint for Agent {}

fn make_state(root: &std::path::Path) -> AppState {
    let config = AgentGraphConfig {
        sessions: SessionsConfig {
            ttl_minutes: 1,
            max_sessions_per_client: 100,
            ..SessionsConfig::default()
        },
        ..AgentGraphConfig::default()
    };
    AppState::with_directories(
        config,
        Arc::new(MemoryKvStore::new()),
        SessionDirectoryAllocator::new(root),
    )
}

// ===========================================================================
// TEST 1: K expired sessions converge to zero after one sweep
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_sweep_converges_after_expiry() {
    let tmp = tempfile::tempdir().unwrap();
    let state = make_state(tmp.path());
    const K: usize = 8;

    let mut ids = Vec::new();
    for i in 0..K {
        let id = state
            .sessions
            .create_session(&format!("10.0.0.{i}"))
            .await
            .unwrap();
        let session = state.sessions.get_config(id).await.unwrap();
        let paths = state.directories.paths_for(id).await.unwrap();
        std::fs::write(paths.uploads_dir.join("data.csv"), vec![0u8; 64]).unwrap();

        let agent: Arc<Agent> = state
            .cache
            .agent(&session, None, move |_| async move { Ok(Agent { session_id: id }) })
            .await
            .unwrap();
        assert_eq!(agent.session_id, id);
        ids.push(id);
    }
    assert_eq!(state.objects.stats().entries, K);

    tokio::time::advance(Duration::from_secs(61)).await;
    let report = state.sweeper.run_sweep_cycle().await;

    assert_eq!(report.sessions_reclaimed, K);
    assert_eq!(report.directories_removed, K);
    assert_eq!(report.entries_evicted, K);
    assert_eq!(report.bytes_freed, 64 * K as u64);
    assert_eq!(report.failures, 0);

    assert_eq!(state.objects.stats().sessions, 0);
    assert!(state.directories.list_session_dirs().await.unwrap().is_empty());
    assert!(state.sessions.list_expired().await.is_empty());
    for id in ids {
        assert!(state.sessions.peek(id).await.unwrap().is_none());
        let err = state.sessions.get_config(id).await.unwrap_err();
        assert!(matches!(err, AgentGraphError::SessionNotFound(_)));
    }
}

// ===========================================================================
// TEST 2: renewed sessions survive while idle ones are reclaimed
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_sweep_spares_renewed_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let state = make_state(tmp.path());

    let active = state.sessions.create_session("10.0.0.1").await.unwrap();
    let idle = state.sessions.create_session("10.0.0.2").await.unwrap();
    state.directories.paths_for(active).await.unwrap();
    state.directories.paths_for(idle).await.unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;
    state.sessions.get_config(active).await.unwrap();
    tokio::time::advance(Duration::from_secs(40)).await;

    let report = state.sweeper.run_sweep_cycle().await;
    assert_eq!(report.sessions_reclaimed, 1);
    assert_eq!(state.directories.list_session_dirs().await.unwrap(), vec![active]);
    assert!(state.sessions.get_config(active).await.is_ok());
}

// ===========================================================================
// TEST 3: a configuration change routes callers to a fresh agent
// ===========================================================================
#[tokio::test]
async fn test_version_bump_rebuilds_cached_agent() {
    let tmp = tempfile::tempdir().unwrap();
    let state = make_state(tmp.path());
    let id = state.sessions.create_session("10.0.0.1").await.unwrap();

    let before = state.sessions.get_config(id).await.unwrap();
    let a: Arc<Agent> = state
        .cache
        .agent(&before, None, move |_| async move { Ok(Agent { session_id: id }) })
        .await
        .unwrap();

    let patch = agentgraph_core::ConfigPatch {
        top_k: Some(50),
        ..Default::default()
    };
    let after = state.sessions.update_config(id, patch).await.unwrap();
    let b: Arc<Agent> = state
        .cache
        .agent(&after, None, move |_| async move { Ok(Agent { session_id: id }) })
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &b));

    // a failed build adds nothing
    let failing = state
        .cache
        .agent::<Agent, _, _>(&after, Some("new-data".to_string()), |_| async {
            Err(BuildError::failed("dataset unreadable"))
        })
        .await
        .unwrap_err();
    assert!(matches!(failing, AgentGraphError::BuildFailed(BuildError::Failed(_))));
    assert_eq!(state.objects.session_entries(id), 2);
}
