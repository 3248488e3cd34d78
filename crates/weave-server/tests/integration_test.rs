use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use weave_core::testing::{candidate, fact_between, EpisodeScript, HashEmbedder, ScriptedLlm};
use weave_core::{
    EpisodeInput, GraphStore, JobValue, RedbGraphStore, RetryPolicy, SearchKind, SearchRequest,
    SearchResults, Weave, WeaveConfig,
};

const DIM: usize = 64;

fn service_config(data_dir: &std::path::Path) -> WeaveConfig {
    WeaveConfig {
        data_dir: data_dir.to_path_buf(),
        vector_dim: DIM,
        llm_retry: RetryPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            max_attempts: 3,
        },
        ..WeaveConfig::default()
    }
}

async fn scripted_service(data_dir: &std::path::Path) -> (Weave, Arc<ScriptedLlm>) {
    let llm = Arc::new(ScriptedLlm::new());
    llm.script(
        "onboarding",
        EpisodeScript {
            entities: vec![
                candidate("Alice", "Person"),
                candidate("Acme", "Organization"),
            ],
            facts: vec![fact_between(
                "Alice",
                "Acme",
                "works_at",
                "Alice works at Acme",
            )],
        },
    );
    let weave = Weave::open_with_clients(
        service_config(data_dir),
        llm.clone(),
        Arc::new(HashEmbedder::new(DIM)),
    )
    .await
    .unwrap();
    (weave, llm)
}

// ── Store persistence ────────────────────────────────────────────────────────

#[tokio::test]
async fn graph_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("weave.redb");

    let episode_id = {
        let store = RedbGraphStore::open(&db_path, DIM).unwrap();
        let episode = weave_core::Episode::new(
            "persisted".to_string(),
            "body".to_string(),
            weave_core::EpisodeKind::Text,
            "test".to_string(),
            "g1".to_string(),
        );
        store.put_episode(&episode).await.unwrap();
        episode.id
    };

    let store = RedbGraphStore::open(&db_path, DIM).unwrap();
    let episode = store
        .get_episode(episode_id)
        .await
        .unwrap()
        .expect("episode survives reopen");
    assert_eq!(episode.name, "persisted");
}

// ── Full pipeline through the service ────────────────────────────────────────

#[tokio::test]
async fn ingest_search_delete_round_trip() {
    let dir = tempdir().unwrap();
    let (weave, _llm) = scripted_service(dir.path()).await;

    let ack = weave
        .ingest(EpisodeInput {
            name: "onboarding".into(),
            content: "Alice works at Acme".into(),
            group_id: Some("g1".into()),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    let episode_id = ack.episode_id;
    match ack.handle.unwrap().wait().await.unwrap() {
        JobValue::Ingest(report) => {
            assert_eq!(report.entities_created, 2);
            assert_eq!(report.edges_created, 1);
        }
        other => panic!("unexpected job value: {:?}", other),
    }

    let SearchResults::Edges(hits) = weave
        .search(&SearchRequest::new("Alice Acme", SearchKind::Edges))
        .await
        .unwrap()
    else {
        panic!("expected edge results");
    };
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].citations.len(), 1);
    assert_eq!(hits[0].citations[0].episode_id, episode_id);

    let report = weave.delete_episode(episode_id).await.unwrap();
    assert_eq!(report.edges_deleted, 1);
    assert_eq!(report.entities_deleted, 2);

    let stats = weave.stats().await.unwrap();
    assert_eq!(stats.episode_count, 0);
    assert_eq!(stats.entity_count, 0);
    assert_eq!(stats.edge_count, 0);
}

// ── Service reopen on existing data ──────────────────────────────────────────

#[tokio::test]
async fn service_reopens_with_searchable_graph() {
    let dir = tempdir().unwrap();
    {
        let (weave, _llm) = scripted_service(dir.path()).await;
        let ack = weave
            .ingest(EpisodeInput {
                name: "onboarding".into(),
                content: "Alice works at Acme".into(),
                group_id: Some("g1".into()),
                ..EpisodeInput::default()
            })
            .await
            .unwrap();
        ack.handle.unwrap().wait().await.unwrap();
        weave.close();
    }

    let (weave, _llm) = scripted_service(dir.path()).await;
    let SearchResults::Nodes(hits) = weave
        .search(&SearchRequest::new("Alice", SearchKind::Nodes))
        .await
        .unwrap()
    else {
        panic!("expected node results");
    };
    assert!(hits.iter().any(|h| h.entity.canonical_name == "Alice"));
}
