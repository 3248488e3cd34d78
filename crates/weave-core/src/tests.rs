//! End-to-end scenarios over the full service with scripted providers.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::config::{RetryPolicy, WeaveConfig};
use crate::embedding::EmbeddingClient;
use crate::error::WeaveError;
use crate::mutation::EdgeUpdate;
use crate::orchestrator::IngestReport;
use crate::queue::EpisodeState;
use crate::search::{SearchKind, SearchRequest, SearchResults};
use crate::service::{EpisodeInput, JobValue, Weave};
use crate::testing::{candidate, fact_between, EpisodeScript, HashEmbedder, ScriptedLlm};
use crate::types::{Embedding, EpisodeKind};

const DIM: usize = 64;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(5),
        cap: Duration::from_millis(20),
        max_attempts: 5,
    }
}

fn test_config(dir: &TempDir) -> WeaveConfig {
    WeaveConfig {
        data_dir: dir.path().to_path_buf(),
        vector_dim: DIM,
        llm_semaphore: 16,
        max_inflight_episodes: 16,
        llm_retry: fast_retry(),
        store_retry: fast_retry(),
        ..WeaveConfig::default()
    }
}

async fn setup() -> (Weave, Arc<ScriptedLlm>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let llm = Arc::new(ScriptedLlm::new());
    let embedder = Arc::new(HashEmbedder::new(DIM));
    let weave = Weave::open_with_clients(config, llm.clone(), embedder)
        .await
        .unwrap();
    (weave, llm, dir)
}

fn alice_at_acme_script() -> EpisodeScript {
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
    }
}

async fn ingest_and_wait(weave: &Weave, name: &str, body: &str, group: &str) -> IngestReport {
    let ack = weave
        .ingest(EpisodeInput {
            name: name.to_string(),
            content: body.to_string(),
            group_id: Some(group.to_string()),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    match ack.handle.unwrap().wait().await.unwrap() {
        JobValue::Ingest(report) => report,
        other => panic!("unexpected job value: {:?}", other),
    }
}

// Scenario: ingest one episode, find the person with its organization
// edge through node search.
#[tokio::test]
async fn ingest_then_node_search_finds_entity_and_edge() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());

    let report = ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;
    assert_eq!(report.entities_created, 2);
    assert_eq!(report.edges_created, 1);

    let results = weave
        .search(&SearchRequest::new("Alice", SearchKind::Nodes).with_groups(vec!["g1".into()]))
        .await
        .unwrap();
    let SearchResults::Nodes(hits) = results else {
        panic!("expected node results");
    };
    let alice = hits
        .iter()
        .find(|h| h.entity.canonical_name == "Alice")
        .expect("Alice present");
    assert!(alice.entity.labels.contains(&"Person".to_string()));
    assert_eq!(alice.citations.len(), 1);

    let edges = weave.store().edges_for_entity(alice.entity.id).await.unwrap();
    assert_eq!(edges.len(), 1);
    let target = weave
        .store()
        .get_entity(edges[0].target_entity_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target.canonical_name, "Acme");
    assert!(target.labels.contains(&"Organization".to_string()));
}

// Scenario: a later episode negates the relation; the old edge closes
// at the stated valid time and the new edge cites the new episode.
#[tokio::test]
async fn contradiction_invalidates_and_creates() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());

    let left_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let mut leaving = fact_between("Alice", "Acme", "left", "Alice left Acme in March 2024");
    leaving.valid_at = Some(left_at);
    leaving.negates = true;
    llm.script(
        "e2",
        EpisodeScript {
            entities: vec![
                candidate("Alice", "Person"),
                candidate("Acme", "Organization"),
            ],
            facts: vec![leaving],
        },
    );

    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;
    let report = ingest_and_wait(&weave, "e2", "Alice left Acme in 2024-03", "g1").await;
    assert_eq!(report.edges_invalidated, 1);
    assert_eq!(report.edges_created, 1);

    let e2 = weave
        .store()
        .episode_by_name("g1", "e2")
        .await
        .unwrap()
        .unwrap();
    let alice = weave
        .store()
        .entities_by_name("g1", "alice")
        .await
        .unwrap()
        .remove(0);
    let edges = weave.store().edges_for_entity(alice.id).await.unwrap();
    assert_eq!(edges.len(), 2);

    let works = edges.iter().find(|e| e.relation_name == "works_at").unwrap();
    assert_eq!(works.invalid_at, Some(left_at));
    assert!(!works.is_currently_asserted(Utc::now()));

    let left = edges.iter().find(|e| e.relation_name == "left").unwrap();
    assert!(left.episode_ids.contains(&e2.id));
    assert_eq!(left.valid_at, Some(left_at));
}

// Scenario: ten episodes in one group process strictly in submission
// order with no overlapping extraction.
#[tokio::test]
async fn same_group_is_serialized_in_order() {
    let (weave, llm, _dir) = setup().await;
    let names: Vec<String> = (0..10).map(|i| format!("ep-{:02}", i)).collect();
    for name in &names {
        llm.script(name, EpisodeScript::default());
    }

    let mut handles = Vec::new();
    for name in &names {
        let ack = weave
            .ingest(EpisodeInput {
                name: name.clone(),
                content: format!("body of {}", name),
                group_id: Some("serial".into()),
                ..EpisodeInput::default()
            })
            .await
            .unwrap();
        handles.push(ack.handle.unwrap());
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }

    assert_eq!(llm.extraction_order(), names);
    assert_eq!(llm.max_concurrent(), 1);
}

// Scenario: one episode in each of ten groups runs with measured
// overlap when the inflight bound allows it.
#[tokio::test]
async fn distinct_groups_run_concurrently() {
    let (weave, llm, _dir) = setup().await;
    let mut handles = Vec::new();
    for i in 0..10 {
        let name = format!("ep-{}", i);
        llm.script(&name, EpisodeScript::default());
        let ack = weave
            .ingest(EpisodeInput {
                name,
                content: "body".into(),
                group_id: Some(format!("group-{}", i)),
                ..EpisodeInput::default()
            })
            .await
            .unwrap();
        handles.push(ack.handle.unwrap());
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert!(
        llm.max_concurrent() > 1,
        "expected overlap, saw max {}",
        llm.max_concurrent()
    );
}

// Scenario: two rate-limit failures then success; the episode reaches
// done, attempts are recorded, and the graph matches the clean run.
#[tokio::test]
async fn rate_limited_ingest_retries_to_same_graph() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    llm.push_failure(WeaveError::RateLimited("429".into()));
    llm.push_failure(WeaveError::RateLimited("429".into()));

    let report = ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;
    assert_eq!(report.entities_created, 2);
    assert_eq!(report.edges_created, 1);

    let episode = weave
        .store()
        .episode_by_name("g1", "e1")
        .await
        .unwrap()
        .unwrap();
    let status = weave.episode_status(episode.id).await.unwrap().unwrap();
    assert_eq!(status.state, EpisodeState::Done);
    assert_eq!(status.attempts, 3);

    // Same edge list as a clean run: exactly one works_at edge.
    let alice = weave
        .store()
        .entities_by_name("g1", "alice")
        .await
        .unwrap()
        .remove(0);
    assert_eq!(weave.store().edges_for_entity(alice.id).await.unwrap().len(), 1);
}

// Scenario: retry exhaustion flags the episode and surfaces through
// the status query.
#[tokio::test]
async fn exhausted_ingest_is_flagged_not_lost() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    for _ in 0..5 {
        llm.push_failure(WeaveError::RateLimited("429".into()));
    }

    let ack = weave
        .ingest(EpisodeInput {
            name: "e1".into(),
            content: "Alice works at Acme".into(),
            group_id: Some("g1".into()),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    let episode_id = ack.episode_id;
    let err = ack.handle.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, WeaveError::Exhausted { attempts: 5, .. }));

    let episode = weave.store().get_episode(episode_id).await.unwrap().unwrap();
    assert!(episode.status_note.is_some());
    let status = weave.episode_status(episode_id).await.unwrap().unwrap();
    assert_eq!(status.state, EpisodeState::Failed);
}

// Scenario: soft-update, then search. Without the historical flag only
// the successor shows; with it both versions show. The citation chain
// carries the original and the synthesis episode, and the original
// fact stays retrievable.
#[tokio::test]
async fn soft_update_preserves_history_and_citations() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;

    let alice = weave
        .store()
        .entities_by_name("g1", "alice")
        .await
        .unwrap()
        .remove(0);
    let old_edge = weave
        .store()
        .edges_for_entity(alice.id)
        .await
        .unwrap()
        .remove(0);
    let old_valid_at = old_edge.valid_at;

    let outcome = weave
        .update_edge(
            old_edge.id,
            EdgeUpdate {
                fact: "Alice works remotely at Acme".into(),
                reason: Some("correction".into()),
                ..EdgeUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.old_id, old_edge.id);

    let request = SearchRequest::new("Alice works Acme", SearchKind::Edges)
        .with_groups(vec!["g1".into()]);
    let SearchResults::Edges(current) = weave.search(&request).await.unwrap() else {
        panic!()
    };
    assert_eq!(current.len(), 1);
    let hit = &current[0];
    assert_eq!(hit.edge.id, outcome.new_id);
    assert_eq!(hit.edge.original_fact.as_deref(), Some("Alice works at Acme"));
    assert_eq!(hit.edge.valid_at, old_valid_at);
    // Citations: the asserting episode plus the synthesis episode.
    assert_eq!(hit.citations.len(), 2);
    assert!(hit.citations.iter().any(|c| c.name == "e1"));
    assert!(hit
        .citations
        .iter()
        .any(|c| c.kind == EpisodeKind::Structured));

    let SearchResults::Edges(historical) = weave
        .search(&request.clone().with_expired())
        .await
        .unwrap()
    else {
        panic!()
    };
    assert_eq!(historical.len(), 2);
    // The expired predecessor has a successor created at or after its
    // expiry.
    let expired = historical.iter().find(|h| h.edge.id == old_edge.id).unwrap();
    let successor = historical
        .iter()
        .find(|h| h.edge.id == outcome.new_id)
        .unwrap();
    assert!(successor.edge.created_at >= expired.edge.expired_at.unwrap());
}

#[tokio::test]
async fn ingest_is_idempotent_on_supplied_id() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());

    let id = uuid::Uuid::now_v7();
    let ack = weave
        .ingest(EpisodeInput {
            name: "e1".into(),
            content: "Alice works at Acme".into(),
            group_id: Some("g1".into()),
            id: Some(id),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    ack.handle.unwrap().wait().await.unwrap();

    let again = weave
        .ingest(EpisodeInput {
            name: "e1".into(),
            content: "Alice works at Acme".into(),
            group_id: Some("g1".into()),
            id: Some(id),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    assert!(again.handle.is_none());

    assert_eq!(weave.stats().await.unwrap().episode_count, 1);
    let alice = weave
        .store()
        .entities_by_name("g1", "alice")
        .await
        .unwrap()
        .remove(0);
    assert_eq!(weave.store().edges_for_entity(alice.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_then_reingest_matches_single_ingest() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());

    let ack = weave
        .ingest(EpisodeInput {
            name: "e1".into(),
            content: "Alice works at Acme".into(),
            group_id: Some("g1".into()),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    let first_id = ack.episode_id;
    ack.handle.unwrap().wait().await.unwrap();

    let report = weave.delete_episode(first_id).await.unwrap();
    assert_eq!(report.edges_deleted, 1);
    assert_eq!(report.entities_deleted, 2);
    let stats = weave.stats().await.unwrap();
    assert_eq!(stats.episode_count, 0);
    assert_eq!(stats.entity_count, 0);

    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;
    let stats = weave.stats().await.unwrap();
    assert_eq!(stats.episode_count, 1);
    assert_eq!(stats.entity_count, 2);
    assert_eq!(stats.edge_count, 1);
}

#[tokio::test]
async fn duplicate_fact_appends_episode_instead_of_new_edge() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    llm.script("e2", alice_at_acme_script());

    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;
    let report = ingest_and_wait(&weave, "e2", "Alice still works at Acme", "g1").await;
    assert_eq!(report.edges_created, 0);
    assert_eq!(report.edges_duplicated, 1);

    let alice = weave
        .store()
        .entities_by_name("g1", "alice")
        .await
        .unwrap()
        .remove(0);
    let edges = weave.store().edges_for_entity(alice.id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].episode_ids.len(), 2);
}

#[tokio::test]
async fn groups_are_isolated_namespaces() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    llm.script("e2", alice_at_acme_script());

    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;
    let report = ingest_and_wait(&weave, "e2", "Alice works at Acme", "g2").await;
    // Same names in another group resolve to fresh entities.
    assert_eq!(report.entities_created, 2);
    assert_eq!(weave.stats().await.unwrap().entity_count, 4);
}

#[tokio::test]
async fn unknown_fact_endpoints_are_dropped_not_fatal() {
    let (weave, llm, _dir) = setup().await;
    llm.script(
        "e1",
        EpisodeScript {
            entities: vec![candidate("Alice", "Person")],
            facts: vec![fact_between("Alice", "Nobody", "knows", "Alice knows Nobody")],
        },
    );
    let report = ingest_and_wait(&weave, "e1", "Alice knows someone", "g1").await;
    assert_eq!(report.edges_created, 0);
    assert_eq!(report.dropped_facts, 1);
    assert_eq!(weave.stats().await.unwrap().entity_count, 1);
}

// Boundary behaviors.

#[tokio::test]
async fn zero_max_results_is_empty_not_error() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;

    for kind in [SearchKind::Edges, SearchKind::Nodes, SearchKind::Episodes] {
        let results = weave
            .search(&SearchRequest::new("Alice", kind).with_max_results(0))
            .await
            .unwrap();
        assert_eq!(results.len(), 0);
    }
}

#[tokio::test]
async fn empty_episode_query_returns_most_recent_first() {
    let (weave, llm, _dir) = setup().await;
    for name in ["first", "second", "third"] {
        llm.script(name, EpisodeScript::default());
        ingest_and_wait(&weave, name, "some body text", "g1").await;
    }

    let SearchResults::Episodes(hits) = weave
        .search(&SearchRequest::new("", SearchKind::Episodes).with_max_results(2))
        .await
        .unwrap()
    else {
        panic!()
    };
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].episode.name, "third");
    assert_eq!(hits[1].episode.name, "second");
}

#[tokio::test]
async fn missing_center_node_yields_empty_results() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;

    let results = weave
        .search(
            &SearchRequest::new("Alice", SearchKind::Edges).with_center(uuid::Uuid::now_v7()),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 0);
}

#[tokio::test]
async fn center_node_proximity_prunes_far_edges() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;

    let alice = weave
        .store()
        .entities_by_name("g1", "alice")
        .await
        .unwrap()
        .remove(0);
    let SearchResults::Edges(hits) = weave
        .search(&SearchRequest::new("Alice works Acme", SearchKind::Edges).with_center(alice.id))
        .await
        .unwrap()
    else {
        panic!()
    };
    assert_eq!(hits.len(), 1);
}

/// An embedder that returns all-zero vectors; vector ranking must fall
/// back to lexical ordering.
struct ZeroEmbedder;

#[async_trait::async_trait]
impl EmbeddingClient for ZeroEmbedder {
    async fn embed(&self, _text: &str) -> crate::error::Result<Embedding> {
        Ok(vec![0.0; DIM])
    }
    async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Embedding>> {
        Ok(texts.iter().map(|_| vec![0.0; DIM]).collect())
    }
    fn dimension(&self) -> usize {
        DIM
    }
}

#[tokio::test]
async fn degenerate_query_embedding_falls_back_to_lexical() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(ScriptedLlm::new());
    llm.script("e1", alice_at_acme_script());
    let weave = Weave::open_with_clients(test_config(&dir), llm.clone(), Arc::new(ZeroEmbedder))
        .await
        .unwrap();
    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;

    let SearchResults::Edges(hits) = weave
        .search(&SearchRequest::new("Alice works", SearchKind::Edges))
        .await
        .unwrap()
    else {
        panic!()
    };
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn source_url_round_trips_through_citations() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());

    let ack = weave
        .ingest(EpisodeInput {
            name: "e1".into(),
            content: "Alice works at Acme".into(),
            group_id: Some("g1".into()),
            source_description: Some("hr system export".into()),
            source_url: Some("https://hr.acme.test/records/1".into()),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    ack.handle.unwrap().wait().await.unwrap();

    let SearchResults::Edges(hits) = weave
        .search(&SearchRequest::new("Alice works Acme", SearchKind::Edges))
        .await
        .unwrap()
    else {
        panic!()
    };
    let citation = &hits[0].citations[0];
    assert_eq!(
        citation.source_url.as_deref(),
        Some("https://hr.acme.test/records/1")
    );
    assert!(citation.source_description.starts_with("hr system export,"));
}

// Universal invariants checked over a mixed workload.
#[tokio::test]
async fn universal_invariants_hold_after_mixed_workload() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", alice_at_acme_script());
    llm.script("e2", alice_at_acme_script());
    ingest_and_wait(&weave, "e1", "Alice works at Acme", "g1").await;
    ingest_and_wait(&weave, "e2", "Alice still works at Acme", "g1").await;

    let alice = weave
        .store()
        .entities_by_name("g1", "alice")
        .await
        .unwrap()
        .remove(0);
    let edge = weave
        .store()
        .edges_for_entity(alice.id)
        .await
        .unwrap()
        .remove(0);
    weave
        .update_edge(
            edge.id,
            EdgeUpdate {
                fact: "Alice is employed by Acme".into(),
                ..EdgeUpdate::default()
            },
        )
        .await
        .unwrap();

    let edges = weave.store().edges_for_entity(alice.id).await.unwrap();
    for edge in &edges {
        // Every edge cites at least one episode.
        assert!(!edge.episode_ids.is_empty());
        // Every expired edge has a same-relation successor created at
        // or after its expiry.
        if let Some(expired_at) = edge.expired_at {
            assert!(edges.iter().any(|other| {
                other.id != edge.id
                    && other.source_entity_id == edge.source_entity_id
                    && other.target_entity_id == edge.target_entity_id
                    && other.relation_name == edge.relation_name
                    && other.created_at >= expired_at
            }));
        }
        if let (Some(valid), Some(invalid)) = (edge.valid_at, edge.invalid_at) {
            assert!(valid <= invalid);
        }
    }

    // Every entity is reachable from a mention or an edge.
    for name in ["alice", "acme"] {
        let entity = weave
            .store()
            .entities_by_name("g1", name)
            .await
            .unwrap()
            .remove(0);
        let mentions = weave.store().mentions_of_entity(entity.id).await.unwrap();
        let incident = weave.store().edges_for_entity(entity.id).await.unwrap();
        assert!(!mentions.is_empty() || !incident.is_empty());
    }
}

#[tokio::test]
async fn validation_rejects_blank_input() {
    let (weave, _llm, _dir) = setup().await;
    let err = weave
        .ingest(EpisodeInput {
            name: "  ".into(),
            content: "body".into(),
            ..EpisodeInput::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WeaveError::Validation(_)));

    let err = weave
        .ingest(EpisodeInput {
            name: "ok".into(),
            content: "".into(),
            ..EpisodeInput::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WeaveError::Validation(_)));
}

#[tokio::test]
async fn omitted_group_falls_back_to_default() {
    let (weave, llm, _dir) = setup().await;
    llm.script("e1", EpisodeScript::default());
    let ack = weave
        .ingest(EpisodeInput {
            name: "e1".into(),
            content: "body".into(),
            ..EpisodeInput::default()
        })
        .await
        .unwrap();
    assert_eq!(ack.group_id, "default");
    ack.handle.unwrap().wait().await.unwrap();
}

mod fusion_properties {
    use crate::search::rrf::{rrf_fuse, RRF_K};
    use proptest::prelude::*;
    use uuid::Uuid;

    proptest! {
        // A candidate ranked ahead of another in every list it shares
        // never fuses lower.
        #[test]
        fn earlier_rank_never_scores_lower(positions in 1usize..50) {
            let ids: Vec<Uuid> = (0..=positions).map(|_| Uuid::new_v4()).collect();
            let scores = rrf_fuse(&[ids.clone()], RRF_K);
            for pair in ids.windows(2) {
                prop_assert!(scores[&pair[0]] > scores[&pair[1]]);
            }
        }

        // Appearing in an extra list only ever raises a score.
        #[test]
        fn extra_list_membership_is_monotonic(len in 1usize..30) {
            let ids: Vec<Uuid> = (0..len).map(|_| Uuid::new_v4()).collect();
            let single = rrf_fuse(&[ids.clone()], RRF_K);
            let double = rrf_fuse(&[ids.clone(), ids.clone()], RRF_K);
            for id in &ids {
                prop_assert!(double[id] > single[id]);
            }
        }
    }
}
