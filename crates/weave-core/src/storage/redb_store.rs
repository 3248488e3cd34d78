use async_trait::async_trait;
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable,
    ReadableTableMetadata, TableDefinition,
};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, WeaveError};
use crate::storage::lexical::Bm25Scorer;
use crate::storage::traits::{CascadeReport, GraphStore, Neighborhood, StoreStats};
use crate::storage::vector::KnnIndex;
use crate::types::{
    EdgeId, Embedding, Entity, EntityId, Episode, EpisodeId, Mention, MentionId, RelationEdge,
};

// Primary tables
const EPISODES: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("episodes");
const ENTITIES: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("entities");
const EDGES: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("edges");
const MENTIONS: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("mentions");

// Secondary indexes
const EPISODES_BY_GROUP: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("episodes_by_group");
const ENTITIES_BY_GROUP: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("entities_by_group");
const ENTITIES_BY_NAME: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("entities_by_name");
const EDGES_BY_GROUP: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("edges_by_group");
const EDGES_BY_SOURCE: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("edges_by_source");
const EDGES_BY_TARGET: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("edges_by_target");
const EDGES_BY_EPISODE: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("edges_by_episode");
const MENTIONS_BY_EPISODE: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("mentions_by_episode");
const MENTIONS_BY_ENTITY: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("mentions_by_entity");

// Metadata table
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Separator for the `(group_id, normalized name)` composite key.
const NAME_KEY_SEP: char = '\u{1f}';

fn name_key(group_id: &str, normalized: &str) -> String {
    format!("{}{}{}", group_id, NAME_KEY_SEP, normalized)
}

/// Embedded graph store backed by redb, with in-memory kNN indexes
/// over entity and edge embeddings and per-query BM25 lexical ranking.
pub struct RedbGraphStore {
    db: Database,
    path: PathBuf,
    entity_index: RwLock<KnnIndex>,
    edge_index: RwLock<KnnIndex>,
    scorer: Bm25Scorer,
}

impl RedbGraphStore {
    /// Open or create a store at the given path and warm the vector
    /// indexes from the persisted embeddings.
    pub fn open<P: AsRef<Path>>(path: P, vector_dim: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WeaveError::Validation(format!("Failed to create directory: {}", e)))?;
        }

        let db = Database::create(&path)?;
        let store = RedbGraphStore {
            db,
            path,
            entity_index: RwLock::new(KnnIndex::new(vector_dim)),
            edge_index: RwLock::new(KnnIndex::new(vector_dim)),
            scorer: Bm25Scorer::new(),
        };
        store.init_tables()?;
        store.warm_indexes()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_tables(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let _ = txn.open_table(EPISODES)?;
            let _ = txn.open_table(ENTITIES)?;
            let _ = txn.open_table(EDGES)?;
            let _ = txn.open_table(MENTIONS)?;
            let _ = txn.open_multimap_table(EPISODES_BY_GROUP)?;
            let _ = txn.open_multimap_table(ENTITIES_BY_GROUP)?;
            let _ = txn.open_multimap_table(ENTITIES_BY_NAME)?;
            let _ = txn.open_multimap_table(EDGES_BY_GROUP)?;
            let _ = txn.open_multimap_table(EDGES_BY_SOURCE)?;
            let _ = txn.open_multimap_table(EDGES_BY_TARGET)?;
            let _ = txn.open_multimap_table(EDGES_BY_EPISODE)?;
            let _ = txn.open_multimap_table(MENTIONS_BY_EPISODE)?;
            let _ = txn.open_multimap_table(MENTIONS_BY_ENTITY)?;
            let mut meta = txn.open_table(META)?;
            let existing = meta
                .get(SCHEMA_VERSION_KEY)?
                .and_then(|v| std::str::from_utf8(v.value()).ok().map(str::to_string))
                .and_then(|s| s.parse::<u32>().ok());
            match existing {
                None => {
                    meta.insert(
                        SCHEMA_VERSION_KEY,
                        CURRENT_SCHEMA_VERSION.to_string().as_bytes(),
                    )?;
                }
                Some(v) if v == CURRENT_SCHEMA_VERSION => {}
                Some(v) => {
                    return Err(WeaveError::Validation(format!(
                        "Store schema v{} does not match this binary's v{}",
                        v, CURRENT_SCHEMA_VERSION
                    )));
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn warm_indexes(&self) -> Result<()> {
        let txn = self.db.begin_read()?;
        {
            let table = txn.open_table(ENTITIES)?;
            let mut index = self.entity_index.write().unwrap();
            for item in table.iter()? {
                let (_, value) = item?;
                let entity: Entity = bincode::deserialize(value.value())?;
                if !entity.embedding.is_empty() {
                    index.insert(entity.id, &entity.group_id, &entity.embedding)?;
                }
            }
            index.rebuild();
        }
        {
            let table = txn.open_table(EDGES)?;
            let mut index = self.edge_index.write().unwrap();
            for item in table.iter()? {
                let (_, value) = item?;
                let edge: RelationEdge = bincode::deserialize(value.value())?;
                if !edge.fact_embedding.is_empty() {
                    index.insert(edge.id, &edge.group_id, &edge.fact_embedding)?;
                }
            }
            index.rebuild();
        }
        Ok(())
    }

    fn key(id: &Uuid) -> [u8; 16] {
        *id.as_bytes()
    }

    fn read_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EPISODES)?;
        match table.get(&Self::key(&id))? {
            Some(v) => Ok(Some(bincode::deserialize(v.value())?)),
            None => Ok(None),
        }
    }

    fn read_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        match table.get(&Self::key(&id))? {
            Some(v) => Ok(Some(bincode::deserialize(v.value())?)),
            None => Ok(None),
        }
    }

    fn read_edge(&self, id: EdgeId) -> Result<Option<RelationEdge>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EDGES)?;
        match table.get(&Self::key(&id))? {
            Some(v) => Ok(Some(bincode::deserialize(v.value())?)),
            None => Ok(None),
        }
    }

    /// Episodes of the given groups; every episode when `group_ids` is
    /// empty.
    fn episodes_in_groups(&self, group_ids: &[String]) -> Result<Vec<Episode>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EPISODES)?;
        let mut out = Vec::new();
        if group_ids.is_empty() {
            for item in table.iter()? {
                let (_, value) = item?;
                out.push(bincode::deserialize(value.value())?);
            }
        } else {
            let by_group = txn.open_multimap_table(EPISODES_BY_GROUP)?;
            for group in group_ids {
                for id in by_group.get(group.as_str())? {
                    let id = id?;
                    if let Some(v) = table.get(id.value())? {
                        out.push(bincode::deserialize(v.value())?);
                    }
                }
            }
        }
        Ok(out)
    }

    fn entities_in_groups(&self, group_ids: &[String]) -> Result<Vec<Entity>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        let mut out = Vec::new();
        if group_ids.is_empty() {
            for item in table.iter()? {
                let (_, value) = item?;
                out.push(bincode::deserialize(value.value())?);
            }
        } else {
            let by_group = txn.open_multimap_table(ENTITIES_BY_GROUP)?;
            for group in group_ids {
                for id in by_group.get(group.as_str())? {
                    let id = id?;
                    if let Some(v) = table.get(id.value())? {
                        out.push(bincode::deserialize(v.value())?);
                    }
                }
            }
        }
        Ok(out)
    }

    fn edges_in_groups(&self, group_ids: &[String]) -> Result<Vec<RelationEdge>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EDGES)?;
        let mut out = Vec::new();
        if group_ids.is_empty() {
            for item in table.iter()? {
                let (_, value) = item?;
                out.push(bincode::deserialize(value.value())?);
            }
        } else {
            let by_group = txn.open_multimap_table(EDGES_BY_GROUP)?;
            for group in group_ids {
                for id in by_group.get(group.as_str())? {
                    let id = id?;
                    if let Some(v) = table.get(id.value())? {
                        out.push(bincode::deserialize(v.value())?);
                    }
                }
            }
        }
        Ok(out)
    }

    fn edge_ids_for_entity(&self, id: EntityId) -> Result<Vec<EdgeId>> {
        let txn = self.db.begin_read()?;
        let by_source = txn.open_multimap_table(EDGES_BY_SOURCE)?;
        let by_target = txn.open_multimap_table(EDGES_BY_TARGET)?;
        let key = Self::key(&id);
        let mut ids = HashSet::new();
        for item in by_source.get(&key)? {
            ids.insert(Uuid::from_bytes(*item?.value()));
        }
        for item in by_target.get(&key)? {
            ids.insert(Uuid::from_bytes(*item?.value()));
        }
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl GraphStore for RedbGraphStore {
    async fn bootstrap(&self) -> Result<()> {
        // Tables are created at open; bootstrap re-verifies so callers
        // can run it unconditionally at startup.
        self.init_tables()
    }

    async fn put_episode(&self, episode: &Episode) -> Result<()> {
        let bytes = bincode::serialize(episode)?;
        let key = Self::key(&episode.id);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EPISODES)?;
            let old: Option<Episode> = match table.get(&key)? {
                Some(v) => Some(bincode::deserialize(v.value())?),
                None => None,
            };
            table.insert(&key, bytes.as_slice())?;

            let mut by_group = txn.open_multimap_table(EPISODES_BY_GROUP)?;
            if let Some(old) = old {
                if old.group_id != episode.group_id {
                    by_group.remove(old.group_id.as_str(), &key)?;
                }
            }
            by_group.insert(episode.group_id.as_str(), &key)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        self.read_episode(id)
    }

    async fn episode_by_name(&self, group_id: &str, name: &str) -> Result<Option<Episode>> {
        // Linear scan within the group; there is no name index.
        let episodes = self.episodes_in_groups(&[group_id.to_string()])?;
        Ok(episodes.into_iter().find(|e| e.name == name))
    }

    async fn recent_episodes(&self, group_ids: &[String], limit: usize) -> Result<Vec<Episode>> {
        let mut episodes = self.episodes_in_groups(group_ids)?;
        episodes.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at));
        episodes.truncate(limit);
        Ok(episodes)
    }

    async fn episode_lexical(
        &self,
        group_ids: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<(EpisodeId, f32)>> {
        let docs: Vec<(Uuid, String)> = self
            .episodes_in_groups(group_ids)?
            .into_iter()
            .map(|e| (e.id, format!("{}\n{}", e.name, e.body)))
            .collect();
        Ok(self.scorer.rank(query, &docs, k))
    }

    async fn delete_episode(&self, id: EpisodeId) -> Result<CascadeReport> {
        let episode = self
            .read_episode(id)?
            .ok_or(WeaveError::EpisodeNotFound(id))?;
        let episode_key = Self::key(&id);

        let mut report = CascadeReport {
            episode_id: id,
            ..CascadeReport::default()
        };
        let mut removed_edge_ids: Vec<EdgeId> = Vec::new();
        let mut removed_entity_ids: Vec<EntityId> = Vec::new();

        let txn = self.db.begin_write()?;
        {
            let mut episodes = txn.open_table(EPISODES)?;
            let mut entities = txn.open_table(ENTITIES)?;
            let mut edges = txn.open_table(EDGES)?;
            let mut mentions = txn.open_table(MENTIONS)?;
            let mut episodes_by_group = txn.open_multimap_table(EPISODES_BY_GROUP)?;
            let mut entities_by_group = txn.open_multimap_table(ENTITIES_BY_GROUP)?;
            let mut entities_by_name = txn.open_multimap_table(ENTITIES_BY_NAME)?;
            let mut edges_by_group = txn.open_multimap_table(EDGES_BY_GROUP)?;
            let mut edges_by_source = txn.open_multimap_table(EDGES_BY_SOURCE)?;
            let mut edges_by_target = txn.open_multimap_table(EDGES_BY_TARGET)?;
            let mut edges_by_episode = txn.open_multimap_table(EDGES_BY_EPISODE)?;
            let mut mentions_by_episode = txn.open_multimap_table(MENTIONS_BY_EPISODE)?;
            let mut mentions_by_entity = txn.open_multimap_table(MENTIONS_BY_ENTITY)?;

            // Entities whose liveness we must re-check afterwards.
            let mut touched_entities: HashSet<EntityId> = HashSet::new();

            // 1. Remove the episode's mentions.
            let mention_ids: Vec<MentionId> = {
                let mut ids = Vec::new();
                for item in mentions_by_episode.get(&episode_key)? {
                    ids.push(Uuid::from_bytes(*item?.value()));
                }
                ids
            };
            for mention_id in mention_ids {
                let mention_key = Self::key(&mention_id);
                if let Some(v) = mentions.get(&mention_key)? {
                    let mention: Mention = bincode::deserialize(v.value())?;
                    touched_entities.insert(mention.entity_id);
                    mentions_by_entity.remove(&Self::key(&mention.entity_id), &mention_key)?;
                }
                mentions.remove(&mention_key)?;
                mentions_by_episode.remove(&episode_key, &mention_key)?;
                report.mentions_removed += 1;
            }

            // 2. Unhook the episode from every edge that cites it;
            //    edges left with no citation go away.
            let edge_ids: Vec<EdgeId> = {
                let mut ids = Vec::new();
                for item in edges_by_episode.get(&episode_key)? {
                    ids.push(Uuid::from_bytes(*item?.value()));
                }
                ids
            };
            for edge_id in edge_ids {
                let edge_key = Self::key(&edge_id);
                let Some(v) = edges.get(&edge_key)? else {
                    edges_by_episode.remove(&episode_key, &edge_key)?;
                    continue;
                };
                let mut edge: RelationEdge = bincode::deserialize(v.value())?;
                drop(v);
                edge.episode_ids.retain(|e| *e != id);
                edges_by_episode.remove(&episode_key, &edge_key)?;
                touched_entities.insert(edge.source_entity_id);
                touched_entities.insert(edge.target_entity_id);

                if edge.episode_ids.is_empty() {
                    edges.remove(&edge_key)?;
                    edges_by_group.remove(edge.group_id.as_str(), &edge_key)?;
                    edges_by_source.remove(&Self::key(&edge.source_entity_id), &edge_key)?;
                    edges_by_target.remove(&Self::key(&edge.target_entity_id), &edge_key)?;
                    removed_edge_ids.push(edge_id);
                    report.edges_deleted += 1;
                } else {
                    edges.insert(&edge_key, bincode::serialize(&edge)?.as_slice())?;
                    report.edges_updated += 1;
                }
            }

            // 3. Remove the episode itself.
            episodes.remove(&episode_key)?;
            episodes_by_group.remove(episode.group_id.as_str(), &episode_key)?;

            // 4. Garbage-collect entities left with no incident edge
            //    and no mention.
            for entity_id in touched_entities {
                let entity_key = Self::key(&entity_id);
                let has_mention = mentions_by_entity.get(&entity_key)?.next().is_some();
                let has_edge = edges_by_source.get(&entity_key)?.next().is_some()
                    || edges_by_target.get(&entity_key)?.next().is_some();
                if has_mention || has_edge {
                    continue;
                }
                let maybe_entity: Option<Entity> = match entities.get(&entity_key)? {
                    Some(v) => Some(bincode::deserialize(v.value())?),
                    None => None,
                };
                if let Some(entity) = maybe_entity {
                    entities.remove(&entity_key)?;
                    entities_by_group.remove(entity.group_id.as_str(), &entity_key)?;
                    entities_by_name.remove(
                        name_key(
                            &entity.group_id,
                            &crate::types::normalize_name(&entity.canonical_name),
                        )
                        .as_str(),
                        &entity_key,
                    )?;
                    removed_entity_ids.push(entity_id);
                    report.entities_deleted += 1;
                }
            }
        }
        txn.commit()?;

        {
            let mut index = self.edge_index.write().unwrap();
            for edge_id in removed_edge_ids {
                index.remove(edge_id);
            }
        }
        {
            let mut index = self.entity_index.write().unwrap();
            for entity_id in removed_entity_ids {
                index.remove(entity_id);
            }
        }
        Ok(report)
    }

    async fn put_entity(&self, entity: &Entity) -> Result<()> {
        let bytes = bincode::serialize(entity)?;
        let key = Self::key(&entity.id);
        let normalized = crate::types::normalize_name(&entity.canonical_name);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTITIES)?;
            let old: Option<Entity> = match table.get(&key)? {
                Some(v) => Some(bincode::deserialize(v.value())?),
                None => None,
            };
            table.insert(&key, bytes.as_slice())?;

            let mut by_group = txn.open_multimap_table(ENTITIES_BY_GROUP)?;
            let mut by_name = txn.open_multimap_table(ENTITIES_BY_NAME)?;
            if let Some(old) = old {
                let old_norm = crate::types::normalize_name(&old.canonical_name);
                if old.group_id != entity.group_id || old_norm != normalized {
                    by_name.remove(name_key(&old.group_id, &old_norm).as_str(), &key)?;
                }
                if old.group_id != entity.group_id {
                    by_group.remove(old.group_id.as_str(), &key)?;
                }
            }
            by_group.insert(entity.group_id.as_str(), &key)?;
            by_name.insert(name_key(&entity.group_id, &normalized).as_str(), &key)?;
        }
        txn.commit()?;

        if !entity.embedding.is_empty() {
            let mut index = self.entity_index.write().unwrap();
            index.insert(entity.id, &entity.group_id, &entity.embedding)?;
            index.maybe_rebuild();
        }
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        self.read_entity(id)
    }

    async fn entities_by_name(&self, group_id: &str, normalized: &str) -> Result<Vec<Entity>> {
        let txn = self.db.begin_read()?;
        let by_name = txn.open_multimap_table(ENTITIES_BY_NAME)?;
        let table = txn.open_table(ENTITIES)?;
        let mut out = Vec::new();
        for item in by_name.get(name_key(group_id, normalized).as_str())? {
            let id = item?;
            if let Some(v) = table.get(id.value())? {
                out.push(bincode::deserialize(v.value())?);
            }
        }
        Ok(out)
    }

    async fn entity_knn(
        &self,
        group_ids: &[String],
        query: &Embedding,
        k: usize,
    ) -> Result<Vec<(EntityId, f32)>> {
        let index = self.entity_index.read().unwrap();
        Ok(index
            .search(query, k, group_ids)
            .into_iter()
            .map(|n| (n.id, n.score))
            .collect())
    }

    async fn entity_lexical(
        &self,
        group_ids: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<(EntityId, f32)>> {
        let docs: Vec<(Uuid, String)> = self
            .entities_in_groups(group_ids)?
            .into_iter()
            .map(|e| (e.id, format!("{}\n{}", e.canonical_name, e.summary)))
            .collect();
        Ok(self.scorer.rank(query, &docs, k))
    }

    async fn delete_entity(&self, id: EntityId) -> Result<()> {
        let Some(entity) = self.read_entity(id)? else {
            return Err(WeaveError::EntityNotFound(id));
        };
        let key = Self::key(&id);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTITIES)?;
            table.remove(&key)?;
            let mut by_group = txn.open_multimap_table(ENTITIES_BY_GROUP)?;
            by_group.remove(entity.group_id.as_str(), &key)?;
            let mut by_name = txn.open_multimap_table(ENTITIES_BY_NAME)?;
            by_name.remove(
                name_key(
                    &entity.group_id,
                    &crate::types::normalize_name(&entity.canonical_name),
                )
                .as_str(),
                &key,
            )?;
        }
        txn.commit()?;
        self.entity_index.write().unwrap().remove(id);
        Ok(())
    }

    async fn put_edge(&self, edge: &RelationEdge) -> Result<()> {
        let bytes = bincode::serialize(edge)?;
        let key = Self::key(&edge.id);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EDGES)?;
            let old: Option<RelationEdge> = match table.get(&key)? {
                Some(v) => Some(bincode::deserialize(v.value())?),
                None => None,
            };
            table.insert(&key, bytes.as_slice())?;

            let mut by_group = txn.open_multimap_table(EDGES_BY_GROUP)?;
            let mut by_source = txn.open_multimap_table(EDGES_BY_SOURCE)?;
            let mut by_target = txn.open_multimap_table(EDGES_BY_TARGET)?;
            let mut by_episode = txn.open_multimap_table(EDGES_BY_EPISODE)?;

            if let Some(old) = &old {
                if old.group_id != edge.group_id {
                    by_group.remove(old.group_id.as_str(), &key)?;
                }
                if old.source_entity_id != edge.source_entity_id {
                    by_source.remove(&Self::key(&old.source_entity_id), &key)?;
                }
                if old.target_entity_id != edge.target_entity_id {
                    by_target.remove(&Self::key(&old.target_entity_id), &key)?;
                }
                for episode_id in &old.episode_ids {
                    if !edge.episode_ids.contains(episode_id) {
                        by_episode.remove(&Self::key(episode_id), &key)?;
                    }
                }
            }
            by_group.insert(edge.group_id.as_str(), &key)?;
            by_source.insert(&Self::key(&edge.source_entity_id), &key)?;
            by_target.insert(&Self::key(&edge.target_entity_id), &key)?;
            for episode_id in &edge.episode_ids {
                by_episode.insert(&Self::key(episode_id), &key)?;
            }
        }
        txn.commit()?;

        if !edge.fact_embedding.is_empty() {
            let mut index = self.edge_index.write().unwrap();
            index.insert(edge.id, &edge.group_id, &edge.fact_embedding)?;
            index.maybe_rebuild();
        }
        Ok(())
    }

    async fn supersede_edge(
        &self,
        expired: &RelationEdge,
        successor: &RelationEdge,
    ) -> Result<()> {
        if expired.expired_at.is_none() {
            return Err(WeaveError::Internal(
                "supersede_edge called with an unexpired predecessor".to_string(),
            ));
        }
        let expired_bytes = bincode::serialize(expired)?;
        let successor_bytes = bincode::serialize(successor)?;
        let expired_key = Self::key(&expired.id);
        let successor_key = Self::key(&successor.id);

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EDGES)?;
            table.insert(&expired_key, expired_bytes.as_slice())?;
            table.insert(&successor_key, successor_bytes.as_slice())?;

            let mut by_group = txn.open_multimap_table(EDGES_BY_GROUP)?;
            let mut by_source = txn.open_multimap_table(EDGES_BY_SOURCE)?;
            let mut by_target = txn.open_multimap_table(EDGES_BY_TARGET)?;
            let mut by_episode = txn.open_multimap_table(EDGES_BY_EPISODE)?;
            by_group.insert(successor.group_id.as_str(), &successor_key)?;
            by_source.insert(&Self::key(&successor.source_entity_id), &successor_key)?;
            by_target.insert(&Self::key(&successor.target_entity_id), &successor_key)?;
            for episode_id in &successor.episode_ids {
                by_episode.insert(&Self::key(episode_id), &successor_key)?;
            }
        }
        txn.commit()?;

        if !successor.fact_embedding.is_empty() {
            let mut index = self.edge_index.write().unwrap();
            index.insert(successor.id, &successor.group_id, &successor.fact_embedding)?;
            index.maybe_rebuild();
        }
        Ok(())
    }

    async fn get_edge(&self, id: EdgeId) -> Result<Option<RelationEdge>> {
        self.read_edge(id)
    }

    async fn edges_between(
        &self,
        source: EntityId,
        target: EntityId,
    ) -> Result<Vec<RelationEdge>> {
        let txn = self.db.begin_read()?;
        let by_source = txn.open_multimap_table(EDGES_BY_SOURCE)?;
        let table = txn.open_table(EDGES)?;
        let mut out = Vec::new();
        for item in by_source.get(&Self::key(&source))? {
            let id = item?;
            if let Some(v) = table.get(id.value())? {
                let edge: RelationEdge = bincode::deserialize(v.value())?;
                if edge.target_entity_id == target {
                    out.push(edge);
                }
            }
        }
        Ok(out)
    }

    async fn edges_for_entity(&self, id: EntityId) -> Result<Vec<RelationEdge>> {
        let ids = self.edge_ids_for_entity(id)?;
        let mut out = Vec::with_capacity(ids.len());
        for edge_id in ids {
            if let Some(edge) = self.read_edge(edge_id)? {
                out.push(edge);
            }
        }
        Ok(out)
    }

    async fn edge_knn(
        &self,
        group_ids: &[String],
        query: &Embedding,
        k: usize,
    ) -> Result<Vec<(EdgeId, f32)>> {
        let index = self.edge_index.read().unwrap();
        Ok(index
            .search(query, k, group_ids)
            .into_iter()
            .map(|n| (n.id, n.score))
            .collect())
    }

    async fn edge_lexical(
        &self,
        group_ids: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<(EdgeId, f32)>> {
        let docs: Vec<(Uuid, String)> = self
            .edges_in_groups(group_ids)?
            .into_iter()
            .map(|e| (e.id, e.fact))
            .collect();
        Ok(self.scorer.rank(query, &docs, k))
    }

    async fn delete_edge(&self, id: EdgeId) -> Result<()> {
        let Some(edge) = self.read_edge(id)? else {
            return Err(WeaveError::EdgeNotFound(id));
        };
        let key = Self::key(&id);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EDGES)?;
            table.remove(&key)?;
            let mut by_group = txn.open_multimap_table(EDGES_BY_GROUP)?;
            by_group.remove(edge.group_id.as_str(), &key)?;
            let mut by_source = txn.open_multimap_table(EDGES_BY_SOURCE)?;
            by_source.remove(&Self::key(&edge.source_entity_id), &key)?;
            let mut by_target = txn.open_multimap_table(EDGES_BY_TARGET)?;
            by_target.remove(&Self::key(&edge.target_entity_id), &key)?;
            let mut by_episode = txn.open_multimap_table(EDGES_BY_EPISODE)?;
            for episode_id in &edge.episode_ids {
                by_episode.remove(&Self::key(episode_id), &key)?;
            }
        }
        txn.commit()?;
        self.edge_index.write().unwrap().remove(id);
        Ok(())
    }

    async fn put_mention(&self, mention: &Mention) -> Result<()> {
        let bytes = bincode::serialize(mention)?;
        let key = Self::key(&mention.id);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(MENTIONS)?;
            table.insert(&key, bytes.as_slice())?;
            let mut by_episode = txn.open_multimap_table(MENTIONS_BY_EPISODE)?;
            by_episode.insert(&Self::key(&mention.episode_id), &key)?;
            let mut by_entity = txn.open_multimap_table(MENTIONS_BY_ENTITY)?;
            by_entity.insert(&Self::key(&mention.entity_id), &key)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn mentions_of_entity(&self, id: EntityId) -> Result<Vec<Mention>> {
        let txn = self.db.begin_read()?;
        let by_entity = txn.open_multimap_table(MENTIONS_BY_ENTITY)?;
        let table = txn.open_table(MENTIONS)?;
        let mut out = Vec::new();
        for item in by_entity.get(&Self::key(&id))? {
            let mention_id = item?;
            if let Some(v) = table.get(mention_id.value())? {
                out.push(bincode::deserialize(v.value())?);
            }
        }
        Ok(out)
    }

    async fn mentions_in_episode(&self, id: EpisodeId) -> Result<Vec<Mention>> {
        let txn = self.db.begin_read()?;
        let by_episode = txn.open_multimap_table(MENTIONS_BY_EPISODE)?;
        let table = txn.open_table(MENTIONS)?;
        let mut out = Vec::new();
        for item in by_episode.get(&Self::key(&id))? {
            let mention_id = item?;
            if let Some(v) = table.get(mention_id.value())? {
                out.push(bincode::deserialize(v.value())?);
            }
        }
        Ok(out)
    }

    async fn neighborhood(&self, center: EntityId, max_hops: u32) -> Result<Neighborhood> {
        let mut result = Neighborhood::default();
        if self.read_entity(center)?.is_none() {
            return Ok(result);
        }
        result.hops.insert(center, 0);

        // BFS over unexpired edges, visited-set keyed by id so entity
        // cycles terminate.
        let mut seen_edges: HashSet<EdgeId> = HashSet::new();
        let mut frontier: VecDeque<(EntityId, u32)> = VecDeque::new();
        frontier.push_back((center, 0));

        while let Some((entity_id, depth)) = frontier.pop_front() {
            if depth >= max_hops {
                continue;
            }
            for edge in self.edges_for_entity(entity_id).await? {
                if edge.expired_at.is_some() {
                    continue;
                }
                let neighbor = if edge.source_entity_id == entity_id {
                    edge.target_entity_id
                } else {
                    edge.source_entity_id
                };
                if seen_edges.insert(edge.id) {
                    result.edges.push(edge);
                }
                if !result.hops.contains_key(&neighbor) {
                    result.hops.insert(neighbor, depth + 1);
                    frontier.push_back((neighbor, depth + 1));
                }
            }
        }
        Ok(result)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let txn = self.db.begin_read()?;
        let episodes = txn.open_table(EPISODES)?;
        let entities = txn.open_table(ENTITIES)?;
        let edges = txn.open_table(EDGES)?;
        let mentions = txn.open_table(MENTIONS)?;

        let mut expired = 0u64;
        for item in edges.iter()? {
            let (_, value) = item?;
            let edge: RelationEdge = bincode::deserialize(value.value())?;
            if edge.expired_at.is_some() {
                expired += 1;
            }
        }
        Ok(StoreStats {
            episode_count: episodes.len()?,
            entity_count: entities.len()?,
            edge_count: edges.len()?,
            mention_count: mentions.len()?,
            expired_edge_count: expired,
        })
    }
}
