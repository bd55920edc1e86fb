//! In-memory persistence
//!
//! Sessions take the store lock for their whole lifetime and work on a copy;
//! commit swaps the copy in, rollback and drop discard it. This serializes
//! sessions, which is all a single-node reference store needs.

use super::query;
use super::traits::{
    ChangeOrder, ChangesQuery, EraseRequest, EraseResult, HistoryPage, HistoryQuery, Persistence,
    PersistenceSession, ReindexRequest, ReindexResult, SearchResult,
};
use crate::models::{resource, ChangeRecord, ChangeType, Resource};
use crate::search::SearchContext;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Key = (String, String);

fn key(resource_type: &str, id: &str) -> Key {
    (resource_type.to_string(), id.to_string())
}

#[derive(Debug, Clone, Default)]
struct Store {
    /// All versions of each resource, oldest first.
    versions: HashMap<Key, Vec<Resource>>,
    changes: Vec<ChangeRecord>,
    last_change_id: i64,
    reindexed_at: HashMap<Key, DateTime<Utc>>,
}

impl Store {
    fn latest(&self, resource_type: &str, id: &str) -> Option<&Resource> {
        self.versions.get(&key(resource_type, id))?.last()
    }

    /// Latest version of every live resource.
    fn current(&self) -> impl Iterator<Item = &Resource> {
        self.versions
            .values()
            .filter_map(|v| v.last())
            .filter(|r| !r.deleted)
    }

    fn append(&mut self, resource: Resource, change_type: ChangeType) -> Resource {
        self.last_change_id += 1;
        self.changes.push(ChangeRecord {
            change_id: self.last_change_id,
            changed_at: resource.last_updated,
            resource_type: resource.resource_type.clone(),
            logical_id: resource.id.clone(),
            version_id: resource.version_id,
            change_type,
        });
        self.versions
            .entry(key(&resource.resource_type, &resource.id))
            .or_default()
            .push(resource.clone());
        resource
    }

    fn changes(&self, q: &ChangesQuery) -> Vec<ChangeRecord> {
        let mut records: Vec<&ChangeRecord> = self
            .changes
            .iter()
            .filter(|c| q.resource_types.is_empty() || q.resource_types.contains(&c.resource_type))
            .collect();

        match q.order {
            ChangeOrder::ChangeId => {
                if let Some(marker) = q.change_id_marker {
                    records.retain(|c| c.change_id > marker);
                }
                if let Some(since) = q.since {
                    records.retain(|c| c.changed_at >= since);
                }
                if let Some(before) = q.before {
                    records.retain(|c| c.changed_at < before);
                }
                records.sort_by_key(|c| c.change_id);
            }
            ChangeOrder::LastUpdatedAsc => {
                if let Some(since) = q.since {
                    records.retain(|c| match q.change_id_marker {
                        Some(marker) => (c.changed_at, c.change_id) > (since, marker),
                        None => c.changed_at >= since,
                    });
                }
                if let Some(before) = q.before {
                    records.retain(|c| c.changed_at < before);
                }
                records.sort_by_key(|c| (c.changed_at, c.change_id));
            }
            ChangeOrder::LastUpdatedDesc => {
                if let Some(before) = q.before {
                    records.retain(|c| match q.change_id_marker {
                        Some(marker) => (c.changed_at, c.change_id) < (before, marker),
                        None => c.changed_at < before,
                    });
                }
                if let Some(since) = q.since {
                    records.retain(|c| c.changed_at >= since);
                }
                records.sort_by_key(|c| std::cmp::Reverse((c.changed_at, c.change_id)));
            }
        }

        records.into_iter().take(q.count).cloned().collect()
    }

    fn changes_total(&self, resource_types: &[String]) -> usize {
        self.changes
            .iter()
            .filter(|c| resource_types.is_empty() || resource_types.contains(&c.resource_type))
            .count()
    }

    fn reindex(&mut self, request: &ReindexRequest) -> Result<ReindexResult> {
        let now = Utc::now();

        let targets: Vec<Key> = if request.references.is_empty() {
            let mut candidates: Vec<Key> = self
                .current()
                .filter(|r| {
                    request
                        .resource_type
                        .as_deref()
                        .map_or(true, |rt| r.resource_type == rt)
                })
                .map(|r| key(&r.resource_type, &r.id))
                .filter(|k| match (request.reindex_before, self.reindexed_at.get(k)) {
                    (Some(before), Some(done)) => *done < before,
                    _ => true,
                })
                .collect();
            candidates.sort();
            candidates.truncate(request.max_resources);
            candidates
        } else {
            let mut keys = Vec::with_capacity(request.references.len());
            for reference in &request.references {
                let (rt, id) = reference.split_once('/').ok_or_else(|| {
                    crate::Error::InvalidArgument(format!("Invalid reference '{}'", reference))
                })?;
                if self.latest(rt, id).filter(|r| !r.deleted).is_none() {
                    return Err(crate::Error::ResourceNotFound {
                        resource_type: rt.to_string(),
                        id: id.to_string(),
                    });
                }
                keys.push(key(rt, id));
            }
            keys
        };

        for k in &targets {
            self.reindexed_at.insert(k.clone(), now);
        }
        Ok(ReindexResult {
            processed: targets.len(),
            references: targets
                .into_iter()
                .map(|(rt, id)| format!("{}/{}", rt, id))
                .collect(),
        })
    }

    fn erase(&mut self, request: &EraseRequest) -> Result<EraseResult> {
        let k = key(&request.resource_type, &request.id);
        let not_found = || crate::Error::ResourceNotFound {
            resource_type: request.resource_type.clone(),
            id: request.id.clone(),
        };

        let versions = self.versions.get_mut(&k).ok_or_else(not_found)?;
        let erased = match request.version {
            None => {
                let n = versions.len();
                versions.clear();
                n
            }
            Some(v) => {
                let before = versions.len();
                versions.retain(|r| r.version_id != v);
                if versions.len() == before {
                    return Err(crate::Error::VersionNotFound {
                        resource_type: request.resource_type.clone(),
                        id: request.id.clone(),
                        version_id: v.to_string(),
                    });
                }
                1
            }
        };

        let remaining: HashSet<i32> = versions.iter().map(|r| r.version_id).collect();
        if remaining.is_empty() {
            self.versions.remove(&k);
            self.reindexed_at.remove(&k);
        }
        self.changes.retain(|c| {
            c.resource_type != request.resource_type
                || c.logical_id != request.id
                || remaining.contains(&c.version_id)
        });

        Ok(EraseResult {
            resource_type: request.resource_type.clone(),
            id: request.id.clone(),
            versions_erased: erased,
            partial: false,
        })
    }

    fn search(&self, ctx: &SearchContext) -> SearchResult {
        let mut hits: Vec<&Resource> = self.current().filter(|r| query::matches(r, ctx)).collect();
        hits.sort_by(|a, b| query::compare(a, b, &ctx.sort));
        let total = hits.len();

        let matches: Vec<Resource> = if ctx.is_count_only() {
            Vec::new()
        } else {
            hits.into_iter()
                .skip(ctx.offset())
                .take(ctx.page_size)
                .cloned()
                .collect()
        };

        let includes = self.includes(&matches, ctx);
        SearchResult {
            matches,
            includes,
            total,
        }
    }

    fn includes(&self, matches: &[Resource], ctx: &SearchContext) -> Vec<Resource> {
        let mut seen: HashSet<String> = matches.iter().map(Resource::reference).collect();
        let mut out = Vec::new();

        for spec in &ctx.includes {
            for m in matches.iter().filter(|m| m.resource_type == spec.source_type) {
                for target in query::reference_targets(&m.resource, &spec.parameter) {
                    let Some((rt, id)) = target.split_once('/') else {
                        continue;
                    };
                    if let Some(found) = self.latest(rt, id).filter(|r| !r.deleted) {
                        if seen.insert(found.reference()) {
                            out.push(found.clone());
                        }
                    }
                }
            }
        }

        if !ctx.revincludes.is_empty() {
            let targets: HashSet<String> = matches.iter().map(Resource::reference).collect();
            for spec in &ctx.revincludes {
                let mut found: Vec<&Resource> = self
                    .current()
                    .filter(|r| r.resource_type == spec.source_type)
                    .filter(|r| {
                        query::reference_targets(&r.resource, &spec.parameter)
                            .iter()
                            .any(|t| targets.contains(t))
                    })
                    .collect();
                found.sort_by(|a, b| query::compare(a, b, &[]));
                for r in found {
                    if seen.insert(r.reference()) {
                        out.push(r.clone());
                    }
                }
            }
        }
        out
    }

    fn history(
        &self,
        resource_type: Option<&str>,
        id: Option<&str>,
        q: &HistoryQuery,
    ) -> Result<HistoryPage> {
        let mut versions: Vec<&Resource> = match (resource_type, id) {
            (Some(rt), Some(id)) => self
                .versions
                .get(&key(rt, id))
                .ok_or_else(|| crate::Error::ResourceNotFound {
                    resource_type: rt.to_string(),
                    id: id.to_string(),
                })?
                .iter()
                .collect(),
            (Some(rt), None) => self
                .versions
                .iter()
                .filter(|((t, _), _)| t == rt)
                .flat_map(|(_, v)| v.iter())
                .collect(),
            (None, _) => self.versions.values().flat_map(|v| v.iter()).collect(),
        };

        if let Some(since) = q.since {
            versions.retain(|r| r.last_updated >= since);
        }
        if let Some(at) = q.at {
            versions.retain(|r| r.last_updated <= at);
            let mut newest: HashMap<Key, i32> = HashMap::new();
            for r in &versions {
                let slot = newest.entry(key(&r.resource_type, &r.id)).or_insert(0);
                *slot = (*slot).max(r.version_id);
            }
            versions.retain(|r| newest.get(&key(&r.resource_type, &r.id)) == Some(&r.version_id));
        }

        versions.sort_by(|a, b| {
            a.last_updated
                .cmp(&b.last_updated)
                .then_with(|| a.version_id.cmp(&b.version_id))
        });
        if !q.sort_ascending {
            versions.reverse();
        }

        let total = versions.len();
        let entries = versions
            .into_iter()
            .skip(q.page.saturating_sub(1) * q.count)
            .take(q.count)
            .cloned()
            .collect();
        Ok(HistoryPage { total, entries })
    }
}

/// Transactional in-memory store.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    store: Arc<Mutex<Store>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct InMemorySession {
    guard: OwnedMutexGuard<Store>,
    working: Store,
}

#[async_trait]
impl PersistenceSession for InMemorySession {
    async fn create(&mut self, resource: &Resource) -> Result<Resource> {
        if self.working.latest(&resource.resource_type, &resource.id).is_some() {
            return Err(crate::Error::Conflict(format!(
                "Resource '{}' already exists",
                resource.reference()
            )));
        }
        if resource.version_id != 1 {
            return Err(crate::Error::Internal(format!(
                "create of '{}' must start at version 1",
                resource.reference()
            )));
        }
        Ok(self.working.append(resource.clone(), ChangeType::Create))
    }

    async fn update(&mut self, resource: &Resource) -> Result<Resource> {
        let expected = self
            .working
            .latest(&resource.resource_type, &resource.id)
            .map(|r| r.version_id + 1)
            .unwrap_or(1);
        if resource.version_id != expected {
            return Err(crate::Error::Conflict(format!(
                "Version {} of '{}' is not the next version (expected {})",
                resource.version_id,
                resource.reference(),
                expected
            )));
        }
        let change_type = if expected == 1 {
            ChangeType::Create
        } else {
            ChangeType::Update
        };
        Ok(self.working.append(resource.clone(), change_type))
    }

    async fn read(&mut self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        Ok(self.working.latest(resource_type, id).cloned())
    }

    async fn vread(
        &mut self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> Result<Option<Resource>> {
        Ok(self
            .working
            .versions
            .get(&key(resource_type, id))
            .and_then(|v| v.iter().find(|r| r.version_id == version_id))
            .cloned())
    }

    async fn delete(
        &mut self,
        resource_type: &str,
        id: &str,
        last_updated: DateTime<Utc>,
    ) -> Result<Resource> {
        let current = self.working.latest(resource_type, id).ok_or_else(|| {
            crate::Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }
        })?;
        if current.deleted {
            return Err(crate::Error::ResourceDeleted {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: Some(current.version_id),
            });
        }

        let version_id = current.version_id + 1;
        let last_updated = resource::truncate_to_micros(last_updated);
        let marker = Resource {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            version_id,
            resource: resource::with_meta(
                &json!({ "resourceType": resource_type }),
                id,
                version_id,
                last_updated,
            ),
            last_updated,
            deleted: true,
        };
        Ok(self.working.append(marker, ChangeType::Delete))
    }

    async fn history(
        &mut self,
        resource_type: Option<&str>,
        id: Option<&str>,
        query: &HistoryQuery,
    ) -> Result<HistoryPage> {
        self.working.history(resource_type, id, query)
    }

    async fn search(&mut self, context: &SearchContext) -> Result<SearchResult> {
        Ok(self.working.search(context))
    }

    async fn changes(&mut self, query: &ChangesQuery) -> Result<Vec<ChangeRecord>> {
        Ok(self.working.changes(query))
    }

    async fn changes_total(&mut self, resource_types: &[String]) -> Result<usize> {
        Ok(self.working.changes_total(resource_types))
    }

    async fn reindex(&mut self, request: &ReindexRequest) -> Result<ReindexResult> {
        self.working.reindex(request)
    }

    async fn erase(&mut self, request: &EraseRequest) -> Result<EraseResult> {
        self.working.erase(request)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemorySession { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn begin(&self) -> Result<Box<dyn PersistenceSession>> {
        let guard = self.store.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemorySession { guard, working }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn patient(id: &str, version: i32, family: &str) -> Resource {
        let doc = resource::with_meta(
            &json!({ "resourceType": "Patient", "name": [{ "family": family }] }),
            id,
            version,
            Utc::now(),
        );
        Resource::from_document(doc, false).unwrap()
    }

    #[tokio::test]
    async fn commit_makes_writes_visible() -> anyhow::Result<()> {
        let store = InMemoryPersistence::new();
        let mut session = store.begin().await?;
        session.create(&patient("a", 1, "Doe")).await?;
        session.commit().await?;

        let mut session = store.begin().await?;
        let read = session.read("Patient", "a").await?.unwrap();
        assert_eq!(read.version_id, 1);
        assert!(!read.deleted);
        Ok(())
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_writes() -> anyhow::Result<()> {
        let store = InMemoryPersistence::new();
        let mut session = store.begin().await?;
        session.create(&patient("a", 1, "Doe")).await?;
        session.rollback().await?;

        {
            let mut session = store.begin().await?;
            session.create(&patient("b", 1, "Roe")).await?;
        }

        let mut session = store.begin().await?;
        assert!(session.read("Patient", "a").await?.is_none());
        assert!(session.read("Patient", "b").await?.is_none());
        assert_eq!(store_changes(&store).await?, 0);
        Ok(())
    }

    async fn store_changes(store: &InMemoryPersistence) -> anyhow::Result<usize> {
        let mut session = store.begin().await?;
        Ok(session.changes_total(&[]).await?)
    }

    #[tokio::test]
    async fn sessions_are_serialized() -> anyhow::Result<()> {
        let store = InMemoryPersistence::new();
        let first = store.begin().await?;
        let blocked = tokio::time::timeout(Duration::from_millis(50), store.begin()).await;
        assert!(blocked.is_err());
        first.commit().await?;
        assert!(tokio::time::timeout(Duration::from_millis(50), store.begin())
            .await
            .is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn update_requires_next_version() -> anyhow::Result<()> {
        let store = InMemoryPersistence::new();
        let mut session = store.begin().await?;
        session.create(&patient("a", 1, "Doe")).await?;
        assert!(session.update(&patient("a", 3, "Doe")).await.is_err());
        session.update(&patient("a", 2, "Doe")).await?;
        let deleted = session.delete("Patient", "a", Utc::now()).await?;
        assert_eq!(deleted.version_id, 3);
        assert!(deleted.deleted);
        assert!(matches!(
            session.delete("Patient", "a", Utc::now()).await,
            Err(crate::Error::ResourceDeleted { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn search_pages_and_totals() -> anyhow::Result<()> {
        let store = InMemoryPersistence::new();
        let mut session = store.begin().await?;
        for i in 0..5 {
            session
                .create(&patient(&format!("p{}", i), 1, if i % 2 == 0 { "Doe" } else { "Roe" }))
                .await?;
        }
        let mut ctx = SearchContext::new(Some("Patient"), 2).filter("name", "Doe");
        ctx.page_number = 2;
        let result = session.search(&ctx).await?;
        assert_eq!(result.total, 3);
        assert_eq!(result.matches.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn change_feed_cursor() -> anyhow::Result<()> {
        let store = InMemoryPersistence::new();
        let mut session = store.begin().await?;
        for i in 0..3 {
            session.create(&patient(&format!("p{}", i), 1, "Doe")).await?;
        }
        session.commit().await?;

        let mut session = store.begin().await?;
        let first = session
            .changes(&ChangesQuery {
                count: 2,
                ..Default::default()
            })
            .await?;
        assert_eq!(first.len(), 2);
        let rest = session
            .changes(&ChangesQuery {
                count: 2,
                change_id_marker: Some(first[1].change_id),
                ..Default::default()
            })
            .await?;
        assert_eq!(rest.len(), 1);
        assert!(rest[0].change_id > first[1].change_id);
        Ok(())
    }

    #[tokio::test]
    async fn erase_removes_history() -> anyhow::Result<()> {
        let store = InMemoryPersistence::new();
        let mut session = store.begin().await?;
        session.create(&patient("a", 1, "Doe")).await?;
        session.update(&patient("a", 2, "Doe")).await?;
        session.commit().await?;

        let mut session = store.begin().await?;
        let result = session
            .erase(&EraseRequest {
                resource_type: "Patient".into(),
                id: "a".into(),
                version: None,
            })
            .await?;
        session.commit().await?;
        assert_eq!(result.versions_erased, 2);
        assert_eq!(store_changes(&store).await?, 0);
        let mut session = store.begin().await?;
        assert!(session.read("Patient", "a").await?.is_none());
        Ok(())
    }
}
