//! Persistence contract consumed by the REST engine
//!
//! Any storage backend implements [`Persistence`] (the engine-wide handle) and
//! hands out [`PersistenceSession`]s, one per unit of work. A session is a
//! transaction: nothing it writes is visible to other sessions until
//! [`PersistenceSession::commit`], and [`PersistenceSession::rollback`] (or
//! dropping the session) discards it.

use crate::models::{ChangeRecord, Resource};
use crate::search::SearchContext;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Parameters for instance/type history.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub count: usize,
    /// 1-based.
    pub page: usize,
    pub since: Option<DateTime<Utc>>,
    pub at: Option<DateTime<Utc>>,
    pub sort_ascending: bool,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            count: 10,
            page: 1,
            since: None,
            at: None,
            sort_ascending: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub total: usize,
    pub entries: Vec<Resource>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub matches: Vec<Resource>,
    pub includes: Vec<Resource>,
    /// Total number of matches across all pages.
    pub total: usize,
}

/// Ordering of the whole-system change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrder {
    ChangeId,
    LastUpdatedAsc,
    LastUpdatedDesc,
}

/// Cursor-based query over the change log.
#[derive(Debug, Clone)]
pub struct ChangesQuery {
    pub count: usize,
    pub order: ChangeOrder,
    /// Inclusive lower bound on `changed_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `changed_at`.
    pub before: Option<DateTime<Utc>>,
    /// Skip records up to and including this change id (in cursor direction).
    pub change_id_marker: Option<i64>,
    pub resource_types: Vec<String>,
}

impl Default for ChangesQuery {
    fn default() -> Self {
        Self {
            count: 10,
            order: ChangeOrder::ChangeId,
            since: None,
            before: None,
            change_id_marker: None,
            resource_types: Vec::new(),
        }
    }
}

/// Selection of resources for a single reindex call.
#[derive(Debug, Clone, Default)]
pub struct ReindexRequest {
    pub resource_type: Option<String>,
    /// Explicit `Type/id` references; empty means "next resources by type".
    pub references: Vec<String>,
    pub max_resources: usize,
    /// Only resources not reindexed since this instant.
    pub reindex_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexResult {
    pub processed: usize,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseRequest {
    pub resource_type: String,
    pub id: String,
    /// `None` erases every version.
    pub version: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseResult {
    pub resource_type: String,
    pub id: String,
    pub versions_erased: usize,
    pub partial: bool,
}

#[async_trait]
pub trait PersistenceSession: Send {
    /// Store a new resource. `id` and `meta` are already populated.
    async fn create(&mut self, resource: &Resource) -> Result<Resource>;

    /// Store a new version. `meta.versionId` is already the next version.
    async fn update(&mut self, resource: &Resource) -> Result<Resource>;

    /// Current version, deleted versions included (check [`Resource::deleted`]).
    async fn read(&mut self, resource_type: &str, id: &str) -> Result<Option<Resource>>;

    async fn vread(
        &mut self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> Result<Option<Resource>>;

    /// Write a deletion marker as the next version.
    async fn delete(
        &mut self,
        resource_type: &str,
        id: &str,
        last_updated: DateTime<Utc>,
    ) -> Result<Resource>;

    /// Instance history when `id` is set, type history otherwise.
    async fn history(
        &mut self,
        resource_type: Option<&str>,
        id: Option<&str>,
        query: &HistoryQuery,
    ) -> Result<HistoryPage>;

    async fn search(&mut self, context: &SearchContext) -> Result<SearchResult>;

    /// Whole-system change feed.
    async fn changes(&mut self, query: &ChangesQuery) -> Result<Vec<ChangeRecord>>;

    /// Total size of the change feed for the given types.
    async fn changes_total(&mut self, resource_types: &[String]) -> Result<usize>;

    async fn reindex(&mut self, request: &ReindexRequest) -> Result<ReindexResult>;

    /// Physically remove one or all versions of a resource.
    async fn erase(&mut self, request: &EraseRequest) -> Result<EraseResult>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn PersistenceSession>>;

    fn generate_resource_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn is_update_create_enabled(&self) -> bool {
        true
    }

    fn is_delete_supported(&self) -> bool {
        true
    }

    fn is_transactional(&self) -> bool {
        true
    }
}
