//! Persistence layer

pub mod memory;
mod query;
pub mod traits;

pub use memory::InMemoryPersistence;
pub use traits::{
    ChangeOrder, ChangesQuery, EraseRequest, EraseResult, HistoryPage, HistoryQuery, Persistence,
    PersistenceSession, ReindexRequest, ReindexResult, SearchResult,
};
