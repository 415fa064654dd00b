pub mod model;

pub use model::{
    AggregateInfo, EntityRecord, EntryFragment, EntryRecord, HistoryRow, IndexMode, IndexState,
    StorageRecord, TypeTotals,
};
