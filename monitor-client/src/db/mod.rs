pub mod store;

pub use store::{ReadingStore, StoreError, UpsertOutcome};
