pub mod blob;
pub mod db;
pub mod kv;
pub mod model;

pub use db::RedbStorage;
pub use kv::{KeyValueStorage, MemoryStorage, StorageError, UnavailableStorage};
pub use model::{ClickMap, ClickRecord};
