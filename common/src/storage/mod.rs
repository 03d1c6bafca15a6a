pub mod db;
pub mod keys;
pub mod lock;
pub mod progress;
pub mod store;
pub mod types;
