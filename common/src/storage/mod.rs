pub mod db;
pub mod reconciler;
pub mod types;
