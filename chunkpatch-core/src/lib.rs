pub mod chunk_id;
pub mod chunk_source;
pub mod chunk_store;
pub mod constructor;
pub mod control;
pub mod error;
pub mod hash_cache;
pub mod localize;
pub mod manifest;
pub mod packager;
pub mod path_safety;
pub mod platform;
pub mod progress;
pub mod reference_tracker;
pub mod resume;
pub mod stat;
pub mod verify;

