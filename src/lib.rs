pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod media;
pub mod model;
pub mod purchase;
pub mod remote;
pub mod store;
pub mod sync;
pub mod trial;
