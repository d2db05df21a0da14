pub mod collection;
pub mod config;
pub mod document;
pub mod domain;
pub mod engine;
pub mod error;
pub mod globus;
pub mod jobs;
pub mod notify;
pub mod output;
pub mod permissions;
pub mod smrtlink;
pub mod staging;
pub mod store;
