//! Core modules for canonry's governance store.
//!
//! Everything the plugins share lives here: the store handle, the broker
//! that all database access goes through, schema DDL, configuration, the
//! data model and the hash primitive.

pub mod broker;
pub mod canonical;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod model;
pub mod schemas;
pub mod store;
pub mod time;
