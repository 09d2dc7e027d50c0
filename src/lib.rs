#![allow(clippy::result_large_err)]
// Library entrypoint for integration tests and internal reuse.
pub mod api;
pub mod config;
pub mod config_store;
pub mod dispatcher;
pub mod i18n;
pub mod normalizer;
pub mod orchestrator;
pub mod poller;
pub mod schemas;
pub mod shutdown;
pub mod state;
pub mod storage;
