pub mod config;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod error;
pub mod gazetteer;
pub mod judge;
pub mod models;
pub mod negation;
pub mod ollama;
pub mod orchestrator;
pub mod qdrant_store;
pub mod run_stamp;
pub mod sanity;
pub mod semantic;
pub mod span_verifier;
pub mod support;
pub mod text_index;

pub use config::AppConfig;
pub use error::MinerError;
