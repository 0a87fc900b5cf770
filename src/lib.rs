pub mod app;
pub mod archive;
pub mod bundle;
pub mod config;
pub mod domain;
pub mod error;
pub mod fasta;
pub mod feed;
pub mod http;
pub mod merge;
pub mod orchestrator;
pub mod output;
pub mod storage;
pub mod store;
pub mod template;
pub mod tsv;
