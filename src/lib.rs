pub mod aggregate;
pub mod app;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gnps;
pub mod mgf;
pub mod output;
pub mod pipeline;
pub mod runner;
pub mod store;
pub mod taxonomy;
