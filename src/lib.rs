pub mod batch;
pub mod calc;
pub mod config;
pub mod convert;
pub mod datastore;
pub mod domain;
pub mod error;
pub mod exec;
pub mod output;
pub mod pipeline;
pub mod prompt;
pub mod pubchem;
pub mod report;
pub mod retry;
