//! mapflow - cron-triggered DAG workflow scheduler

pub mod cli;
pub mod config;
pub mod daemon;
pub mod dag;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod persistence;
pub mod queue;
pub mod runners;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod worker;
