//! Scrape-job controller runtime
//!
//! This crate coordinates a long-running scrape job with an independent
//! worker-agent over a shared broadcast channel: it probes for the agent,
//! dispatches the job, routes protocol events back to the caller, and falls
//! back to a local simulation when no agent answers.

pub mod actors;
pub mod config;
