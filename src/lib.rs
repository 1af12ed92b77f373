//! trialguard - free-trial activation with fraud scoring
//!
//! This library provides the trial lifecycle service, the fraud checks that
//! gate activation, and the HTTP and admin surfaces around them.
//! It exposes all modules for testing purposes.

pub mod admin_graphql;
pub mod admin_mutations;
pub mod entities;
pub mod errors;
pub mod fingerprint;
pub mod fraud;
pub mod jobs;
pub mod settings;
pub mod storage;
pub mod trial;
pub mod web;
