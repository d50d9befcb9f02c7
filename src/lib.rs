//! SERP Wayback Archiver library.
//!
//! Submits URLs harvested from search-engine result pages to the Wayback
//! Machine's Save Page Now API, polls each job until it resolves, and keeps
//! append-only tables so restarts neither lose nor repeat finished work.

pub mod backoff;
pub mod candidates;
pub mod canonical;
pub mod config;
pub mod constants;
pub mod scheduler;
pub mod store;
pub mod wayback;
pub mod writer;
