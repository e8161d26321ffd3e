//! Ratewarden - Request Admission Control
//!
//! This crate decides, per incoming request, whether to admit it, reject it
//! with a retry hint, or deny it outright. Decisions combine IP access lists,
//! DDoS banning, API keys and fixed-window rate limits that are either kept
//! in process or shared across instances through an atomic store.

pub mod admission;
pub mod apikey;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
