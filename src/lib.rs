//! Phone Leads Dashboard Library
//!
//! Keeps a live, filterable view of the business leads stored in a Firebase
//! Realtime Database and serves it over a small JSON API.
//!
//! # Modules
//!
//! - `api`: HTTP surface.
//! - `core`: Engine, filters, statistics and the dashboard service.
//! - `integrations`: Store client, live feed and backend adapter.
//! - `adapter`: Subscription and point mutations against the store.
//! - `circuit_breaker`: Write circuit breaker and reconnect backoff.
//! - `config`: Configuration management.
//! - `engine`: Aggregation & filter engine.
//! - `errors`: Error handling types.
//! - `event_stream`: Server-sent event decoding.
//! - `filter`: Filter predicates, sorting and facets.
//! - `handlers`: HTTP request handlers.
//! - `models`: Lead records, identity and addressing.
//! - `service`: The dashboard command queue.
//! - `snapshot`: Flattening and normalization of the lead hierarchy.
//! - `stats`: Dashboard statistics.
//! - `store`: Firebase Realtime Database REST client.

pub mod api;
pub mod core;
pub mod integrations;

pub mod adapter;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod errors;
pub mod event_stream;
pub mod filter;
pub mod handlers;
pub mod models;
pub mod service;
pub mod snapshot;
pub mod stats;
pub mod store;
