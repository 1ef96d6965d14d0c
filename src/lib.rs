//! Sheet News - a news site backed by a spreadsheet
//!
//! This crate pulls items from RSS/Atom feeds into the spreadsheet, and serves the
//! published posts from it through a cached JSON read API.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod news;
pub mod posts;
pub mod routes;
pub mod sheets;
