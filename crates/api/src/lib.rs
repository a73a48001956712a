//! HTTP API: pipeline status/control surface and search.

pub mod app;
