//! The Vault: spaced-repetition review sessions for the tutoring service.

pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod gemini;
pub mod models;
pub mod offline;
pub mod srs;
pub mod store;
pub mod tutor;
