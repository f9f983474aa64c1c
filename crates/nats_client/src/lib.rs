//! Shared NATS client.

pub mod client;

pub use client::{game_subject, NatsClient, GAME_SUBJECT_PREFIX};
