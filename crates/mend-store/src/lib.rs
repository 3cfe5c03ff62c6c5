//! Durable record store: feedback, tasks, token usage, and breaker events.
//!
//! A facade over a single in-memory document, optionally persisted as one
//! JSON file rewritten atomically. Lists are bounded; aggregates are
//! computed on read over the filtered slice.

mod db;
mod store;

pub use db::{Document, Retention};
pub use store::{
    BreakerEventQuery, FeedbackQuery, Page, Store, StoreError, TaskQuery, UsageQuery, UsageStats,
};
