//! Promotion of due staged work onto per-partition streams.
//!
//! This module provides:
//! - The polling task that moves due items from staging to the broker
//! - The per-pass report and error types

mod task;

pub use task::{PromoterConfig, PromoterTask, PromotionError, PromotionReport};
