//! Common utilities and types shared across meshkv

pub mod config;
pub mod error;
pub mod utils;

pub use config::{BackendKind, Config};
pub use error::{Error, Result};
pub use utils::{
    is_gte_range, key_in_range, parse_duration, prefix_range_end, timestamp_now_millis,
    IdGenerator, GTE_RANGE_END,
};
