#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod decode;
pub mod dispatch;
pub mod error;
pub mod supervisor;
pub mod types;
pub mod ws;

pub use crate::error::Error;
pub use crate::supervisor::{Failure, Monitor, MonitorHandle, SupervisorState};

pub type Result<T> = std::result::Result<T, Error>;

/// Public announcement stream.
pub const DEFAULT_ENDPOINT: &str = "wss://api.binance.com/sapi/wss";
