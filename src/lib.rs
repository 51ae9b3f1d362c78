#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod error;
pub mod monitor;
pub mod realtime;
pub mod retry;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::monitor::ConnectionState;
pub use crate::realtime::{Client, Config, SubscribeRequest, Subscription};
