#![forbid(unsafe_code)]

pub mod http;
pub mod registry;
pub mod state;
pub mod webhook;
pub mod ws;
