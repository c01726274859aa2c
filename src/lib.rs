#![forbid(unsafe_code)]

pub mod assets;
pub mod classify;
pub mod cli;
pub mod config;
pub mod download;
pub mod epub;
pub mod extract;
pub mod formats;
pub mod generate;
pub mod images;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod staging;
