pub mod bip;
pub mod config;
pub mod decode;
pub mod engine;
pub mod events;
pub mod format;
pub mod output;
pub mod pipeline;
pub mod player;
pub mod reader;
pub mod render;
pub mod resample;
mod session;
pub mod source;
pub mod status;
