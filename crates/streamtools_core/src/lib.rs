#![forbid(unsafe_code)]

pub mod audio;
pub mod auth;
pub mod channel_points;
pub mod config;
pub mod filters;
pub mod keystrokes;
pub mod pool;
pub mod pubsub_router;
pub mod sessions;

#[cfg(test)]
mod test_support;

pub use channel_points::ChannelPointSounds;
pub use keystrokes::KeystrokeCommands;
pub use sessions::{AdminSession, TtsSession};
