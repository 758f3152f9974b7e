//! ABOUTME: Encoder process management: spawn, kill, and startup reaping
//! ABOUTME: Owns every OS-level interaction with external encoder binaries

pub mod child;
pub mod command;
pub mod reaper;

pub use child::EncoderChild;
pub use command::{EncoderCommand, TAG_KEY};
pub use reaper::{reap_orphans, OUTPUT_TOKENS};
