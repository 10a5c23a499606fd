pub mod client;
pub mod mock;
pub mod poll;

pub use client::{PlatformClient, PlatformConfig};
pub use mock::{MockPlatform, RunScript};
pub use poll::{PollConfig, PollError, PollingClient};
