//! Display channel of a remote-desktop client.
//!
//! The channel consumes parsed server messages, composites them into local
//! surfaces through the canvas collaborator, schedules video frames against
//! the session media clock, and queues invalidation events for the host UI.
//! An optional accelerated pipeline decodes externally encoded frames on a
//! dedicated thread.

pub mod cache;
pub mod channel;
pub mod config;
pub mod events;
pub mod session;
pub mod stream_render;
pub mod surface;
pub mod timer;

mod draw;
mod report;
mod stream;

pub use channel::{ChannelConfig, DisplayChannel, DISABLE_ADAPTIVE_STREAMING_ENV};
pub use events::DisplayEvent;
pub use session::{MessagePump, PumpStatus, Session, UiWaker};
pub use stream::StreamStats;
pub use stream_render::AuxPipelineOptions;
pub use surface::PrimaryInfo;
pub use timer::{TimerId, TimerToken};
