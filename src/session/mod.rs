//! Client sessions composed from a [`Connection`](crate::connection::Connection)
//! and its streams.
//!
//! - [`TrajectorySession`] subscribes to frame deltas, keeps the merged
//!   frame and issues playback commands.
//! - [`ImdSession`] publishes keyed interactions, coalescing updates between
//!   periodic flushes.
//! - [`CommandClient`] runs one-shot commands.

mod command;
mod imd;
mod interaction;
mod trajectory;

pub use command::CommandClient;
pub use imd::ImdSession;
pub use interaction::{Interaction, InteractionKind};
pub use trajectory::{FrameUpdate, TrajectorySession};
