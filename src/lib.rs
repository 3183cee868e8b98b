// -- Lint policy ---------------------------------------------------------
// This is the single source of truth for crate-wide lints.

// Broad lint groups
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
// Documentation
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::bare_urls)]
// No panicking in library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
// No debug/print artifacts
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
// Import hygiene
#![deny(clippy::wildcard_imports)]
// Complexity limits (thresholds in clippy.toml)
#![deny(clippy::cognitive_complexity)]
#![deny(clippy::too_many_lines)]
#![deny(clippy::excessive_nesting)]
// Function signature hygiene
#![deny(clippy::too_many_arguments)]
#![deny(clippy::fn_params_excessive_bools)]
// Clone / pass-by-value hygiene
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::implicit_clone)]
// String hygiene
#![deny(clippy::inefficient_to_string)]
#![deny(clippy::redundant_closure_for_method_calls)]
#![deny(clippy::manual_string_new)]
#![deny(clippy::str_to_string)]
// Cargo lints (warn, not deny since cargo lints can be noisy)
#![warn(clippy::cargo)]
// Unused / redundant code
#![deny(unused_results)]
#![deny(unused_qualifications)]
// Cast hygiene
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]

//! Client-side session and streaming runtime for interactive molecular
//! simulation servers.
//!
//! Molsync opens RPC connections to a simulation server, rebuilds the
//! versioned molecular frame from the partial deltas the server streams,
//! multiplexes keyed interaction streams with at most one live stream per
//! key, and tears all of it down through a cooperative cancellation tree.
//!
//! # Key entry points
//!
//! - [`connection::Connection`] - one channel plus the root cancellation
//!   scope of every stream opened over it
//! - [`session::TrajectorySession`] - frame subscription and playback
//!   commands
//! - [`session::ImdSession`] - keyed interactive-dynamics publishing
//! - [`frame`] - frame merging, change sets and the render-thread reader
//! - [`options::Options`] - runtime configuration with TOML presets
//!
//! # Architecture
//!
//! Every stream runs its call in a future it hands back to the caller,
//! usually spawned as a Tokio task. Streams derive their cancellation scope
//! from their connection, so closing the connection stops every send and
//! receive loop at its next suspension point. Calls cross a
//! [`transport::Transport`] boundary as encoded bytes: the gRPC transport
//! talks to real servers, the loopback transport answers in-process.

pub mod cancellation;
pub mod connection;
pub mod error;
pub mod frame;
pub mod host;
pub mod options;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;
