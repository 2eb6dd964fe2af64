#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_precision_loss
)]

//! Luna voice onboarding core.
//!
//! A relay between voice clients and a streaming speech model, the
//! conversation orchestrator that steers the interview across topics and
//! sessions, and the client-side session lifecycle.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod scenarios;
pub mod session;
pub mod store;
pub mod voice;

pub use config::Config;
pub use error::VoiceError;
