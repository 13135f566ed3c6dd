#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models for the build-environment daemon and its clients.

pub mod api;
pub mod jobspec;
pub mod model;

mod util;

pub use util::{log_stamp, new_session_id};
