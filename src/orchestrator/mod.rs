//! Application-level orchestration.
//!
//! This module owns the session state machine, run lifecycle control (start/stop/quit)
//! and post-run processing such as picking the final audio and refreshing the results
//! listing. UI/CLI layers call into this module to keep responsibilities separated.

mod controller;
mod post_process;
pub(crate) mod results;
pub mod session;

pub(crate) use controller::{run_controller, PanelEvent, UiCommand};
pub(crate) use post_process::process_run_completion;
#[cfg(feature = "tui")]
pub(crate) use post_process::ProcessedRun;
pub use session::SessionController;
#[cfg(feature = "tui")]
pub use session::PollUpdate;
