//! Script sandbox.
//!
//! Scripts run in a separate interpreter process whose reach is limited by
//! permission flags rendered from a declarative [`CapabilitySet`]:
//!
//! 1. Capabilities from the project roots, DNS servers and project config
//!    are merged into one set
//! 2. The set is validated and rendered to `--allow-*` / `--deny-*` flags
//! 3. The interpreter runs the script with a cleared library search path
//! 4. Output goes through a terminal emulator and is bounded before it
//!    reaches the model

pub mod capabilities;
pub mod dns;
pub mod output;
pub mod runner;

pub use capabilities::{CapabilitySet, Grant, SysCategory};
pub use output::{OutputBuffer, RenderLimits};
pub use runner::{ExecutionRequest, ExecutionResult, ProgressSink, ScriptRunner};
