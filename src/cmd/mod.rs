//! CLI command implementations.
//!
//! | Module   | Commands handled               |
//! |----------|--------------------------------|
//! | `run`    | `Create`, `Resume`, `Amend`    |
//! | `events` | `Events`                       |

pub mod events;
pub mod run;

pub use events::cmd_events;
pub use run::{cmd_amend, cmd_create, cmd_resume};
