//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `phase`   | `Status`, `Check`, `Done`, `Gate`, `Approve` |
//! | `project` | `Init`                                    |

pub mod phase;
pub mod project;

pub use phase::{cmd_approve, cmd_check, cmd_done, cmd_gate, cmd_status};
pub use project::cmd_init;
