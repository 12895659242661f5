//! CLI command implementations.
//!
//! | Module   | Commands handled     |
//! |----------|----------------------|
//! | `serve`  | `Serve`              |
//! | `config` | `Config`, `Agents`   |

pub mod config;
pub mod serve;

pub use config::{cmd_agents, cmd_config};
pub use serve::cmd_serve;
