//! CLI command implementations.
//!
//! | Module    | Commands handled                         |
//! |-----------|------------------------------------------|
//! | `serve`   | `Intake`, `Worker`, `Router`, `All`      |
//! | `submit`  | `Submit`                                 |
//! | `config`  | `Config`                                 |

pub mod config;
pub mod serve;
pub mod submit;

pub use config::cmd_config;
pub use serve::{cmd_all, cmd_intake, cmd_router, cmd_worker};
pub use submit::cmd_submit;
