//! Command-line handlers for `pouv-node`

pub mod commands;

pub use commands::{
    cmd_balance, cmd_init, cmd_keygen, cmd_mine, cmd_status, cmd_verify, format_amount,
    is_initialized, AppState, CliResult, ConfigOverrides,
};
