//! CLI command implementations.
//!
//! | Module    | Commands handled                           |
//! |-----------|--------------------------------------------|
//! | `init`    | `Init`                                     |
//! | `submit`  | `Submit`, `Blast`                          |
//! | `runs`    | `Status`, `Logs`, `Cancel`, `List`, `Delete` |
//! | `doctor`  | `Doctor`                                   |

pub mod doctor;
pub mod init;
pub mod runs;
pub mod submit;

pub use doctor::cmd_doctor;
pub use init::cmd_init;
pub use runs::{cmd_cancel, cmd_delete, cmd_list, cmd_logs, cmd_status};
pub use submit::{cmd_blast, cmd_submit};

use console::StyledObject;
use genepipe_common::RunStatus;

/// Status word coloured for terminal output.
pub fn styled_status(status: RunStatus) -> StyledObject<&'static str> {
    let word = console::style(status.as_str());
    match status {
        RunStatus::Completed => word.green(),
        RunStatus::Failed => word.red().bold(),
        RunStatus::Cancelled => word.yellow(),
        RunStatus::Running => word.cyan(),
        RunStatus::Pending => word.dim(),
    }
}
