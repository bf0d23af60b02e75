mod spinner;
mod status;
mod table;

pub use spinner::{progress_bar, with_spinner};

pub use status::{print_command_status, CommandStatus};

pub use table::{count_cell, millis_cell, styled_table};
