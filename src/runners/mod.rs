pub mod shell;

pub use shell::{CommandExecutor, CommandOutput, ShellRunner};
