use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::BidsError;
use crate::logger::SharedLog;

/// One external invocation: program, argument vector and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Standard output followed by standard error.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    fn code_text(&self) -> String {
        self.code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "terminated by signal".to_string())
    }
}

pub trait CommandRunner: Send + Sync {
    /// Runs `command` inside `cwd` and waits for it to exit.
    fn run(&self, command: &ToolCommand, cwd: &Path) -> Result<CommandOutput, BidsError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &ToolCommand, cwd: &Path) -> Result<CommandOutput, BidsError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args).current_dir(cwd);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        let output = cmd.output().map_err(|err| BidsError::Spawn {
            program: command.program.clone(),
            message: err.to_string(),
        })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded(CommandOutput),
    Failed { code: Option<i32>, output: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded(_))
    }
}

/// Runs one command and writes a record describing the result.
///
/// A non-zero exit or a spawn failure comes back as [`CommandOutcome::Failed`];
/// nothing is retried.
pub fn run_logged(
    runner: &dyn CommandRunner,
    command: &ToolCommand,
    cwd: &Path,
    log: &SharedLog,
) -> CommandOutcome {
    match runner.run(command, cwd) {
        Ok(output) if output.success() => {
            let mut record = format!("Command:\n{command}\nReturn Code:\n0\n");
            let text = output.combined();
            if !text.trim().is_empty() {
                record.push_str(&format!("Output:\n{text}\n"));
            }
            log.info(record);
            CommandOutcome::Succeeded(output)
        }
        Ok(output) => {
            let mut record = format!(
                "Error running {}.\nCommand:\n{command}\nReturn Code:\n{}\n",
                command.program,
                output.code_text()
            );
            let text = output.combined();
            if !text.trim().is_empty() {
                record.push_str(&format!("Output:\n{text}\n"));
            }
            log.error(record);
            CommandOutcome::Failed {
                code: output.code,
                output: text,
            }
        }
        Err(err) => {
            log.error(format!(
                "Error running {}.\nCommand:\n{command}\n{err}\n",
                command.program
            ));
            CommandOutcome::Failed {
                code: None,
                output: err.to_string(),
            }
        }
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryWriter;

    struct Fixed(CommandOutput);

    impl CommandRunner for Fixed {
        fn run(&self, _command: &ToolCommand, _cwd: &Path) -> Result<CommandOutput, BidsError> {
            Ok(self.0.clone())
        }
    }

    struct Missing;

    impl CommandRunner for Missing {
        fn run(&self, command: &ToolCommand, _cwd: &Path) -> Result<CommandOutput, BidsError> {
            Err(BidsError::Spawn {
                program: command.program.clone(),
                message: "No such file or directory".to_string(),
            })
        }
    }

    #[test]
    fn display_joins_arguments() {
        let cmd = ToolCommand::new("3dTstat").arg("-mean").arg("in.nii.gz");
        assert_eq!(cmd.to_string(), "3dTstat -mean in.nii.gz");
    }

    #[test]
    fn success_is_logged_at_info() {
        let writer = MemoryWriter::new();
        let log = SharedLog::from_writer(Box::new(writer.clone()));
        let runner = Fixed(CommandOutput {
            code: Some(0),
            stdout: "done".to_string(),
            stderr: String::new(),
        });

        let outcome = run_logged(&runner, &ToolCommand::new("3dDespike"), Path::new("."), &log);

        assert!(outcome.is_success());
        let text = writer.contents();
        assert!(text.contains(" - INFO \n"));
        assert!(text.contains("Output:\ndone"));
    }

    #[test]
    fn non_zero_exit_is_logged_at_error() {
        let writer = MemoryWriter::new();
        let log = SharedLog::from_writer(Box::new(writer.clone()));
        let runner = Fixed(CommandOutput {
            code: Some(3),
            stdout: String::new(),
            stderr: "** FATAL ERROR".to_string(),
        });

        let outcome = run_logged(&runner, &ToolCommand::new("3dvolreg"), Path::new("."), &log);

        assert_eq!(
            outcome,
            CommandOutcome::Failed {
                code: Some(3),
                output: "** FATAL ERROR".to_string()
            }
        );
        let text = writer.contents();
        assert!(text.contains(" - ERROR \nError running 3dvolreg."));
        assert!(text.contains("Return Code:\n3"));
    }

    #[test]
    fn spawn_failure_is_a_failed_outcome() {
        let log = SharedLog::from_writer(Box::new(MemoryWriter::new()));
        let outcome = run_logged(&Missing, &ToolCommand::new("dcm2niix"), Path::new("."), &log);
        assert!(!outcome.is_success());
    }

    #[test]
    fn combined_output_keeps_both_streams() {
        let output = CommandOutput {
            code: Some(0),
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
        };
        assert_eq!(output.combined(), "out\nerr\n");
    }
}
