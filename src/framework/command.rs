//! Per-framework argv conventions.

use super::{Framework, TestTarget};

/// Program plus arguments, ready for `tokio::process::Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Directory (relative to the checkout) that receives robot reports.
pub const ROBOT_OUTPUT_DIR: &str = "results";

impl Framework {
    /// Build the command that runs exactly `target`.
    pub fn command(&self, target: &TestTarget) -> CommandLine {
        let file = target.file.to_string_lossy().into_owned();
        match self {
            Framework::Pytest => {
                let node = match &target.name {
                    Some(name) => format!("{}::{}", file, name),
                    None => file,
                };
                CommandLine::new("pytest").arg("-v").arg(node)
            }
            Framework::Unittest => {
                let mut cmd = CommandLine::new("python").arg("-m").arg("unittest").arg("-v");
                if let Some(name) = &target.name {
                    cmd = cmd.arg("-k").arg(name.clone());
                }
                cmd.arg(file)
            }
            Framework::Robot => {
                let mut cmd = CommandLine::new("robot").arg("--outputdir").arg(ROBOT_OUTPUT_DIR);
                if let Some(name) = &target.name {
                    cmd = cmd.arg("--test").arg(name.clone());
                }
                cmd.arg(file)
            }
            // Cypress selects by spec file only.
            Framework::Cypress => CommandLine::new("npx")
                .arg("cypress")
                .arg("run")
                .arg("--reporter")
                .arg("json")
                .arg("--spec")
                .arg(file),
            Framework::Playwright => {
                let mut cmd = CommandLine::new("npx")
                    .arg("playwright")
                    .arg("test")
                    .arg("--reporter")
                    .arg("json")
                    .arg(file);
                if let Some(name) = &target.name {
                    cmd = cmd.arg("-g").arg(name.clone());
                }
                cmd
            }
        }
    }
}
