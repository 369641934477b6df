//! Per-language build/run pipelines.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// A program plus its fixed arguments. Caller-supplied arguments are
/// appended after these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StepCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn with_extra(mut self, extra: &[String]) -> Self {
        self.args.extend(extra.iter().cloned());
        self
    }
}

impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Language contract for the build and run steps.
pub trait LanguageHandler: Send + Sync {
    fn language(&self) -> &'static str;

    /// Name the submitted source is written under, inside the workspace.
    fn source_file_name(&self) -> &'static str;

    /// Compile step, if the language has one. Must exit 0 before running.
    fn build_command(&self, _workspace: &Path) -> Option<StepCommand> {
        None
    }

    fn run_command(&self, workspace: &Path) -> StepCommand;

    /// Cheap command that succeeds when the toolchain is installed.
    fn check_command(&self) -> StepCommand;

    /// Every command that must succeed for the language to be usable.
    fn check_commands(&self) -> Vec<StepCommand> {
        vec![self.check_command()]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bash;

impl LanguageHandler for Bash {
    fn language(&self) -> &'static str {
        "bash"
    }

    fn source_file_name(&self) -> &'static str {
        "script.sh"
    }

    fn run_command(&self, workspace: &Path) -> StepCommand {
        StepCommand::new("bash").path_arg(&workspace.join(self.source_file_name()))
    }

    fn check_command(&self) -> StepCommand {
        StepCommand::new("bash").arg("--version")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Python;

fn python_binary() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

impl LanguageHandler for Python {
    fn language(&self) -> &'static str {
        "python"
    }

    fn source_file_name(&self) -> &'static str {
        "script.py"
    }

    fn run_command(&self, workspace: &Path) -> StepCommand {
        StepCommand::new(python_binary()).path_arg(&workspace.join(self.source_file_name()))
    }

    fn check_command(&self) -> StepCommand {
        StepCommand::new(python_binary()).arg("--version")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JavaScript;

impl LanguageHandler for JavaScript {
    fn language(&self) -> &'static str {
        "javascript"
    }

    fn source_file_name(&self) -> &'static str {
        "script.js"
    }

    fn run_command(&self, workspace: &Path) -> StepCommand {
        StepCommand::new("node").path_arg(&workspace.join(self.source_file_name()))
    }

    fn check_command(&self) -> StepCommand {
        StepCommand::new("node").arg("--version")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Java;

impl LanguageHandler for Java {
    fn language(&self) -> &'static str {
        "java"
    }

    fn source_file_name(&self) -> &'static str {
        "Main.java"
    }

    fn build_command(&self, workspace: &Path) -> Option<StepCommand> {
        Some(StepCommand::new("javac").path_arg(&workspace.join(self.source_file_name())))
    }

    fn run_command(&self, workspace: &Path) -> StepCommand {
        StepCommand::new("java")
            .arg("-cp")
            .path_arg(workspace)
            .arg("Main")
    }

    fn check_command(&self) -> StepCommand {
        StepCommand::new("javac").arg("-version")
    }

    /// The compiler alone is not enough; `Main` also needs a runtime.
    fn check_commands(&self) -> Vec<StepCommand> {
        vec![self.check_command(), StepCommand::new("java").arg("-version")]
    }
}

const NATIVE_BINARY: &str = "program";

/// gcc/g++ style compilers producing `program` next to the source.
#[derive(Debug, Clone, Copy)]
pub struct Native {
    language: &'static str,
    compiler: &'static str,
    source: &'static str,
}

impl Native {
    pub const C: Native = Native {
        language: "c",
        compiler: "gcc",
        source: "program.c",
    };

    pub const CPP: Native = Native {
        language: "cpp",
        compiler: "g++",
        source: "program.cpp",
    };
}

impl LanguageHandler for Native {
    fn language(&self) -> &'static str {
        self.language
    }

    fn source_file_name(&self) -> &'static str {
        self.source
    }

    fn build_command(&self, workspace: &Path) -> Option<StepCommand> {
        Some(
            StepCommand::new(self.compiler)
                .path_arg(&workspace.join(self.source))
                .arg("-o")
                .path_arg(&workspace.join(NATIVE_BINARY)),
        )
    }

    fn run_command(&self, workspace: &Path) -> StepCommand {
        StepCommand::new(workspace.join(NATIVE_BINARY).to_string_lossy())
    }

    fn check_command(&self) -> StepCommand {
        StepCommand::new(self.compiler).arg("--version")
    }
}

/// Read-only table: language id -> handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn LanguageHandler>>,
}

impl HandlerRegistry {
    pub fn builtin() -> Self {
        Self::default()
            .with(Bash)
            .with(Python)
            .with(JavaScript)
            .with(Java)
            .with(Native::C)
            .with(Native::CPP)
    }

    /// Registers a handler, replacing any previous one for the same id.
    pub fn with(mut self, handler: impl LanguageHandler + 'static) -> Self {
        debug_assert!(
            !handler.source_file_name().contains(['/', '\\']),
            "source file name must be a bare file name"
        );
        self.handlers.insert(handler.language(), Arc::new(handler));
        self
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn LanguageHandler>> {
        self.handlers.get(language).cloned()
    }

    pub fn languages(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn LanguageHandler>> {
        self.handlers.values()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.languages()).finish()
    }
}
