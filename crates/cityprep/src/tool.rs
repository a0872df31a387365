//! Launching the external tools every stage delegates to (Docker images, ManifoldPlus, binvox).

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' not found; install it or point the matching option at it")]
    NotFound { program: String },
    #[error("'{program}' exited with {status} and the following output:\n{output}")]
    Failed {
        program: String,
        status: ExitStatus,
        output: String,
    },
}

/// Captured result of a finished tool.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_owned();
        if !self.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(self.stderr.trim_end());
        }
        out
    }
}

/// One external program invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// The same invocation prefixed by another program, e.g. `xvfb-run -a <self>`.
    pub fn wrapped_in<I, S>(self, wrapper: impl AsRef<OsStr>, wrapper_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut args: Vec<OsString> = wrapper_args
            .into_iter()
            .map(|a| a.as_ref().to_owned())
            .collect();
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: wrapper.as_ref().to_owned(),
            args,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        }
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn run(&self) -> Result<ToolOutput, ToolError> {
        debug!("Running {}", self);
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error carrying the tool's output.
    pub fn run_checked(&self) -> Result<ToolOutput, ToolError> {
        let output = self.run()?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(ToolError::Failed {
                program: self.program.to_string_lossy().into_owned(),
                status: output.status,
                output: output.combined(),
            })
        }
    }

    /// Run with the tool's output passed straight through to this process.
    pub fn run_inherit(&self) -> Result<ExitStatus, ToolError> {
        debug!("Running {}", self);
        self.command()
            .status()
            .map_err(|e| self.spawn_error(e))
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Where `program` would be launched from: the path itself when it names a file, otherwise
/// the first match on `PATH`.
pub fn find_program(program: impl AsRef<OsStr>) -> Option<PathBuf> {
    let program = Path::new(program.as_ref());
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

/// Fail once, up front, when a required tool cannot be launched.
pub fn ensure_available(program: impl AsRef<OsStr>) -> Result<(), ToolError> {
    let program = program.as_ref();
    match find_program(program) {
        Some(found) => {
            debug!("Using {}", found.display());
            Ok(())
        }
        None => Err(ToolError::NotFound {
            program: program.to_string_lossy().into_owned(),
        }),
    }
}

/// Builder for `docker run` invocations of containerized tools.
#[derive(Debug, Clone)]
pub struct DockerRun {
    docker: OsString,
    image: String,
    remove: bool,
    user: Option<String>,
    gpus: Option<String>,
    volumes: Vec<(PathBuf, String)>,
    args: Vec<OsString>,
}

impl DockerRun {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            docker: "docker".into(),
            image: image.into(),
            remove: true,
            user: None,
            gpus: None,
            volumes: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn docker_binary(mut self, docker: impl AsRef<OsStr>) -> Self {
        self.docker = docker.as_ref().to_owned();
        self
    }

    /// `--user uid:gid`, so files written into mounted volumes are not owned by root.
    pub fn user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn gpus(mut self, gpus: Option<String>) -> Self {
        self.gpus = gpus;
        self
    }

    /// Bind-mount `host` (should be absolute) at `container`.
    pub fn volume(mut self, host: impl AsRef<Path>, container: impl Into<String>) -> Self {
        self.volumes
            .push((host.as_ref().to_path_buf(), container.into()));
        self
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn into_command(self) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.docker).arg("run");
        if self.remove {
            cmd = cmd.arg("--rm");
        }
        if let Some(user) = &self.user {
            cmd = cmd.args(["--user", user.as_str()]);
        }
        if let Some(gpus) = &self.gpus {
            cmd = cmd.args(["--gpus", gpus.as_str()]);
        }
        for (host, container) in &self.volumes {
            let mut mount = host.as_os_str().to_owned();
            mount.push(":");
            mount.push(container);
            cmd = cmd.arg("-v").arg(mount);
        }
        cmd.arg(&self.image).args(&self.args)
    }
}
