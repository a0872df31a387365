use anyhow::{bail, Context, Result};
use clap::Parser;
use cityprep::batch::{collect_jobs, has_pending, BatchRunner, Job};
use cityprep::tool::{ensure_available, DockerRun, ToolCommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Convert CityGML to CityJSON with citygml-tools running in Docker.
///
/// The output is written next to the input (`x.gml` -> `x.json`).
#[derive(Parser, Debug, Clone)]
#[command(name = "gml2cityjson", version)]
struct Args {
    /// A `.gml` file, or a directory searched recursively for `.gml` files.
    path: PathBuf,

    /// citygml-tools image.
    #[arg(long, env = "CITYGML_TOOLS_IMAGE", default_value = "citygml4j/citygml-tools")]
    image: String,

    /// Docker-compatible client binary.
    #[arg(long, env = "DOCKER", default_value = "docker")]
    docker: String,

    /// Directory mode: convert even when the `.json` already exists.
    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Directory mode: parallel conversions (0 = one per CPU).
    #[arg(long, default_value_t = 0)]
    jobs: usize,

    /// Extra `to-cityjson` options, passed after `--`.
    #[arg(last = true)]
    tool_args: Vec<String>,
}

#[derive(Debug, Error)]
enum InputError {
    #[error("{0}: no such file or directory")]
    Missing(PathBuf),
    #[error("{0}: has no parent directory or usable file name")]
    NoBasename(PathBuf),
    #[error("{0}: neither a regular file nor a directory")]
    Unsupported(PathBuf),
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    File { dir: PathBuf, basename: String },
    Dir(PathBuf),
}

/// Resolve `path` to an absolute file (split into its directory and basename) or directory.
fn resolve_input(path: &Path) -> Result<Input, InputError> {
    let abs = path
        .canonicalize()
        .map_err(|_| InputError::Missing(path.to_path_buf()))?;

    if abs.is_dir() {
        return Ok(Input::Dir(abs));
    }
    if !abs.is_file() {
        return Err(InputError::Unsupported(abs));
    }

    let dir = abs.parent().map(Path::to_path_buf);
    let basename = abs.file_name().and_then(|n| n.to_str()).map(str::to_owned);
    match (dir, basename) {
        (Some(dir), Some(basename)) => Ok(Input::File { dir, basename }),
        _ => Err(InputError::NoBasename(abs)),
    }
}

/// `uid:gid` of the caller, so the container does not leave root-owned files behind.
fn current_user() -> Option<String> {
    #[cfg(unix)]
    {
        Some(format!("{}:{}", nix::unistd::getuid(), nix::unistd::getgid()))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn convert_command(args: &Args, dir: &Path, basename: &str) -> ToolCommand {
    DockerRun::new(&args.image)
        .docker_binary(&args.docker)
        .user(current_user())
        .volume(dir, "/data")
        .arg("to-cityjson")
        .args(&args.tool_args)
        .arg(format!("/data/{}", basename))
        .into_command()
}

fn convert_dir(args: &Args, dir: &Path) -> Result<i32> {
    let jobs: Vec<Job> = collect_jobs(dir, ".gml", dir, ".json", true)?
        .into_iter()
        .map(|job| Job {
            output: job.input.with_extension("json"),
            input: job.input,
        })
        .collect();

    if jobs.is_empty() {
        warn!("No .gml files under {}", dir.display());
        return Ok(0);
    }
    if has_pending(&jobs, args.overwrite) {
        ensure_available(&args.docker)?;
    }

    let report = BatchRunner::new("gml2cityjson")
        .threads(args.jobs)
        .overwrite(args.overwrite)
        .run(&jobs, |job| -> Result<()> {
            let parent = job.input.parent().context("input has no parent directory")?;
            let name = job
                .input
                .file_name()
                .and_then(|n| n.to_str())
                .context("input file name is not UTF-8")?;

            convert_command(args, parent, name).run_checked()?;
            if !job.output.is_file() {
                bail!("citygml-tools succeeded but {} was not written", job.output.display());
            }
            Ok(())
        })?;

    Ok(if report.is_success() { 0 } else { 1 })
}

/// Returns the process exit code.
fn run(args: &Args) -> Result<i32> {
    match resolve_input(&args.path)? {
        Input::File { dir, basename } => {
            ensure_available(&args.docker)?;
            let cmd = convert_command(args, &dir, &basename);
            info!("{}", cmd);
            let status = cmd.run_inherit()?;
            Ok(status.code().unwrap_or(1))
        }
        Input::Dir(dir) => convert_dir(args, &dir),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let code = run(&args)?;
    std::process::exit(code)
}
