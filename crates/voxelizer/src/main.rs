use anyhow::{bail, Context, Result};
use cityprep::batch::{collect_jobs, has_pending, BatchReport, BatchRunner, Job};
use cityprep::obj::{load_mesh, save_mesh, MeshFormat};
use cityprep::scratch::ScratchDir;
use cityprep::tool::{ensure_available, DockerRun, ToolCommand};
use clap::{Parser, ValueEnum};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// `cuda_voxelizer` in Docker.
    CudaVoxelizer,
    /// The `binvox` executable (needs an X display; see `--no-xvfb`).
    Binvox,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Backend::CudaVoxelizer => "cuda-voxelizer",
            Backend::Binvox => "binvox",
        })
    }
}

/// Voxelize closed meshes into `<name>.binvox` grids.
#[derive(Parser, Debug, Clone)]
#[command(name = "voxelizer", version)]
struct Args {
    input_dir: PathBuf,

    output_dir: PathBuf,

    /// Grid cells per side.
    #[arg(long, default_value_t = 32)]
    resolution: u32,

    #[arg(long, value_enum, default_value_t = Backend::CudaVoxelizer)]
    backend: Backend,

    /// Suffix of the input meshes (`.obj.gz` from mesh_closer, or `.obj`).
    #[arg(long, default_value = ".obj.gz")]
    input_suffix: String,

    /// cuda_voxelizer image.
    #[arg(long, env = "CUDA_VOXELIZER_IMAGE", default_value = "cuda_voxelizer")]
    image: String,

    #[arg(long, env = "DOCKER", default_value = "docker")]
    docker: String,

    /// Value for `docker run --gpus` (e.g. `all`); no GPU request when omitted.
    #[arg(long)]
    gpus: Option<String>,

    /// binvox executable.
    #[arg(long, env = "BINVOX_BIN", default_value = "./binvox")]
    binvox: PathBuf,

    /// Run binvox directly instead of under `xvfb-run -a`.
    #[arg(long, default_value_t = false)]
    no_xvfb: bool,

    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Worker threads (0 = one per CPU).
    #[arg(long, default_value_t = 0)]
    jobs: usize,
}

/// `<name>` of `<dir>/<name><suffix>`.
fn mesh_name(input: &Path, suffix: &str) -> Option<String> {
    let file = input.file_name()?.to_str()?;
    let stem = file.get(..file.len().checked_sub(suffix.len())?)?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// `docker run ... cuda_voxelizer -f /inputs/<name>.obj -s <res> -o binvox -thrust`
fn cuda_command(args: &Args, scratch: &Path, obj_name: &str) -> ToolCommand {
    DockerRun::new(&args.image)
        .docker_binary(&args.docker)
        .gpus(args.gpus.clone())
        .volume(scratch, "/inputs")
        .arg("-f")
        .arg(format!("/inputs/{}", obj_name))
        .arg("-s")
        .arg(args.resolution.to_string())
        .args(["-o", "binvox", "-thrust"])
        .into_command()
}

/// `<binvox> -d <res> -t binvox <obj>`, optionally under a virtual X server.
fn binvox_command(args: &Args, obj: &Path) -> ToolCommand {
    let cmd = ToolCommand::new(&args.binvox)
        .arg("-d")
        .arg(args.resolution.to_string())
        .args(["-t", "binvox"])
        .arg(obj);
    if args.no_xvfb {
        cmd
    } else {
        cmd.wrapped_in("xvfb-run", ["-a"])
    }
}

/// Every program the chosen backend launches.
fn required_programs(args: &Args) -> Vec<PathBuf> {
    match args.backend {
        Backend::CudaVoxelizer => vec![PathBuf::from(&args.docker)],
        Backend::Binvox if args.no_xvfb => vec![args.binvox.clone()],
        Backend::Binvox => vec![args.binvox.clone(), PathBuf::from("xvfb-run")],
    }
}

/// Absolute path of an executable given relative to the working directory, so it still
/// resolves when the tool runs elsewhere. Bare names are left to `PATH`.
fn resolve_program(program: &Path) -> PathBuf {
    if program.components().count() > 1 && program.is_relative() {
        program.canonicalize().unwrap_or_else(|_| program.to_path_buf())
    } else {
        program.to_path_buf()
    }
}

fn voxelize(args: &Args, output_dir: &Path, job: &Job) -> Result<()> {
    let name = mesh_name(&job.input, &args.input_suffix)
        .with_context(|| format!("cannot derive a name from {}", job.input.display()))?;

    // Both tools write next to their input, so work on a private copy.
    let scratch = ScratchDir::new_in(output_dir)?;
    let obj_name = format!("{}.obj", name);
    let obj = scratch.join(&obj_name);
    let mesh = load_mesh(&job.input)?;
    save_mesh(&obj, &mesh, MeshFormat::Obj)?;

    let produced = match args.backend {
        Backend::CudaVoxelizer => {
            cuda_command(args, scratch.path(), &obj_name).run_checked()?;
            scratch.join(format!("{}_{}.binvox", obj_name, args.resolution))
        }
        Backend::Binvox => {
            binvox_command(args, &obj).run_checked()?;
            scratch.join(format!("{}.binvox", name))
        }
    };

    if !produced.is_file() {
        bail!("{} did not produce {}", args.backend, produced.display());
    }
    let grid = voxgrid::read_file(&produced)
        .with_context(|| format!("validating {}", produced.display()))?;
    let want = [args.resolution; 3];
    if grid.dims != want {
        bail!("unexpected grid size {:?}, expected {:?}", grid.dims, want);
    }
    debug!(
        "{}: {} of {} voxels occupied",
        name,
        grid.occupied_count(),
        grid.len()
    );

    fs::rename(&produced, &job.output)
        .with_context(|| format!("moving result to {}", job.output.display()))?;
    Ok(())
}

fn run(args: &Args) -> Result<BatchReport> {
    if args.resolution == 0 {
        bail!("--resolution must be positive");
    }
    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;
    // Docker needs absolute bind-mount sources.
    let output_dir = args.output_dir.canonicalize()?;

    let mut args = args.clone();
    args.binvox = resolve_program(&args.binvox);

    let jobs = collect_jobs(&args.input_dir, &args.input_suffix, &output_dir, ".binvox", false)?;
    if has_pending(&jobs, args.overwrite) {
        for program in required_programs(&args) {
            ensure_available(&program)?;
        }
    }

    let report = BatchRunner::new("voxelizer")
        .threads(args.jobs)
        .overwrite(args.overwrite)
        .run(&jobs, |job| voxelize(&args, &output_dir, job))?;
    Ok(report)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let report = run(&args)?;

    if !report.is_success() {
        bail!("{} of {} meshes failed", report.failed.len(), report.total());
    }
    Ok(())
}
