mod sample;

use anyhow::{bail, Context, Result};
use cityprep::batch::{collect_jobs, partial_path, BatchReport, BatchRunner, Job};
use cityprep::obj::load_mesh;
use clap::{Parser, ValueEnum};
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;

use crate::sample::{mesh_occupancy, name_hash, sample_points, voxel_occupancy, SampleCube};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Method {
    /// Map each point onto a binvox grid (fast, voxel resolution).
    VoxelgridLookup,
    /// Ray-parity test against the closed mesh (exact, slower).
    MeshContains,
}

impl Method {
    fn default_suffix(self) -> &'static str {
        match self {
            Method::VoxelgridLookup => ".binvox",
            Method::MeshContains => ".obj.gz",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::VoxelgridLookup => "voxelgrid-lookup",
            Method::MeshContains => "mesh-contains",
        })
    }
}

/// Sample labelled occupancy points for every shape and store them as `<name>.npz`.
#[derive(Parser, Debug, Clone)]
#[command(name = "occupancy_sampler", version)]
struct Args {
    /// Directory of `.binvox` grids, or of meshes with `--method mesh-contains`.
    input_dir: PathBuf,

    output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Method::VoxelgridLookup)]
    method: Method,

    /// Points per shape.
    #[arg(long, default_value_t = 100_000)]
    n_points: usize,

    /// Extra margin around the shape, as a fraction of its largest extent.
    #[arg(long, default_value_t = 0.1)]
    padding: f64,

    /// Makes sampling reproducible; each file still gets its own stream.
    #[arg(long, env = "OCCUPANCY_SEED")]
    seed: Option<u64>,

    /// Input suffix; defaults to `.binvox` or `.obj.gz` depending on `--method`.
    #[arg(long)]
    input_suffix: Option<String>,

    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Worker threads (0 = one per CPU).
    #[arg(long, default_value_t = 0)]
    jobs: usize,
}

impl Args {
    fn suffix(&self) -> &str {
        self.input_suffix
            .as_deref()
            .unwrap_or_else(|| self.method.default_suffix())
    }

    fn rng_for(&self, job: &Job) -> StdRng {
        match self.seed {
            Some(seed) => {
                let name = job.input.file_name().unwrap_or_default().to_string_lossy();
                StdRng::seed_from_u64(seed ^ name_hash(&name))
            }
            None => StdRng::from_entropy(),
        }
    }
}

fn sample_file(args: &Args, job: &Job) -> Result<()> {
    let mut rng = args.rng_for(job);

    let (cube, points, occupancies) = match args.method {
        Method::VoxelgridLookup => {
            let grid = voxgrid::read_file(&job.input)
                .with_context(|| format!("reading {}", job.input.display()))?;
            let cube = SampleCube::of_grid(&grid, args.padding);
            let points = sample_points(&mut rng, &cube, args.n_points);
            let occ = voxel_occupancy(&grid, &cube, &points);
            (cube, points, occ)
        }
        Method::MeshContains => {
            let mesh = load_mesh(&job.input)?;
            let bbox = mesh.aabb().context("mesh has no vertices")?;
            let cube = SampleCube::around(bbox.min, bbox.max, args.padding);
            let points = sample_points(&mut rng, &cube, args.n_points);
            let occ = mesh_occupancy(&mesh, &cube, &points);
            (cube, points, occ)
        }
    };

    if !(cube.side > 0.0) {
        bail!("shape has no extent");
    }
    debug!(
        "{}: {} of {} points inside",
        job.input.display(),
        occupancies.iter().filter(|&&o| o).count(),
        occupancies.len()
    );

    let packed = voxgrid::packbits(&occupancies);
    let loc = cube.center.to_array();
    let tmp = partial_path(&job.output);
    voxgrid::npz::write_occupancy_npz(&tmp, &points, &packed, loc, cube.side as f32)
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, &job.output).with_context(|| format!("renaming {}", tmp.display()))?;
    Ok(())
}

fn run(args: &Args) -> Result<BatchReport> {
    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let jobs = collect_jobs(&args.input_dir, args.suffix(), &args.output_dir, ".npz", false)?;

    let report = BatchRunner::new("occupancy_sampler")
        .threads(args.jobs)
        .overwrite(args.overwrite)
        .run(&jobs, |job| sample_file(args, job))?;
    Ok(report)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let report = run(&args)?;

    if !report.is_success() {
        bail!("{} of {} shapes failed", report.failed.len(), report.total());
    }
    Ok(())
}
