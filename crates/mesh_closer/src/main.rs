use anyhow::{bail, Context, Result};
use cityprep::batch::{collect_jobs, has_pending, partial_path, BatchReport, BatchRunner, Job};
use cityprep::normalize::{normalize_mesh, NormalizeParams};
use cityprep::obj::{load_mesh, save_obj_gz};
use cityprep::scratch::ScratchDir;
use cityprep::tool::{ensure_available, ToolCommand};
use cityprep::Axis;
use clap::{Parser, ValueEnum};
use log::{debug, info};
use std::fs;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum UpAxis {
    X,
    Y,
    Z,
}

impl std::fmt::Display for UpAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UpAxis::X => "x",
            UpAxis::Y => "y",
            UpAxis::Z => "z",
        })
    }
}

impl From<UpAxis> for Axis {
    fn from(a: UpAxis) -> Self {
        match a {
            UpAxis::X => Axis::X,
            UpAxis::Y => Axis::Y,
            UpAxis::Z => Axis::Z,
        }
    }
}

/// Make every `*.obj` watertight with ManifoldPlus, normalize it and write `<name>.obj.gz`.
#[derive(Parser, Debug, Clone)]
#[command(name = "mesh_closer", version)]
struct Args {
    input_dir: PathBuf,

    output_dir: PathBuf,

    /// ManifoldPlus executable.
    #[arg(long, env = "MANIFOLD_BIN", default_value = "./bin/manifold")]
    manifold: PathBuf,

    /// Grid cells along the largest extent when simplifying.
    #[arg(long, default_value_t = 128)]
    n_simplification_voxels: u32,

    /// Upward slices tried when searching for a ground plane.
    #[arg(long, default_value_t = 10)]
    n_ground_plane_scan_steps: u32,

    /// Fraction of the mesh height the ground-plane scan may cover.
    #[arg(long, default_value_t = 0.15)]
    max_scan_height_fraction: f64,

    /// A crop shrinking the bounding volume below this ratio removed a ground plane.
    #[arg(long, default_value_t = 0.8)]
    volume_reduction_threshold: f64,

    /// Vertical axis of the input meshes.
    #[arg(long, value_enum, default_value_t = UpAxis::Y)]
    up_axis: UpAxis,

    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Worker threads (0 = one per CPU).
    #[arg(long, default_value_t = 0)]
    jobs: usize,
}

impl Args {
    fn normalize_params(&self) -> NormalizeParams {
        NormalizeParams {
            n_simplification_voxels: self.n_simplification_voxels,
            n_ground_plane_scan_steps: self.n_ground_plane_scan_steps,
            max_scan_height_fraction: self.max_scan_height_fraction,
            volume_reduction_threshold: self.volume_reduction_threshold,
            up_axis: self.up_axis.into(),
        }
    }
}

fn close_mesh(args: &Args, params: &NormalizeParams, job: &Job) -> Result<()> {
    let scratch = ScratchDir::new_in(&args.output_dir)?;
    let closed = scratch.join("closed.obj");

    ToolCommand::new(&args.manifold)
        .arg("--input")
        .arg(&job.input)
        .arg("--output")
        .arg(&closed)
        .run_checked()
        .with_context(|| format!("closing {}", job.input.display()))?;

    let mesh = load_mesh(&closed)?;
    let before = mesh.triangles.len();
    let normalized = normalize_mesh(&mesh, params);
    if normalized.is_empty() {
        bail!("normalization left no triangles");
    }
    debug!(
        "{}: {} -> {} triangles",
        job.input.display(),
        before,
        normalized.triangles.len()
    );

    let tmp = partial_path(&job.output);
    save_obj_gz(&tmp, &normalized)?;
    fs::rename(&tmp, &job.output).with_context(|| format!("renaming {}", tmp.display()))?;
    Ok(())
}

fn run(args: &Args) -> Result<BatchReport> {
    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let jobs = collect_jobs(&args.input_dir, ".obj", &args.output_dir, ".obj.gz", false)?;
    let params = args.normalize_params();
    if has_pending(&jobs, args.overwrite) {
        ensure_available(&args.manifold)?;
    }

    let report = BatchRunner::new("mesh_closer")
        .threads(args.jobs)
        .overwrite(args.overwrite)
        .run(&jobs, |job| close_mesh(args, &params, job))?;
    Ok(report)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    info!("Normalizing with {:?}", args.normalize_params());
    let report = run(&args)?;

    if !report.is_success() {
        bail!("{} of {} meshes failed", report.failed.len(), report.total());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cityprep::cityjson::append_mesh;
    use cityprep::obj::{save_mesh, MeshFormat};
    use cityprep::TriMesh;
    use glam::DVec3;
    use std::path::Path;

    fn cuboid(min: DVec3, max: DVec3) -> TriMesh {
        let vertices = (0..8)
            .map(|i| {
                DVec3::new(
                    if i & 1 == 0 { min.x } else { max.x },
                    if i & 2 == 0 { min.y } else { max.y },
                    if i & 4 == 0 { min.z } else { max.z },
                )
            })
            .collect();
        let triangles = vec![
            [0, 2, 3], [0, 3, 1],
            [4, 5, 7], [4, 7, 6],
            [0, 1, 5], [0, 5, 4],
            [2, 6, 7], [2, 7, 3],
            [0, 4, 6], [0, 6, 2],
            [1, 3, 7], [1, 7, 5],
        ];
        TriMesh::new(vertices, triangles)
    }

    /// Ten stacked 10x1x10 boxes on a 40x0.2x40 plate, y up.
    fn tower_on_plate() -> TriMesh {
        let mut mesh = cuboid(DVec3::new(-20.0, 0.0, -20.0), DVec3::new(20.0, 0.2, 20.0));
        for k in 0..10 {
            let y = 0.2 + k as f64;
            append_mesh(
                &mut mesh,
                &cuboid(DVec3::new(-5.0, y, -5.0), DVec3::new(5.0, y + 1.0, 5.0)),
            );
        }
        mesh
    }

    /// Stand-in for ManifoldPlus: copies its input, fails on names containing "broken".
    #[cfg(unix)]
    fn fake_manifold(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("manifold");
        fs::write(
            &script,
            r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --input) in="$2"; shift 2 ;;
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$in" in
  *broken*) echo "input is not a valid mesh" >&2; exit 2 ;;
esac
cp "$in" "$out"
"#,
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn closes_normalizes_and_reports_failures() {
        let dir = std::env::temp_dir().join(format!("mesh_closer-{}", uuid::Uuid::new_v4()));
        let input = dir.join("objs");
        let output = dir.join("closed");
        fs::create_dir_all(&input).unwrap();

        save_mesh(&input.join("house.obj"), &tower_on_plate(), MeshFormat::Obj).unwrap();
        fs::write(input.join("broken.obj"), "v 0 0 0\n").unwrap();
        fs::write(input.join("notes.txt"), "not a mesh").unwrap();

        let manifold = fake_manifold(&dir);
        let args = Args::parse_from([
            "mesh_closer",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "--manifold",
            manifold.to_str().unwrap(),
            "--n-simplification-voxels",
            "64",
        ]);

        let report = run(&args).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("broken.obj"));
        assert!(report.failed[0].1.contains("input is not a valid mesh"));

        let closed = load_mesh(&output.join("house.obj.gz")).unwrap();
        let bb = closed.aabb().unwrap();
        assert!((bb.extent().x - 10.0).abs() < 1e-6);
        assert!(bb.min.y >= 0.2 - 1e-6);
        assert!(!output.join("broken.obj.gz").exists());

        // Only the outputs remain: no scratch dirs, no partial files.
        let names: Vec<String> = fs::read_dir(&output)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["house.obj.gz".to_string()]);

        let again = run(&args).unwrap();
        assert_eq!(again.skipped, 1);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_manifold_fails_once_up_front() {
        let dir = std::env::temp_dir().join(format!("mesh_closer-{}", uuid::Uuid::new_v4()));
        let input = dir.join("objs");
        fs::create_dir_all(&input).unwrap();
        for name in ["a.obj", "b.obj"] {
            fs::write(input.join(name), "v 0 0 0\n").unwrap();
        }
        let output = dir.join("closed");
        let args = Args::parse_from([
            "mesh_closer",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "--manifold",
            dir.join("no-such-manifold").to_str().unwrap(),
        ]);

        let err = run(&args).unwrap_err();
        assert!(err.to_string().contains("no-such-manifold"), "{err:#}");

        // Nothing left to do: the tool is not needed.
        fs::create_dir_all(&output).unwrap();
        for name in ["a.obj.gz", "b.obj.gz"] {
            fs::write(output.join(name), b"").unwrap();
        }
        assert_eq!(run(&args).unwrap().skipped, 2);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn defaults_match_normalize_params() {
        let args = Args::parse_from(["mesh_closer", "in", "out"]);
        let p = args.normalize_params();
        let d = NormalizeParams::default();
        assert_eq!(p.n_simplification_voxels, d.n_simplification_voxels);
        assert_eq!(p.n_ground_plane_scan_steps, d.n_ground_plane_scan_steps);
        assert_eq!(p.max_scan_height_fraction, d.max_scan_height_fraction);
        assert_eq!(p.volume_reduction_threshold, d.volume_reduction_threshold);
        assert_eq!(p.up_axis, d.up_axis);
        assert_eq!(args.manifold, PathBuf::from("./bin/manifold"));
    }
}
