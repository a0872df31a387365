mod extract;

use anyhow::{bail, Context, Result};
use cityprep::batch::partial_path;
use cityprep::cityjson::CityJson;
use cityprep::obj::{save_mesh, MeshFormat};
use clap::{Parser, ValueEnum};
use hashbrown::HashSet;
use log::{info, warn};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};
use walkdir::WalkDir;

use crate::extract::{object_mesh, select_objects};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Obj,
    /// ASCII PLY.
    Ply,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutputFormat::Obj => "obj",
            OutputFormat::Ply => "ply",
        })
    }
}

impl From<OutputFormat> for MeshFormat {
    fn from(f: OutputFormat) -> Self {
        match f {
            OutputFormat::Obj => MeshFormat::Obj,
            OutputFormat::Ply => MeshFormat::Ply,
        }
    }
}

/// Write one mesh per building of a CityJSON document.
#[derive(Parser, Debug, Clone)]
#[command(name = "cityjson2obj", version)]
struct Args {
    /// A CityJSON file, or a directory searched recursively for `*.json`.
    input: PathBuf,

    output_dir: PathBuf,

    /// CityObject types to extract.
    #[arg(long, value_delimiter = ',', default_value = "Building,BuildingPart")]
    types: Vec<String>,

    /// Exact LoD to extract (e.g. 2 or 2.2); highest available when omitted.
    #[arg(long)]
    lod: Option<f64>,

    /// Fold BuildingPart children into their parent building's mesh.
    #[arg(long, default_value_t = false)]
    merge_parts: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Obj)]
    format: OutputFormat,

    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Worker threads (0 = one per CPU).
    #[arg(long, default_value_t = 0)]
    jobs: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    written: usize,
    skipped: usize,
    empty: usize,
    failed: usize,
}

impl Counts {
    fn add(&mut self, other: Counts) {
        self.written += other.written;
        self.skipped += other.skipped;
        self.empty += other.empty;
        self.failed += other.failed;
    }
}

fn input_documents(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("{}: no such file or directory", input.display());
    }

    let mut docs: Vec<PathBuf> = WalkDir::new(input)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .map_or(false, |x| x.eq_ignore_ascii_case("json"))
        })
        .map(|e| e.into_path())
        .collect();
    docs.sort();
    Ok(docs)
}

/// Write to `<out>.partial` and rename, so an interrupted run leaves no truncated mesh.
fn write_mesh(out: &Path, mesh: &cityprep::TriMesh, format: MeshFormat) -> Result<()> {
    let tmp = partial_path(out);
    save_mesh(&tmp, mesh, format)?;
    fs::rename(&tmp, out).with_context(|| format!("renaming {}", tmp.display()))
}

fn extract_document(path: &Path, args: &Args, used: &mut HashSet<String>) -> Result<Counts> {
    let started = Instant::now();
    let doc = CityJson::load(path).with_context(|| format!("loading {}", path.display()))?;
    let vertices = doc.decoded_vertices();
    let selection = select_objects(&doc, &args.types, args.merge_parts, used);
    let format: MeshFormat = args.format.into();

    info!(
        "{}: {} objects, {} selected",
        path.display(),
        doc.city_objects.len(),
        selection.len()
    );

    let counts = selection
        .par_iter()
        .map(|sel| {
            let mut c = Counts::default();
            let out = args
                .output_dir
                .join(format!("{}.{}", sel.file_stem, format.extension()));

            if out.exists() && !args.overwrite {
                c.skipped = 1;
                return c;
            }

            let result = object_mesh(&doc, &vertices, sel.id, args.lod, args.merge_parts)
                .map_err(anyhow::Error::from)
                .and_then(|mesh| {
                    if mesh.is_empty() {
                        return Ok(false);
                    }
                    write_mesh(&out, &mesh, format)?;
                    Ok(true)
                });

            match result {
                Ok(true) => c.written = 1,
                Ok(false) => {
                    warn!("{}: no surface geometry, skipping", sel.id);
                    c.empty = 1;
                }
                Err(e) => {
                    warn!("Error processing {}: {:#}", sel.id, e);
                    c.failed = 1;
                }
            }
            c
        })
        .reduce(Counts::default, |mut a, b| {
            a.add(b);
            a
        });

    info!(
        "{}: {} written, {} skipped, {} without geometry, {} failed in {:.1?}",
        path.display(),
        counts.written,
        counts.skipped,
        counts.empty,
        counts.failed,
        started.elapsed()
    );
    Ok(counts)
}

fn run(args: &Args) -> Result<Counts> {
    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;
    let docs = input_documents(&args.input)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.jobs)
        .build()?;

    let mut total = Counts::default();
    let mut used = HashSet::new();
    for doc in &docs {
        match pool.install(|| extract_document(doc, args, &mut used)) {
            Ok(c) => total.add(c),
            Err(e) => {
                warn!("{:#}", e);
                total.failed += 1;
            }
        }
    }
    Ok(total)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let total = run(&args)?;

    if total.failed > 0 {
        bail!("{} object(s) or document(s) failed", total.failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::DOC;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cityjson2obj-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn args(input: &Path, out: &Path, extra: &[&str]) -> Args {
        let mut argv = vec![
            "cityjson2obj".to_string(),
            input.display().to_string(),
            out.display().to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        Args::parse_from(argv)
    }

    #[test]
    fn writes_one_mesh_per_building() {
        let dir = temp_dir();
        let input = dir.join("tile.json");
        fs::write(&input, DOC).unwrap();
        let out = dir.join("meshes");

        let counts = run(&args(&input, &out, &[])).unwrap();
        assert_eq!(counts, Counts { written: 2, skipped: 0, empty: 1, failed: 0 });

        let mesh = cityprep::obj::load_mesh(&out.join("DEBE_0001.obj")).unwrap();
        assert_eq!(mesh.triangles.len(), 12);
        assert!(out.join("DEBE_0001_part.obj").is_file());
        assert!(!out.join("DEBE_0001_part_1.obj").exists());
        assert!(!out.join("DEBE_0001.obj.partial").exists());

        let again = run(&args(&input, &out, &[])).unwrap();
        assert_eq!(again.skipped, 2);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn merged_ply_output_from_directory() {
        let dir = temp_dir();
        fs::create_dir_all(dir.join("in/nested")).unwrap();
        fs::write(dir.join("in/nested/tile.JSON"), DOC).unwrap();
        fs::write(dir.join("in/notes.txt"), "ignored").unwrap();
        let out = dir.join("meshes");

        let counts = run(&args(
            &dir.join("in"),
            &out,
            &["--merge-parts", "--format", "ply", "--types", "Building,BuildingPart"],
        ))
        .unwrap();
        assert_eq!(counts.written, 1);
        assert!(out.join("DEBE_0001.ply").is_file());
        assert!(!out.join("DEBE_0001_part.ply").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    fn single_building(id: &str) -> String {
        format!(
            r#"{{
              "type": "CityJSON",
              "version": "2.0",
              "CityObjects": {{
                "{id}": {{
                  "type": "Building",
                  "geometry": [{{ "type": "MultiSurface", "lod": "2", "boundaries": [[[0, 1, 2]]] }}]
                }}
              }},
              "vertices": [[0, 0, 0], [1, 0, 0], [0, 1, 0]]
            }}"#
        )
    }

    #[test]
    fn colliding_ids_in_different_tiles_both_get_written() {
        let dir = temp_dir();
        fs::create_dir_all(dir.join("in")).unwrap();
        fs::write(dir.join("in/a.json"), single_building("DEBE:1")).unwrap();
        fs::write(dir.join("in/b.json"), single_building("DEBE/1")).unwrap();
        let out = dir.join("meshes");

        let counts = run(&args(&dir.join("in"), &out, &[])).unwrap();
        assert_eq!(counts, Counts { written: 2, skipped: 0, empty: 0, failed: 0 });
        assert!(out.join("DEBE_1.obj").is_file());
        assert!(out.join("DEBE_1_1.obj").is_file());

        // A second run finds both files from the first one.
        let again = run(&args(&dir.join("in"), &out, &[])).unwrap();
        assert_eq!(again, Counts { written: 0, skipped: 2, empty: 0, failed: 0 });

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn broken_document_counts_as_failure() {
        let dir = temp_dir();
        let input = dir.join("bad.json");
        fs::write(&input, "{ not json").unwrap();
        let counts = run(&args(&input, &dir.join("out"), &[])).unwrap();
        assert_eq!(counts.failed, 1);
        assert!(run(&args(&dir.join("missing.json"), &dir.join("out"), &[])).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
