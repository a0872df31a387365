use clap::Parser;
use std::path::PathBuf;

/// `citydata_fetch` - downloads the zipped CityGML archives of a city's districts and
/// unpacks each one into its own directory.
///
/// Districts come from `--manifest` when given, otherwise from the built-in Berlin list
/// combined with `--base-url` (`<base-url>/<district>.zip`).
#[derive(Parser, Debug, Clone)]
#[command(name = "citydata_fetch", version, about, long_about = None)]
pub struct Config {
    /// Base URL the district archives are published under.
    #[arg(long, env = "CITYDATA_BASE_URL")]
    pub base_url: Option<String>,

    /// JSON list of `{"name": ..., "url": ...}` entries replacing the built-in districts.
    #[arg(long, env = "CITYDATA_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Directory that receives one sub-directory per district.
    #[arg(long, env = "CITYDATA_OUTPUT_DIR", default_value = "citydata/berlin")]
    pub output_dir: PathBuf,

    /// Only fetch these districts (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Maximum simultaneous downloads; 0 starts every district at once.
    #[arg(long, env = "CITYDATA_CONCURRENCY", default_value_t = 0)]
    pub concurrency: usize,

    /// Extra attempts per download after the first one fails.
    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    /// Delay before the first retry; doubled on every further attempt.
    #[arg(long, default_value_t = 1000)]
    pub backoff_ms: u64,

    /// Per-request timeout.
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,

    /// Re-fetch districts whose directory is already populated.
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,

    /// Keep `<district>.zip` next to the extracted directory.
    #[arg(long, default_value_t = false)]
    pub keep_archives: bool,
}
