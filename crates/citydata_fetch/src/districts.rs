use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

/// The twelve Berlin Bezirke, spelled as in the published archive names.
pub const BERLIN_DISTRICTS: [&str; 12] = [
    "Charlottenburg-Wilmersdorf",
    "Friedrichshain-Kreuzberg",
    "Lichtenberg",
    "Marzahn-Hellersdorf",
    "Mitte",
    "Neukoelln",
    "Pankow",
    "Reinickendorf",
    "Spandau",
    "Steglitz-Zehlendorf",
    "Tempelhof-Schoeneberg",
    "Treptow-Koepenick",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct District {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum DistrictError {
    #[error("Either --base-url or --manifest is required")]
    NoSource,
    #[error("Invalid district name '{0}': must be a single path component")]
    BadName(String),
    #[error("Duplicate district '{0}'")]
    Duplicate(String),
    #[error("Unknown district '{0}'")]
    Unknown(String),
    #[error("Failed to open manifest {path}: {source}")]
    ManifestIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse manifest {path}: {source}")]
    ManifestJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `<base_url>/<name>.zip` for each name.
pub fn from_base_url<'a>(base_url: &str, names: impl IntoIterator<Item = &'a str>) -> Vec<District> {
    let base = base_url.trim_end_matches('/');
    names
        .into_iter()
        .map(|name| District {
            name: name.to_string(),
            url: format!("{}/{}.zip", base, name),
        })
        .collect()
}

pub fn load_manifest(path: &Path) -> Result<Vec<District>, DistrictError> {
    let file = File::open(path).map_err(|source| DistrictError::ManifestIo {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| DistrictError::ManifestJson {
        path: path.display().to_string(),
        source,
    })
}

/// Names become directory names, so they must not contain separators or be `.`/`..`.
pub fn validate(districts: &[District]) -> Result<(), DistrictError> {
    let mut seen = std::collections::HashSet::new();
    for d in districts {
        let n = d.name.as_str();
        if n.is_empty() || n == "." || n == ".." || n.contains(['/', '\\']) {
            return Err(DistrictError::BadName(d.name.clone()));
        }
        if !seen.insert(n) {
            return Err(DistrictError::Duplicate(d.name.clone()));
        }
    }
    Ok(())
}

/// Build the district list from the command line: manifest first, then base URL.
/// `only`, when non-empty, restricts the list to those names.
pub fn resolve(
    base_url: Option<&str>,
    manifest: Option<&Path>,
    only: &[String],
) -> Result<Vec<District>, DistrictError> {
    let mut districts = match (manifest, base_url) {
        (Some(path), _) => load_manifest(path)?,
        (None, Some(base)) => from_base_url(base, BERLIN_DISTRICTS),
        (None, None) => return Err(DistrictError::NoSource),
    };
    validate(&districts)?;

    if !only.is_empty() {
        if let Some(missing) = only.iter().find(|o| !districts.iter().any(|d| &d.name == *o)) {
            return Err(DistrictError::Unknown(missing.clone()));
        }
        districts.retain(|d| only.contains(&d.name));
    }
    Ok(districts)
}
