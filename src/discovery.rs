/// Resolve a user-supplied path to the single solution or project file to
/// restore.
use std::path::{Path, PathBuf};

const SOLUTION_EXTENSIONS: &[&str] = &["sln", "slnx"];
const PROJECT_EXTENSIONS: &[&str] = &["csproj", "fsproj", "vbproj"];

#[derive(Debug)]
pub enum DiscoveryError {
    /// The path does not exist.
    NotFound(PathBuf),
    /// The directory holds no solution or project file.
    NoProject(PathBuf),
    /// The directory holds several candidates of the same kind.
    Ambiguous { dir: PathBuf, candidates: Vec<PathBuf> },
    /// The directory path could not be turned into a search pattern.
    Pattern(glob::PatternError),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::NotFound(path) => {
                write!(f, "the path {} does not exist", path.display())
            }
            DiscoveryError::NoProject(dir) => {
                write!(
                    f,
                    "the directory {} does not contain a solution or project file",
                    dir.display()
                )
            }
            DiscoveryError::Ambiguous { dir, candidates } => {
                let names: Vec<String> = candidates
                    .iter()
                    .filter_map(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .collect();
                write!(
                    f,
                    "the directory {} contains more than one candidate ({}); specify which one to use",
                    dir.display(),
                    names.join(", ")
                )
            }
            DiscoveryError::Pattern(e) => write!(f, "invalid search pattern: {}", e),
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiscoveryError::Pattern(e) => Some(e),
            _ => None,
        }
    }
}

/// Return `path` itself if it is a file, otherwise the one solution (or,
/// failing that, the one project) directly inside the directory. The result
/// is always absolute.
pub fn resolve_project(path: &Path) -> Result<PathBuf, DiscoveryError> {
    let path =
        std::path::absolute(path).map_err(|_| DiscoveryError::NotFound(path.to_path_buf()))?;
    let path = path.as_path();
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        return Err(DiscoveryError::NotFound(path.to_path_buf()));
    }

    let solutions = find_with_extensions(path, SOLUTION_EXTENSIONS)?;
    let mut candidates = if solutions.is_empty() {
        find_with_extensions(path, PROJECT_EXTENSIONS)?
    } else {
        solutions
    };

    match candidates.len() {
        0 => Err(DiscoveryError::NoProject(path.to_path_buf())),
        1 => {
            let found = candidates.remove(0);
            tracing::debug!(project = %found.display(), "resolved project file");
            Ok(found)
        }
        _ => Err(DiscoveryError::Ambiguous {
            dir: path.to_path_buf(),
            candidates,
        }),
    }
}

/// Non-recursive, sorted listing of files in `dir` with any of `extensions`.
fn find_with_extensions(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, DiscoveryError> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let mut found = Vec::new();
    for ext in extensions {
        let pattern = format!("{}/*.{}", escaped, ext);
        let entries = glob::glob(&pattern).map_err(DiscoveryError::Pattern)?;
        for entry in entries {
            match entry {
                Ok(p) if p.is_file() => found.push(p),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable directory entry");
                }
            }
        }
    }
    found.sort();
    Ok(found)
}
