/// Restore dependency graph generation.
///
/// Asks MSBuild (through `dotnet msbuild`) to restore the project and write
/// its dependency graph to a temporary file, then reads that file back. The
/// graph document itself is opaque here.
use crate::runner::{CommandRunner, RunResult, RunnerError};
use std::path::{Path, PathBuf};

/// Binary log written next to the project for post-mortem debugging.
pub const BINARY_LOG: &str = "GenerateDependencyGraph.binlog";

/// The graph document produced by a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraphArtifact {
    text: String,
}

impl DependencyGraphArtifact {
    pub fn new(text: String) -> Self {
        Self { text }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether the payload is syntactically valid JSON. The schema is not
    /// checked.
    pub fn is_well_formed(&self) -> bool {
        serde_json::from_str::<serde::de::IgnoredAny>(&self.text).is_ok()
    }
}

/// Errors from graph generation.
#[derive(Debug)]
pub enum GraphError {
    /// The build tool ran but did not succeed. The message carries the
    /// captured output and exit code for the user.
    Validation { message: String },
    /// The build tool could not be run at all.
    Runner(RunnerError),
    /// No temporary file could be allocated for the graph output.
    TempFile(std::io::Error),
    /// The build tool reported success but the graph file was unreadable.
    ReadArtifact {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The project path could not be made absolute.
    ProjectPath {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::Validation { message } => f.write_str(message),
            GraphError::Runner(e) => write!(f, "{}", e),
            GraphError::TempFile(e) => {
                write!(f, "failed to create temporary graph file: {}", e)
            }
            GraphError::ReadArtifact { path, source } => {
                write!(
                    f,
                    "failed to read dependency graph {}: {}",
                    path.display(),
                    source
                )
            }
            GraphError::ProjectPath { path, source } => {
                write!(f, "failed to resolve project path {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraphError::Validation { .. } => None,
            GraphError::Runner(e) => Some(e),
            GraphError::TempFile(e) => Some(e),
            GraphError::ReadArtifact { source, .. } => Some(source),
            GraphError::ProjectPath { source, .. } => Some(source),
        }
    }
}

impl From<RunnerError> for GraphError {
    fn from(e: RunnerError) -> Self {
        GraphError::Runner(e)
    }
}

/// MSBuild arguments that restore `project_path` and write its dependency
/// graph to `output_path`.
///
/// This list is the contract with the MSBuild CLI; keep it verbatim.
pub fn build_arguments(project_path: &Path, output_path: &Path, runtime: &str) -> Vec<String> {
    vec![
        "msbuild".to_string(),
        project_path.display().to_string(),
        "/p:MSBuildTreatWarningsAsErrors=false".to_string(),
        "/p:NoWarn=NU1605".to_string(),
        "/p:NuGetAudit=false".to_string(),
        "/p:TreatWarningsAsErrors=false".to_string(),
        "/p:UseSharedCompilation=false".to_string(),
        "/t:Restore,GenerateRestoreGraphFile".to_string(),
        format!("/p:RestoreGraphOutputPath=\"{}\"", output_path.display()),
        format!("/p:RuntimeIdentifiers=\"{}\"", runtime),
        format!("-binaryLogger:{}", BINARY_LOG),
        "-nodeReuse:false".to_string(),
        "-verbosity:detailed".to_string(),
    ]
}

/// Directory the build tool runs in: the project's parent, or `.` for a
/// bare file name.
pub fn working_dir_for(project_path: &Path) -> PathBuf {
    match project_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// User-facing explanation of a failed graph run.
fn failure_message(project_path: &Path, run: &RunResult) -> String {
    format!(
        "Unable to process the project `{}`. Are you sure this is a valid .NET Core or .NET Standard project type?\n\n\
         Here is the full error message returned from the Microsoft Build Engine:\n\n\
         {} - {} - exit code: {}",
        project_path.display(),
        run.output,
        run.errors,
        run.exit_code
    )
}

/// Generates dependency graphs through a [`CommandRunner`].
pub struct DependencyGraphService<R> {
    runner: R,
}

impl<R: CommandRunner> DependencyGraphService<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    #[cfg(test)]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Restore `project_path` for `runtime` (may be empty) and return the
    /// resulting graph document.
    ///
    /// A successful run is the only signal that the graph file is complete;
    /// it is read once, without retries. The temporary file is removed
    /// before returning. A relative `project_path` is resolved against the
    /// current directory, since the build tool runs in the project's parent.
    pub async fn generate_dependency_graph(
        &self,
        project_path: &Path,
        runtime: &str,
    ) -> Result<DependencyGraphArtifact, GraphError> {
        let project_path =
            std::path::absolute(project_path).map_err(|e| GraphError::ProjectPath {
                path: project_path.to_path_buf(),
                source: e,
            })?;
        let project_path = project_path.as_path();

        let output = tempfile::Builder::new()
            .prefix("dg-")
            .suffix(".json")
            .tempfile()
            .map_err(GraphError::TempFile)?
            .into_temp_path();

        let args = build_arguments(project_path, &output, runtime);
        let working_dir = working_dir_for(project_path);

        tracing::info!(
            project = %project_path.display(),
            runtime,
            graph = %output.display(),
            "generating dependency graph"
        );

        let run = self.runner.run(&working_dir, &args).await?;

        if !run.is_success() {
            tracing::warn!(
                project = %project_path.display(),
                exit_code = run.exit_code,
                timed_out = run.timed_out(),
                "dependency graph generation failed"
            );
            return Err(GraphError::Validation {
                message: failure_message(project_path, &run),
            });
        }

        let text = tokio::fs::read_to_string(&output)
            .await
            .map_err(|e| GraphError::ReadArtifact {
                path: output.to_path_buf(),
                source: e,
            })?;
        tracing::debug!(bytes = text.len(), "dependency graph read");

        if let Err(e) = output.close() {
            tracing::debug!(error = %e, "failed to remove temporary graph file");
        }
        Ok(DependencyGraphArtifact::new(text))
    }
}
