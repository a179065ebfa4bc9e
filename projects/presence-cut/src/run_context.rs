use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Prefix of per-run working directories inside the results root.
const WORKDIR_PREFIX: &str = ".run-";

/// A published result file, addressable by its name within the results root.
#[derive(serde::Serialize, Debug, Clone, PartialEq)]
pub struct ResultArtifact {
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Resources owned by one pipeline run. The working directory (intermediate
/// clips, staged output) is deleted when the context is dropped, whatever
/// the outcome of the run.
pub struct RunContext {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    results_root: PathBuf,
    workdir: TempDir,
}

impl RunContext {
    pub fn create(results_root: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(results_root)?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();

        // Same filesystem as the results root, so publishing is a rename.
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{}{}-", WORKDIR_PREFIX, run_id))
            .tempdir_in(results_root)?;

        tracing::debug!(
            "Created run {} with workdir {}",
            run_id,
            workdir.path().display()
        );

        Ok(Self {
            run_id,
            created_at: Utc::now(),
            results_root: results_root.to_path_buf(),
            workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    pub fn artifact_name(&self, extension: &str) -> String {
        format!("result_{}.{}", self.run_id, extension)
    }

    pub fn manifest_name(&self) -> String {
        format!("result_{}.json", self.run_id)
    }

    /// Move a staged file from the working directory into the results root.
    pub fn publish(&self, staged: &Path, extension: &str) -> Result<ResultArtifact, PipelineError> {
        let name = self.artifact_name(extension);
        let path = self.results_root.join(&name);
        fs::rename(staged, &path)?;
        tracing::info!("Published {}", path.display());
        Ok(ResultArtifact { name, path })
    }
}

/// A download name is accepted only if it is a plain, visible file name.
pub fn is_valid_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name != ".."
}

/// Resolve a published artifact by name inside `results_root`.
pub fn resolve_artifact(results_root: &Path, name: &str) -> Option<PathBuf> {
    if !is_valid_artifact_name(name) {
        return None;
    }
    let path = results_root.join(name);
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workdir_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let workdir = {
            let ctx = RunContext::create(root.path()).unwrap();
            fs::write(ctx.workdir().join("part0000.mp4"), b"x").unwrap();
            assert!(ctx.workdir().starts_with(root.path()));
            ctx.workdir().to_path_buf()
        };
        assert!(!workdir.exists());
    }

    #[test]
    fn test_runs_are_isolated() {
        let root = tempfile::tempdir().unwrap();
        let a = RunContext::create(root.path()).unwrap();
        let b = RunContext::create(root.path()).unwrap();
        assert_ne!(a.run_id, b.run_id);
        assert_ne!(a.workdir(), b.workdir());
        assert_ne!(a.artifact_name("mp4"), b.artifact_name("mp4"));
    }

    #[test]
    fn test_publish_survives_context_drop() {
        let root = tempfile::tempdir().unwrap();
        let artifact = {
            let ctx = RunContext::create(root.path()).unwrap();
            let staged = ctx.workdir().join("spliced.mp4");
            fs::write(&staged, b"video").unwrap();
            ctx.publish(&staged, "mp4").unwrap()
        };
        assert!(artifact.name.starts_with("result_"));
        assert_eq!(fs::read(&artifact.path).unwrap(), b"video");
        assert_eq!(
            resolve_artifact(root.path(), &artifact.name),
            Some(artifact.path.clone())
        );
    }

    #[test]
    fn test_resolve_rejects_traversal_and_hidden() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(".secret"), b"x").unwrap();

        assert!(resolve_artifact(root.path(), "../etc/passwd").is_none());
        assert!(resolve_artifact(root.path(), "..").is_none());
        assert!(resolve_artifact(root.path(), ".secret").is_none());
        assert!(resolve_artifact(root.path(), "a\\b").is_none());
        assert!(resolve_artifact(root.path(), "missing.mp4").is_none());
    }
}
