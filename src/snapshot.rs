use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::Result;

/// Per-execution scratch directory.
///
/// The worker runs each cell with this directory as its working directory, so
/// files the cell writes land here and show up as artifacts. Removal happens
/// exactly once: on [`ScratchDir::close`] or, failing that, on drop.
pub struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    /// Create a fresh, uniquely named directory under `base`
    pub fn create(base: &Path) -> Result<Self> {
        let path = base.join(format!("cell-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)?;
        debug!("[SCRATCH] Created scratch dir: {:?}", path);
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of the entries currently in the directory, sorted; hidden entries skipped
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove the directory now, reporting failure
    pub fn close(mut self) -> Result<()> {
        self.release()?;
        Ok(())
    }

    fn release(&mut self) -> std::io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!("[SCRATCH] Removed scratch dir: {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for ScratchDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchDir")
            .field("path", &self.path)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("[SCRATCH] Failed to remove scratch dir {:?}: {}", self.path, e);
        }
    }
}

/// What one poll observed.
///
/// `output` holds only text produced since the previous poll; `cumulative`
/// holds everything the execution printed so far. A finished snapshot owns the
/// execution's scratch directory: artifacts stay readable until the snapshot
/// is closed or dropped.
#[derive(Debug)]
pub struct OutputSnapshot {
    output: String,
    cumulative: String,
    filenames: Vec<String>,
    done: bool,
    scratch: Option<ScratchDir>,
}

impl OutputSnapshot {
    pub(crate) fn running(output: String, cumulative: String, filenames: Vec<String>) -> Self {
        Self {
            output,
            cumulative,
            filenames,
            done: false,
            scratch: None,
        }
    }

    pub(crate) fn finished(
        output: String,
        cumulative: String,
        filenames: Vec<String>,
        scratch: Option<ScratchDir>,
    ) -> Self {
        Self {
            output,
            cumulative,
            filenames,
            done: true,
            scratch,
        }
    }

    /// Nothing in flight
    pub fn idle() -> Self {
        Self::finished(String::new(), String::new(), Vec::new(), None)
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn cumulative(&self) -> &str {
        &self.cumulative
    }

    /// Artifact names, relative to the scratch directory
    pub fn filenames(&self) -> &[String] {
        &self.filenames
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Present only on the snapshot that finished an execution
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(ScratchDir::path)
    }

    pub fn artifact_path(&self, name: &str) -> Option<PathBuf> {
        if !self.filenames.iter().any(|f| f == name) {
            return None;
        }
        self.scratch_dir().map(|dir| dir.join(name))
    }

    /// Copy every artifact file into `dest`, returning the new paths.
    /// Directories produced by the cell are skipped.
    pub fn copy_artifacts_to(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        let Some(dir) = self.scratch_dir() else {
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(dest)?;

        let mut copied = Vec::new();
        for name in &self.filenames {
            let source = dir.join(name);
            if !source.is_file() {
                warn!("[SCRATCH] Skipping artifact that is not a file: {:?}", source);
                continue;
            }
            let target = dest.join(name);
            std::fs::copy(&source, &target)?;
            info!("[SCRATCH] Copied artifact: {:?} -> {:?}", source, target);
            copied.push(target);
        }
        Ok(copied)
    }

    /// Release the scratch directory now instead of on drop
    pub fn close(mut self) -> Result<()> {
        match self.scratch.take() {
            Some(scratch) => scratch.close(),
            None => Ok(()),
        }
    }
}
