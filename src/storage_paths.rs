//! Purpose: Storage layout for step logs and artifacts, plus safe path resolution.
//! Exports: `default_storage_dir`, `step_output`, `artifact`, `resolve`.
//! Role: Single place that turns caller-supplied ids and paths into storage paths.
//! Invariants: Default storage directory remains `~/.pipelog/storage`.
//! Invariants: Resolved paths never escape the storage root.

use std::path::{Component, Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

pub fn default_storage_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".pipelog").join("storage")
}

/// Relative path of a step's console output: `{pipeline_id}/step-{step_id}.log`.
pub fn step_output(pipeline_id: &str, step_id: u64) -> Result<String, Error> {
    check_pipeline_id(pipeline_id)?;
    if step_id == 0 {
        return Err(usage("step id must be positive"));
    }
    Ok(format!("{pipeline_id}/step-{step_id}.log"))
}

/// Relative path of an uploaded artifact: `{pipeline_id}/{relative}`.
pub fn artifact(pipeline_id: &str, relative: &str) -> Result<String, Error> {
    check_pipeline_id(pipeline_id)?;
    let relative = relative.trim_start_matches('/');
    check_relative(Path::new(relative))?;
    Ok(format!("{pipeline_id}/{relative}"))
}

/// Join `relative` onto `root`, refusing anything that could leave `root`.
pub fn resolve(root: &Path, relative: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let relative = relative.as_ref();
    check_relative(relative)?;
    Ok(root.join(relative))
}

fn check_pipeline_id(pipeline_id: &str) -> Result<(), Error> {
    let mut components = Path::new(pipeline_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !pipeline_id.contains(['/', '\\']) => Ok(()),
        _ => Err(usage("invalid pipeline id").with_path(pipeline_id)),
    }
}

fn check_relative(relative: &Path) -> Result<(), Error> {
    if relative.as_os_str().is_empty() {
        return Err(usage("empty storage path"));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(usage("storage path escapes the storage root").with_path(relative));
            }
        }
    }
    if relative.components().all(|c| c == Component::CurDir) {
        return Err(usage("empty storage path").with_path(relative));
    }
    Ok(())
}

fn usage(message: &str) -> Error {
    Error::new(ErrorKind::Usage).with_message(message)
}
