//! Worker executable resolution.
//!
//! Which layout applies is decided by the deployment flag handed in by the host;
//! nothing here guesses it.

use crate::error::SpawnError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Deployment {
    /// Source tree: `backend/main.py` run by the project's interpreter.
    Development {
        project_root: PathBuf,
        #[serde(default)]
        python: Option<PathBuf>,
    },
    /// Bundled executable inside the application's resource directory.
    Packaged { resources_dir: PathBuf },
    /// Explicit command line, no resolution.
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Fully resolved program and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

pub fn worker_exe_name() -> &'static str {
    if cfg!(windows) {
        "api.exe"
    } else {
        "api"
    }
}

/// `<dir of the running executable>/resources`.
pub fn default_resources_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("resources"))
}

fn venv_python(backend: &Path) -> PathBuf {
    if cfg!(windows) {
        backend.join("venv").join("Scripts").join("python.exe")
    } else {
        backend.join("venv").join("bin").join("python")
    }
}

pub fn resolve(deployment: &Deployment) -> Result<LaunchSpec, SpawnError> {
    match deployment {
        Deployment::Development {
            project_root,
            python,
        } => {
            let backend = project_root.join("backend");
            let script = backend.join("main.py");
            if !script.is_file() {
                return Err(SpawnError::NotFound { path: script });
            }
            let interpreter = match python {
                Some(p) => p.clone(),
                None => {
                    let venv = venv_python(&backend);
                    if venv.is_file() {
                        venv
                    } else {
                        PathBuf::from("python")
                    }
                }
            };
            Ok(LaunchSpec {
                program: interpreter,
                args: vec![script.to_string_lossy().into_owned()],
            })
        }
        Deployment::Packaged { resources_dir } => {
            let exe = resources_dir.join(worker_exe_name());
            if !exe.is_file() {
                return Err(SpawnError::NotFound { path: exe });
            }
            Ok(LaunchSpec {
                program: exe,
                args: Vec::new(),
            })
        }
        Deployment::Command { program, args } => Ok(LaunchSpec {
            program: program.clone(),
            args: args.clone(),
        }),
    }
}
