//! Loading DAG definition files.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::{Dag, DagType};
use crate::errors::DefError;

/// A loaded definition file: the root DAG plus any `---`-separated local
/// sub-DAGs callable by name from `call` steps.
#[derive(Debug, Clone)]
pub struct DagFile {
    pub root: Dag,
    pub locals: Vec<Dag>,
}

impl DagFile {
    pub fn local(&self, name: &str) -> Option<&Dag> {
        self.locals.iter().find(|d| d.name == name)
    }
}

/// Load a definition file, resolving names and implicit chain edges.
pub fn load_file(path: &Path) -> Result<DagFile, DefError> {
    let text = std::fs::read_to_string(path).map_err(|source| DefError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let location = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());

    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let mut dag = Dag::deserialize(doc).map_err(|source| DefError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        finalize(&mut dag, &location, docs.is_empty());
        docs.push(dag);
    }

    let mut docs = docs.into_iter();
    let root = docs.next().ok_or_else(|| DefError::Empty(path.to_path_buf()))?;
    if root.steps.is_empty() {
        return Err(DefError::Empty(path.to_path_buf()));
    }

    let file = DagFile {
        root,
        locals: docs.collect(),
    };
    debug!(
        dag = %file.root.name,
        steps = file.root.steps.len(),
        locals = file.locals.len(),
        "loaded dag definition"
    );
    Ok(file)
}

/// Resolve the target of a `call` step: local documents first, then a
/// `<name>.yaml`/`<name>.yml` sibling of the caller, then the dags dir.
pub fn resolve_call(
    file: &DagFile,
    dags_dir: &Path,
    name: &str,
) -> Result<DagFile, DefError> {
    if let Some(local) = file.local(name) {
        return Ok(DagFile {
            root: local.clone(),
            locals: file.locals.clone(),
        });
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(parent) = file.root.location.parent() {
        candidates.push(parent.join(format!("{name}.yaml")));
        candidates.push(parent.join(format!("{name}.yml")));
    }
    candidates.push(dags_dir.join(format!("{name}.yaml")));
    candidates.push(dags_dir.join(format!("{name}.yml")));

    for candidate in candidates {
        if candidate.is_file() {
            return load_file(&candidate);
        }
    }
    Err(DefError::NotFound(name.to_string()))
}

fn finalize(dag: &mut Dag, location: &Path, is_root: bool) {
    if dag.name.is_empty() {
        if is_root {
            dag.name = location
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string());
        } else {
            dag.name = "unnamed".to_string();
        }
    }
    dag.location = location.to_path_buf();

    // Chain DAGs get implicit linear dependencies between adjacent steps.
    if dag.dag_type == DagType::Chain {
        let names: Vec<String> = dag.steps.iter().map(|s| s.name.clone()).collect();
        for (i, step) in dag.steps.iter_mut().enumerate() {
            if i > 0 && step.depends.is_empty() {
                step.depends = vec![names[i - 1].clone()];
            }
        }
    }

    if dag.max_active_runs == 0 {
        dag.max_active_runs = 1;
    }
}
