use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// The parts of a task definition the recorder needs. Everything else is
/// carried along untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub instruction: String,
    #[serde(default)]
    pub related_apps: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub domain: String,
    pub task_name: String,
    pub config: TaskConfig,
    pub config_path: PathBuf,
}

impl TaskEntry {
    /// `<domain>/<task_name>`, also the task's directory under the result root.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.domain, self.task_name)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TaskError> {
    let file = File::open(path).map_err(|source| TaskError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| TaskError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves every task listed in `task_file` (a map of domain to task names)
/// against `<config_base>/examples/<domain>/<task>.json`.
///
/// Tasks whose config file is missing are skipped with a warning.
pub fn load_tasks(
    task_file: &Path,
    config_base: &Path,
    domain: Option<&str>,
) -> Result<Vec<TaskEntry>, TaskError> {
    let meta: BTreeMap<String, Vec<String>> = read_json(task_file)?;
    let mut tasks = Vec::new();

    for (dom, names) in meta {
        if domain.is_some_and(|d| d != dom) {
            continue;
        }
        for name in names {
            let task_name = name.trim_end_matches(".json").to_string();
            let config_path = config_base
                .join("examples")
                .join(&dom)
                .join(format!("{task_name}.json"));

            if !config_path.exists() {
                warn!("task config not found: {}", config_path.display());
                continue;
            }
            let config: TaskConfig = read_json(&config_path)?;
            tasks.push(TaskEntry {
                domain: dom.clone(),
                task_name,
                config,
                config_path,
            });
        }
    }

    Ok(tasks)
}

/// Picks a task by name, id or `<domain>/<name>`.
pub fn select_task(tasks: &[TaskEntry], selector: &str) -> Result<TaskEntry, TaskError> {
    tasks
        .iter()
        .find(|t| {
            t.task_name == selector || t.config.id == selector || t.identifier() == selector
        })
        .cloned()
        .ok_or_else(|| TaskError::NotFound(selector.to_string()))
}

/// Tasks to record in this run, in order: the selected one, or all of them.
pub fn task_queue(
    tasks: Vec<TaskEntry>,
    selector: Option<&str>,
) -> Result<Vec<TaskEntry>, TaskError> {
    match selector {
        Some(sel) => Ok(vec![select_task(&tasks, sel)?]),
        None if tasks.is_empty() => Err(TaskError::Empty),
        None => Ok(tasks),
    }
}
