// Task files: TOML documents decoded into a TaskConfig

use anyhow::{Context, Result};
use std::path::Path;

use qvisor_core::domain::TaskConfig;

pub fn load(path: &Path) -> Result<TaskConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    parse(&raw).with_context(|| format!("Invalid task file {}", path.display()))
}

pub fn parse(raw: &str) -> Result<TaskConfig> {
    let task: TaskConfig = toml::from_str(raw)?;
    if task.name.trim().is_empty() {
        anyhow::bail!("task name must not be empty");
    }
    Ok(task)
}
