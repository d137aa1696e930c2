use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::RequesterError;

/// How a job's input space is cut into shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Glob matched against exploded input paths, e.g. "/input/*"
    pub glob_pattern: String,
    /// How many matched paths each shard processes
    pub batch_size: u32,
}

/// Frozen at admission; shard indexes ride in `AskForBid` payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub total_shards: u32,
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self { total_shards: 1 }
    }
}

impl ExecutionPlan {
    /// Cut the exploded input paths into shards.
    pub fn build(paths: &[String], config: &ShardingConfig) -> Result<ExecutionPlan, RequesterError> {
        if config.batch_size == 0 {
            return Err(RequesterError::InvalidJob("sharding batch_size must be >= 1".into()));
        }
        let matched = paths
            .iter()
            .filter(|p| glob_match(&config.glob_pattern, p))
            .count() as u32;
        if matched == 0 {
            return Err(RequesterError::InvalidJob(format!(
                "sharding pattern '{}' matched no input paths",
                config.glob_pattern
            )));
        }
        Ok(ExecutionPlan {
            total_shards: matched.div_ceil(config.batch_size),
        })
    }

    pub fn shard_indexes(&self) -> Vec<u32> {
        (0..self.total_shards).collect()
    }
}

/// Explode a local directory into the paths it mounts at inside the workload.
/// Walks recursively; files only.
pub fn explode_local_dir(fs_root: &Path, mount_path: &str) -> std::io::Result<Vec<String>> {
    let mut paths = Vec::new();
    walk(fs_root, mount_path.trim_end_matches('/'), &mut paths)?;
    paths.sort();
    Ok(paths)
}

fn walk(dir: &Path, mount: &str, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let mounted = format!("{mount}/{name}");
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), &mounted, out)?;
        } else {
            out.push(mounted);
        }
    }
    Ok(())
}

/// Minimal glob: `*` within a path segment, `**` across segments, `?` one
/// character. Everything else matches literally.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    match_inner(&pat, &txt)
}

fn match_inner(pat: &[char], text: &[char]) -> bool {
    let Some(&first) = pat.first() else {
        return text.is_empty();
    };
    match first {
        '*' => {
            if pat.get(1) == Some(&'*') {
                let rest = &pat[2..];
                (0..=text.len()).any(|i| match_inner(rest, &text[i..]))
            } else {
                let rest = &pat[1..];
                for i in 0..=text.len() {
                    if i > 0 && text[i - 1] == '/' {
                        break;
                    }
                    if match_inner(rest, &text[i..]) {
                        return true;
                    }
                }
                false
            }
        }
        '?' => match text.first() {
            Some(&c) if c != '/' => match_inner(&pat[1..], &text[1..]),
            _ => false,
        },
        c => match text.first() {
            Some(&t) if t == c => match_inner(&pat[1..], &text[1..]),
            _ => false,
        },
    }
}
