use std::io::Write;
use std::path::Path;

/// Directory under the download root holding per-shard raw outputs.
pub const VOLUMES_DIR: &str = "volumes";
/// Directory under the volumes dir where named output volumes land.
pub const OUTPUTS_DIR: &str = "outputs";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";
pub const EXIT_CODE_FILE: &str = "exitCode";

/// The first eight characters of a node id, as used in result filenames.
pub fn short_id(node_id: &str) -> &str {
    node_id.get(..8).unwrap_or(node_id)
}

fn node_file(shard: u32, node_id: &str, kind: &str) -> String {
    format!("{VOLUMES_DIR}/{shard}/node_{}_{kind}", short_id(node_id))
}

/// The canonical download layout clients assert on:
///
/// ```text
/// <download-root>/
///   volumes/0/node_<shortHostID>_exitCode
///   volumes/0/node_<shortHostID>_stderr
///   volumes/0/node_<shortHostID>_stdout
///   volumes/outputs
///   stdout
///   stderr
/// ```
#[derive(Debug, Clone)]
pub struct ResultsLayout {
    pub total_shards: u32,
    pub node_ids: Vec<String>,
}

impl ResultsLayout {
    pub fn new(total_shards: u32, node_ids: Vec<String>) -> Self {
        Self { total_shards: total_shards.max(1), node_ids }
    }

    /// Every relative path a complete download contains, each exactly once,
    /// sorted.
    pub fn expected_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for shard in 0..self.total_shards {
            for node_id in &self.node_ids {
                files.push(node_file(shard, node_id, EXIT_CODE_FILE));
                files.push(node_file(shard, node_id, STDERR_FILE));
                files.push(node_file(shard, node_id, STDOUT_FILE));
            }
        }
        files.push(format!("{VOLUMES_DIR}/{OUTPUTS_DIR}"));
        files.push(STDOUT_FILE.to_string());
        files.push(STDERR_FILE.to_string());
        files.sort();
        files
    }

    /// Merge the per-node stdout/stderr files into the root-level `stdout`
    /// and `stderr`, shard by shard, nodes in id order. Creates the outputs
    /// directory when the publisher did not.
    pub fn assemble(&self, download_root: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(download_root.join(VOLUMES_DIR).join(OUTPUTS_DIR))?;

        let mut nodes = self.node_ids.clone();
        nodes.sort();

        for kind in [STDOUT_FILE, STDERR_FILE] {
            let mut merged = std::fs::File::create(download_root.join(kind))?;
            for shard in 0..self.total_shards {
                for node_id in &nodes {
                    let part = download_root.join(node_file(shard, node_id, kind));
                    match std::fs::read(&part) {
                        Ok(bytes) => merged.write_all(&bytes)?,
                        Err(_) => continue, // node never ran this shard
                    }
                }
            }
        }
        Ok(())
    }
}
