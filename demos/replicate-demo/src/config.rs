use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct DemoConfig {
    pub blocks: u64,
    pub truncate_to: u64,
    /// Keep the writer's oplog and tree nodes on disk here
    pub data_dir: Option<PathBuf>,
    pub print_proofs: bool,
}

impl DemoConfig {
    pub fn from_env() -> Result<Self> {
        let blocks = parse("VLOG_DEMO_BLOCKS")?.unwrap_or(16);
        let truncate_to = parse("VLOG_DEMO_TRUNCATE_TO")?.unwrap_or(blocks / 2);
        let data_dir = std::env::var("VLOG_DEMO_DIR").ok().map(PathBuf::from);
        let print_proofs = std::env::var("VLOG_DEMO_PRINT_PROOFS")
            .ok()
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
            .unwrap_or(false);

        if blocks == 0 {
            bail!("VLOG_DEMO_BLOCKS must be at least 1");
        }
        if truncate_to >= blocks {
            bail!("VLOG_DEMO_TRUNCATE_TO must be below VLOG_DEMO_BLOCKS ({blocks})");
        }

        Ok(Self {
            blocks,
            truncate_to,
            data_dir,
            print_proofs,
        })
    }
}

fn parse(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be a non-negative integer, got {v:?}")),
        Err(_) => Ok(None),
    }
}
