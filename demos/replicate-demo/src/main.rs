mod config;

use std::ops::Range;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use vlog::{
    BlockStore, Core, CoreOptions, CoreStorage, FileStorage, FlatNodeStore, InMemoryBlockStore,
    NodeStore, ProofRequest, RandomAccess,
};

use crate::config::DemoConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = DemoConfig::from_env()?;
    info!(?cfg, "starting replication demo");

    match &cfg.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let storage = CoreStorage {
                oplog: FileStorage::open(dir.join("oplog")).context("Failed to open oplog file")?,
                tree: FlatNodeStore::new(
                    FileStorage::open(dir.join("tree")).context("Failed to open tree file")?,
                ),
                blocks: InMemoryBlockStore::new(),
            };
            // Blocks live in memory, so a previous run cannot be resumed.
            let writer = Core::open(storage, CoreOptions::new().with_overwrite(true))
                .context("Failed to open writer")?;
            run(&writer, &cfg).await
        }
        None => {
            let writer = Core::open(CoreStorage::in_memory(), CoreOptions::default())
                .context("Failed to open writer")?;
            run(&writer, &cfg).await
        }
    }
}

async fn run<S, N, B>(writer: &Core<S, N, B>, cfg: &DemoConfig) -> Result<()>
where
    S: RandomAccess,
    N: NodeStore,
    B: BlockStore,
{
    let blocks: Vec<Vec<u8>> = (0..cfg.blocks)
        .map(|i| format!("block-{i}").into_bytes())
        .collect();
    writer.append(&blocks).await?;
    info!(
        length = writer.length(),
        hash = %hex::encode(writer.tree_hash()),
        "writer appended"
    );

    let reader = Core::open(
        CoreStorage::in_memory(),
        CoreOptions::new().with_key_pair(writer.header().signer.public()),
    )
    .context("Failed to open reader")?;
    reader.on_update(|update| {
        debug!(
            status = ?update.status,
            bitfield = ?update.bitfield,
            from = ?update.from,
            "reader updated"
        );
    });

    // First contact: block 0 plus the signed upgrade to the writer's head.
    let proof = writer.proof(&ProofRequest::block(0, 0).with_upgrade(0, writer.length()).with_value())?;
    print_proof(cfg, "upgrade", &proof)?;
    if !reader.verify(&proof, Some(0)).await? {
        bail!("reader refused the initial upgrade");
    }
    download(&reader, writer, cfg, 1..writer.length()).await?;
    check_in_sync(&reader, writer)?;
    info!(length = reader.length(), "reader caught up");

    // Writer rewrites history from `truncate_to`.
    let fork = writer.fork() + 1;
    writer.truncate(cfg.truncate_to, fork).await?;
    let rewritten: Vec<Vec<u8>> = (cfg.truncate_to..cfg.blocks)
        .map(|i| format!("rewrite-{i}").into_bytes())
        .collect();
    writer.append(&rewritten).await?;
    info!(
        fork,
        length = writer.length(),
        hints = ?writer.header().reorg_hints,
        "writer forked"
    );

    let proof = writer.proof(&ProofRequest::upgrade(0, writer.length()))?;
    if reader.verify(&proof, Some(0)).await? {
        bail!("reader accepted an upgrade from another fork");
    }

    let mut reorg = reader.start_reorg(&proof)?;
    let mut rounds = 0;
    while let Some(request) = reorg.request() {
        let answer = writer.proof(&request)?;
        print_proof(cfg, "reorg", &answer)?;
        reader.update_reorg(&mut reorg, &answer)?;
        rounds += 1;
    }
    let ancestors = reorg.ancestors();
    if !reader.reorg(reorg, Some(0)).await? {
        bail!("reader dropped the reorg");
    }
    info!(ancestors, rounds, fork = reader.fork(), "reader followed the fork");

    download(&reader, writer, cfg, ancestors..reader.length()).await?;
    check_in_sync(&reader, writer)?;

    info!(
        length = reader.length(),
        byte_length = reader.byte_length(),
        fork = reader.fork(),
        hash = %hex::encode(reader.tree_hash()),
        "replication complete"
    );

    reader.close().await?;
    writer.close().await?;
    Ok(())
}

async fn download<S, N, B>(
    reader: &Core,
    writer: &Core<S, N, B>,
    cfg: &DemoConfig,
    range: Range<u64>,
) -> Result<()>
where
    S: RandomAccess,
    N: NodeStore,
    B: BlockStore,
{
    for i in range {
        let nodes = reader.missing_nodes(2 * i)?;
        let proof = writer.proof(&ProofRequest::block(i, nodes).with_value())?;
        print_proof(cfg, "block", &proof)?;
        if !reader.verify(&proof, Some(0)).await? {
            bail!("reader refused block {i}");
        }
    }
    Ok(())
}

fn check_in_sync<S, N, B>(reader: &Core, writer: &Core<S, N, B>) -> Result<()>
where
    S: RandomAccess,
    N: NodeStore,
    B: BlockStore,
{
    if reader.tree_hash() != writer.tree_hash() {
        bail!("reader and writer disagree on the tree hash");
    }
    for i in 0..writer.length() {
        if reader.block(i)? != writer.block(i)? {
            bail!("block {i} differs between reader and writer");
        }
    }
    Ok(())
}

fn print_proof(cfg: &DemoConfig, kind: &str, proof: &vlog::Proof) -> Result<()> {
    if cfg.print_proofs {
        let json = serde_json::to_string(proof).context("Failed to encode proof")?;
        println!("{kind}: {json}");
    }
    Ok(())
}
