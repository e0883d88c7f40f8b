use std::path::PathBuf;

use netns_watch::netns::{PROCFS_ROOT, resolve};

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let proc_root = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(PROCFS_ROOT));

    let namespaces = resolve(&proc_root).await?;

    println!("Listing all network namespaces ({})", namespaces.len());
    for (inode, pid) in namespaces {
        println!("Network namespace : INode = {inode}\t| Representative pid = {pid}");
    }

    Ok(())
}
