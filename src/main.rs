use std::net::SocketAddr;

use kadnode::node::{Node, RENDEZVOUS_ADDR};

/// Usage: kadnode [local_addr] [rendezvous_addr | none]
///
/// Defaults to binding 0.0.0.0:8080 and joining the conventional rendezvous
/// peer. The rendezvous node itself is started with its own address in both
/// positions, which makes it self-elect and skip the join.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let local_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "0.0.0.0:8080".to_string())
        .parse()?;
    let rendezvous: Option<SocketAddr> = match args.next() {
        Some(arg) if arg == "none" => None,
        Some(arg) => Some(arg.parse()?),
        None => Some(RENDEZVOUS_ADDR.parse()?),
    };

    let node = Node::init(local_addr, rendezvous).await?;
    tracing::info!(
        id = %node.contact().node_id,
        addr = %node.contact().address,
        "node is up"
    );

    // the receive, sweep and refresh tasks carry the node from here on
    std::future::pending::<()>().await;
    Ok(())
}
