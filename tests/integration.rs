use kadnode::{Node, NodeID};

async fn standalone() -> anyhow::Result<Node> {
    Node::init("127.0.0.1:0".parse()?, None).await
}

async fn join_via(seed: &Node) -> anyhow::Result<Node> {
    Node::init("127.0.0.1:0".parse()?, Some(seed.contact().address)).await
}

#[tokio::test]
async fn bootstrap_populates_both_routing_tables() -> anyhow::Result<()> {
    let a = standalone().await?;
    let b = join_via(&a).await?;

    // the join pings A and looks B's own ID up, so both sides meet:
    // B added A as its seed, and A observed B from the inbound traffic
    assert!(b.knows(a.contact().node_id).await, "joiner must know its seed");
    assert!(a.knows(b.contact().node_id).await, "seed must learn the joiner");
    Ok(())
}

#[tokio::test]
async fn store_and_recall_across_two_nodes() -> anyhow::Result<()> {
    let a = standalone().await?;
    let b = join_via(&a).await?;

    let key = b.store(b"hello").await?;
    assert_eq!(
        key.to_hex(),
        "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d",
        "the key is the SHA-1 of the value"
    );

    // store() waits for the STORE acks, so A already holds a replica
    assert_eq!(a.find_value(key).await, Some(b"hello".to_vec()));
    // and the storing node answers from its own copy
    assert_eq!(b.find_value(key).await, Some(b"hello".to_vec()));
    Ok(())
}

#[tokio::test]
async fn remote_value_lookup_caches_at_the_requester() -> anyhow::Result<()> {
    let a = standalone().await?;
    let b = join_via(&a).await?;
    let key = b.store(b"cached far away").await?;

    // C never saw the store; it has to go through the network
    let c = join_via(&a).await?;
    assert!(!c.has_local(key).await);
    assert_eq!(c.find_value(key).await, Some(b"cached far away".to_vec()));
    // a successful remote lookup re-stores at the requester
    assert!(c.has_local(key).await);
    Ok(())
}

#[tokio::test]
async fn lookup_for_an_unknown_key_returns_none() -> anyhow::Result<()> {
    let a = standalone().await?;
    let b = join_via(&a).await?;
    assert_eq!(b.find_value(NodeID::hash_of(b"never stored")).await, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lookups_converge_on_the_true_closest_node() -> anyhow::Result<()> {
    let num_nodes = 25;

    let mut nodes = Vec::with_capacity(num_nodes);
    let seed = standalone().await?;
    nodes.push(seed.clone());
    for _ in 1..num_nodes {
        nodes.push(join_via(&seed).await?);
    }

    for round in 0..5 {
        let target = NodeID::hash_of(format!("convergence-target-{round}"));
        for source in [&nodes[1], &nodes[num_nodes / 2], &nodes[num_nodes - 1]] {
            // the expected winner is the globally closest ID, excluding the
            // source itself, which never appears in its own results
            let expected = nodes
                .iter()
                .map(|n| n.contact().node_id)
                .filter(|id| *id != source.contact().node_id)
                .min_by_key(|id| id.distance(&target))
                .unwrap();

            let found = source.node_lookup(target).await;
            assert!(!found.is_empty());
            assert_eq!(
                found[0].node_id, expected,
                "lookup must surface the closest node in the mesh"
            );
            for pair in found.windows(2) {
                assert!(
                    pair[0].node_id.distance(&target) < pair[1].node_id.distance(&target),
                    "results must come back in ascending distance"
                );
            }
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn values_are_recallable_from_anywhere_in_a_mesh() -> anyhow::Result<()> {
    let num_nodes = 25;

    let mut nodes = Vec::with_capacity(num_nodes);
    let seed = standalone().await?;
    nodes.push(seed.clone());
    for _ in 1..num_nodes {
        nodes.push(join_via(&seed).await?);
    }

    let key = nodes[3].store(b"mesh-value").await?;

    for source in [&nodes[1], &nodes[12], &nodes[num_nodes - 1]] {
        assert_eq!(
            source.find_value(key).await,
            Some(b"mesh-value".to_vec()),
            "every node must be able to recall the value"
        );
    }
    Ok(())
}
