use rand::Rng;
use vlog::{
    flat, hash_roots, Batch, BlockProof, Error, FlatNodeStore, HashProof, InMemoryNodeStore,
    MemoryStorage, MerkleTree, Node, NodeStore, Proof, ProofRequest, UpgradeProof,
};

type Tree = MerkleTree<InMemoryNodeStore>;

fn block(i: u64) -> Vec<u8> {
    format!("#{i}").into_bytes()
}

fn create(length: u64) -> Tree {
    let mut tree = MerkleTree::new(InMemoryNodeStore::new());
    append(&mut tree, (0..length).map(block));
    tree
}

fn append(tree: &mut Tree, blocks: impl IntoIterator<Item = Vec<u8>>) {
    let mut batch = tree.batch();
    for b in blocks {
        batch.append(&b);
    }
    batch.commit(tree).unwrap();
}

/// A tree sharing the first `shared` blocks with `create`, then moved to
/// fork 1 and grown to `length` with different blocks.
fn create_fork(shared: u64, length: u64) -> Tree {
    let mut tree = create(shared);
    let batch = tree.truncate(shared, 1).unwrap();
    batch.commit(&mut tree).unwrap();
    append(&mut tree, (shared..length).map(|i| format!("fork-{i}").into_bytes()));
    tree
}

fn indexes(nodes: &[vlog::Node]) -> Vec<u64> {
    nodes.iter().map(|n| n.index).collect()
}

/// Roots sit where the flat tree puts them and every stored parent hashes
/// its stored children.
fn audit(tree: &Tree) -> bool {
    fn check(tree: &Tree, node: &Node) -> bool {
        let Some((l, r)) = flat::children(node.index) else {
            return true;
        };
        match (tree.get_optional(l).unwrap(), tree.get_optional(r).unwrap()) {
            (Some(left), Some(right)) => {
                vlog::hash_parent(&left, &right) == node.hash
                    && check(tree, &left)
                    && check(tree, &right)
            }
            (None, None) => true,
            _ => false,
        }
    }

    indexes(tree.roots()) == flat::full_roots(2 * tree.length())
        && tree.roots().iter().all(|root| check(tree, root))
}

fn junk(index: u64) -> Node {
    Node::new(index, 1, [0u8; 32])
}

fn with_value(mut proof: Proof, value: Vec<u8>) -> Proof {
    if let Some(b) = proof.block.as_mut() {
        b.value = Some(value);
    }
    proof
}

#[test]
fn test_nodes() {
    let tree = create(8);
    assert_eq!(tree.length(), 8);
    assert_eq!(tree.byte_length(), 16);
    assert_eq!(indexes(tree.roots()), vec![7]);

    let root = tree.get(7).unwrap();
    assert_eq!(root.size, 16);
    assert_eq!(tree.get(3).unwrap().size, 8);
    assert!(matches!(tree.get(17), Err(Error::MissingNode(17))));
}

#[test]
fn test_proof_only_block() {
    let tree = create(10);

    let proof = tree.proof(&ProofRequest::block(4, 2)).unwrap();

    assert!(proof.upgrade.is_none());
    assert!(proof.seek.is_none());
    let block = proof.block.unwrap();
    assert_eq!(block.index, 4);
    assert_eq!(indexes(&block.nodes), vec![10, 13]);
}

#[test]
fn test_proof_with_upgrade() {
    let tree = create(10);

    let proof = tree
        .proof(&ProofRequest::block(4, 0).with_upgrade(0, 10))
        .unwrap();

    let block = proof.block.unwrap();
    assert_eq!(indexes(&block.nodes), vec![10, 13, 3]);

    let upgrade = proof.upgrade.unwrap();
    assert_eq!(upgrade.start, 0);
    assert_eq!(upgrade.length, 10);
    assert_eq!(indexes(&upgrade.nodes), vec![17]);
    assert!(upgrade.additional_nodes.is_empty());
}

#[test]
fn test_proof_with_upgrade_and_additional() {
    let tree = create(10);

    let proof = tree.proof(&ProofRequest::upgrade(0, 8)).unwrap();

    let upgrade = proof.upgrade.unwrap();
    assert_eq!(indexes(&upgrade.nodes), vec![7]);
    assert_eq!(indexes(&upgrade.additional_nodes), vec![17]);
}

#[test]
fn test_proof_with_upgrade_from_existing_state() {
    let tree = create(10);

    let proof = tree
        .proof(&ProofRequest::block(1, 0).with_upgrade(1, 9))
        .unwrap();

    assert!(proof.block.unwrap().nodes.is_empty());
    let upgrade = proof.upgrade.unwrap();
    assert_eq!(indexes(&upgrade.nodes), vec![5, 11, 17]);
    assert!(upgrade.additional_nodes.is_empty());
}

#[test]
fn test_proof_with_upgrade_from_existing_state_and_additional() {
    let tree = create(10);

    let proof = tree
        .proof(&ProofRequest::block(1, 0).with_upgrade(1, 5))
        .unwrap();

    assert!(proof.block.unwrap().nodes.is_empty());
    let upgrade = proof.upgrade.unwrap();
    assert_eq!(indexes(&upgrade.nodes), vec![5, 9]);
    assert_eq!(indexes(&upgrade.additional_nodes), vec![13, 17]);
}

#[test]
fn test_proof_block_and_seek() {
    let tree = create(10);

    let proof = tree
        .proof(&ProofRequest::block(4, 2).with_seek(13))
        .unwrap();

    let seek = proof.seek.unwrap();
    assert_eq!(seek.bytes, 13);
    assert_eq!(indexes(&seek.nodes), vec![12, 14]);
    assert_eq!(indexes(&proof.block.unwrap().nodes), vec![10]);
}

#[test]
fn test_proof_seek_with_upgrade() {
    let tree = create(10);

    let proof = tree
        .proof(&ProofRequest::upgrade(0, 10).with_seek(13))
        .unwrap();

    assert_eq!(indexes(&proof.seek.unwrap().nodes), vec![12, 14, 9, 3]);
    assert_eq!(indexes(&proof.upgrade.unwrap().nodes), vec![17]);
}

#[test]
fn test_proof_hash_includes_node() {
    let tree = create(10);

    let proof = tree.proof(&ProofRequest::hash(8, 2)).unwrap();

    assert!(proof.block.is_none());
    assert_eq!(indexes(&proof.hash.unwrap().nodes), vec![8, 10, 13]);
}

#[test]
fn test_proof_rejects_seek_inside_upgrade() {
    let tree = create(10);

    let err = tree
        .proof(&ProofRequest::block(6, 0).with_seek(13).with_upgrade(2, 8))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
}

#[test]
fn test_proof_rejects_out_of_bounds() {
    let tree = create(4);

    assert!(tree.proof(&ProofRequest::upgrade(0, 5)).is_err());
    assert!(tree.proof(&ProofRequest::upgrade(2, 0)).is_err());
    assert!(tree.proof(&ProofRequest::block(4, 0)).is_err());
}

#[test]
fn test_verify_proof_with_upgrade() {
    let tree = create(10);
    let mut clone = create(0);

    let proof = tree
        .proof(&ProofRequest::block(4, 0).with_upgrade(0, 10))
        .unwrap();
    let proof = with_value(proof, block(4));

    let batch = clone.verify(&proof).unwrap();
    assert!(batch.is_upgraded());
    batch.commit(&mut clone).unwrap();

    assert_eq!(clone.length(), tree.length());
    assert_eq!(clone.byte_length(), tree.byte_length());
    assert_eq!(clone.hash(), tree.hash());
    assert_eq!(clone.get(8).unwrap(), tree.get(8).unwrap());
}

#[test]
fn test_verify_proof_from_existing_state() {
    let tree = create(10);
    let mut clone = create(1);

    let proof = tree
        .proof(&ProofRequest::block(1, 0).with_upgrade(1, 5))
        .unwrap();
    let proof = with_value(proof, block(1));

    let batch = clone.verify(&proof).unwrap();
    // Additional nodes carry the verifier past the signed upgrade.
    assert_eq!(batch.length(), 10);
    batch.commit(&mut clone).unwrap();

    assert_eq!(clone.length(), 10);
    assert_eq!(clone.hash(), tree.hash());
    assert_eq!(clone.get(2).unwrap(), tree.get(2).unwrap());
}

#[test]
fn test_verify_block_against_local_root() {
    let tree = create(10);
    let mut clone = create(0);

    let upgrade = tree.proof(&ProofRequest::upgrade(0, 10)).unwrap();
    clone.verify(&upgrade).unwrap().commit(&mut clone).unwrap();

    // Nodes missing below a trusted root are accepted.
    let proof = tree.proof(&ProofRequest::block(3, 3)).unwrap();
    assert_eq!(indexes(&proof.block.as_ref().unwrap().nodes), vec![4, 1, 11]);
    let batch = clone.verify(&with_value(proof, block(3))).unwrap();
    assert!(!batch.is_upgraded());
    batch.commit(&mut clone).unwrap();
    assert_eq!(clone.get(6).unwrap(), tree.get(6).unwrap());

    // A wrong value hashes to a different root.
    let proof = tree.proof(&ProofRequest::block(5, 3)).unwrap();
    let err = clone.verify(&with_value(proof, b"evil".to_vec())).unwrap_err();
    assert_eq!(err, Error::HashMismatch { index: 7 });
}

#[test]
fn test_verify_rejects_missing_value_and_bad_upgrade() {
    let tree = create(10);
    let clone = create(0);

    let proof = tree
        .proof(&ProofRequest::block(4, 0).with_upgrade(0, 10))
        .unwrap();
    assert!(matches!(
        clone.verify(&proof),
        Err(Error::InsufficientProof(_))
    ));

    let mut proof = tree.proof(&ProofRequest::upgrade(0, 10)).unwrap();
    proof.upgrade.as_mut().unwrap().nodes.pop();
    assert!(matches!(
        clone.verify(&proof),
        Err(Error::InsufficientProof(_))
    ));
}

#[test]
fn test_verify_seek_proof() {
    let tree = create(10);
    let mut clone = create(0);

    let proof = tree
        .proof(&ProofRequest::upgrade(0, 10).with_seek(13))
        .unwrap();
    clone.verify(&proof).unwrap().commit(&mut clone).unwrap();

    assert_eq!(clone.hash(), tree.hash());
    assert_eq!(clone.get(12).unwrap(), tree.get(12).unwrap());
}

#[test]
fn test_upgrade_when_no_roots_need_upgrade() {
    let mut tree = create(4);
    let mut clone = create(0);

    let proof = tree.proof(&ProofRequest::upgrade(0, 4)).unwrap();
    clone.verify(&proof).unwrap().commit(&mut clone).unwrap();

    append(&mut tree, [b"#5".to_vec()]);

    let proof = tree.proof(&ProofRequest::upgrade(4, 1)).unwrap();
    clone.verify(&proof).unwrap().commit(&mut clone).unwrap();

    assert_eq!(tree.length(), 5);
    assert_eq!(clone.length(), 5);
    assert_eq!(clone.hash(), tree.hash());
}

#[test]
fn test_verify_rejects_out_of_range_indices() {
    let tree = create(10);

    let hash = Proof {
        hash: Some(HashProof {
            index: u64::MAX,
            nodes: vec![junk(u64::MAX)],
        }),
        ..Default::default()
    };
    assert!(matches!(tree.verify(&hash), Err(Error::InsufficientProof(_))));

    let block = Proof {
        block: Some(BlockProof {
            index: u64::MAX,
            value: Some(b"x".to_vec()),
            nodes: vec![],
        }),
        ..Default::default()
    };
    assert!(matches!(tree.verify(&block), Err(Error::InsufficientProof(_))));

    // Uncles climbing past any reachable depth.
    let mut nodes = vec![junk(0)];
    nodes.extend((0..70u32).map(|depth| {
        let right = 1u64
            .checked_shl(depth)
            .and_then(|factor| factor.checked_mul(3));
        junk(right.map_or(u64::MAX, |i| i - 1))
    }));
    let deep = Proof {
        hash: Some(HashProof { index: 0, nodes }),
        ..Default::default()
    };
    assert!(matches!(tree.verify(&deep), Err(Error::InsufficientProof(_))));

    let upgrade = Proof {
        upgrade: Some(UpgradeProof {
            start: 10,
            length: u64::MAX,
            nodes: vec![],
            additional_nodes: vec![junk(u64::MAX - 1)],
            signature: None,
        }),
        ..Default::default()
    };
    assert!(matches!(tree.verify(&upgrade), Err(Error::InsufficientProof(_))));
    assert!(tree.reorg(&upgrade).is_err());
}

#[test]
fn test_proof_rejects_out_of_range_requests() {
    let tree = create(10);

    for request in [
        ProofRequest::block(u64::MAX, 0),
        ProofRequest::block(u64::MAX / 2, 0),
        ProofRequest::hash(u64::MAX, 0),
        ProofRequest::upgrade(1, u64::MAX),
        ProofRequest::block(0, 0).with_upgrade(u64::MAX, 1),
    ] {
        assert!(matches!(
            tree.proof(&request),
            Err(Error::InvalidOperation(_))
        ));
    }
}

#[test]
fn test_upgradeable() {
    let tree = create(5);
    let mut clone = create(0);

    let proof = tree.proof(&ProofRequest::upgrade(0, 5)).unwrap();
    clone.verify(&proof).unwrap().commit(&mut clone).unwrap();

    for length in [0, 4, 5] {
        assert!(clone.upgradeable(length).unwrap(), "{length} should be upgradeable");
    }
    for length in [1, 2, 3] {
        assert!(!clone.upgradeable(length).unwrap(), "{length} should not be upgradeable");
    }
    assert!(!clone.upgradeable(6).unwrap());
}

#[test]
fn test_missing_nodes() {
    let tree = create(10);
    let mut clone = create(0);

    let proof = tree.proof(&ProofRequest::upgrade(0, 10)).unwrap();
    clone.verify(&proof).unwrap().commit(&mut clone).unwrap();

    // Clone holds the roots [7, 17] only.
    assert_eq!(clone.missing_nodes(8).unwrap(), 3);
    assert_eq!(clone.missing_nodes(16).unwrap(), 1);
    assert_eq!(tree.missing_nodes(8).unwrap(), 0);
}

#[test]
fn test_get_roots() {
    let tree = create(10);

    let roots = tree.get_roots(5).unwrap();
    assert_eq!(indexes(&roots), vec![3, 8]);
    assert_eq!(hash_roots(&roots), create(5).hash());
}

#[test]
fn test_hash_is_stable_across_batches() {
    let a = create(10);

    let mut b = create(0);
    for i in 0..10 {
        append(&mut b, [block(i)]);
    }

    assert_eq!(a.hash(), b.hash());
    assert_eq!(a.roots(), b.roots());
    assert_ne!(a.hash(), create(9).hash());
}

#[test]
fn test_empty_batch_is_a_no_op() {
    let mut tree = create(0);
    let empty = hex::encode(tree.hash());
    tree.batch().commit(&mut tree).unwrap();
    assert_eq!(hex::encode(tree.hash()), empty);
    assert_eq!(hex::encode(create(0).hash()), empty);

    let mut tree = create(5);
    let before = hex::encode(tree.hash());
    tree.batch().commit(&mut tree).unwrap();
    assert_eq!(hex::encode(tree.hash()), before);
    assert_eq!(tree.length(), 5);
}

#[test]
fn test_random_history_matches_fresh_build() {
    let mut rng = rand::thread_rng();
    let mut tree = create(0);
    let mut reference: Vec<Vec<u8>> = Vec::new();

    for _ in 0..60 {
        if !reference.is_empty() && rng.gen_bool(0.2) {
            let length = rng.gen_range(0..reference.len());
            let fork = tree.fork() + 1;
            tree.truncate(length as u64, fork)
                .unwrap()
                .commit(&mut tree)
                .unwrap();
            reference.truncate(length);
        } else {
            let count = rng.gen_range(1..5);
            let blocks: Vec<Vec<u8>> = (0..count)
                .map(|_| {
                    let len = rng.gen_range(1..16);
                    (0..len).map(|_| rng.gen()).collect()
                })
                .collect();
            append(&mut tree, blocks.clone());
            reference.extend(blocks);
        }

        let mut fresh = create(0);
        append(&mut fresh, reference.clone());
        assert_eq!(tree.length(), reference.len() as u64);
        assert_eq!(tree.byte_length(), fresh.byte_length());
        assert_eq!(tree.roots(), fresh.roots());
        assert_eq!(hex::encode(tree.hash()), hex::encode(fresh.hash()));
    }
}

#[test]
fn test_batch_hash_matches_commit() {
    let mut tree = create(3);
    let mut batch: Batch = tree.batch();
    batch.append(b"x");
    let staged = batch.hash();
    let signable = batch.signable();

    batch.commit(&mut tree).unwrap();
    assert_eq!(tree.hash(), staged);
    assert_eq!(tree.signable(), signable);
}

#[test]
fn test_byte_offsets_and_ranges() {
    let mut tree = create(0);
    append(
        &mut tree,
        ["a", "bb", "ccc", "dddd", "eeeee"].iter().map(|s| s.as_bytes().to_vec()),
    );

    assert_eq!(tree.byte_offset(0).unwrap(), 0);
    assert_eq!(tree.byte_offset(3).unwrap(), 6);
    assert_eq!(tree.byte_offset(5).unwrap(), 15);
    assert_eq!(tree.byte_range(2).unwrap(), (3, 3));
    assert_eq!(tree.byte_range(4).unwrap(), (10, 5));
    assert!(tree.byte_range(5).is_err());
}

#[test]
fn test_seek_matches_linear_scan() {
    let mut tree = create(0);
    let sizes: Vec<usize> = (0..13).map(|i| 1 + (i * 7) % 5).collect();
    append(&mut tree, sizes.iter().map(|s| vec![0u8; *s]));

    let mut bytes = 0u64;
    for (i, size) in sizes.iter().enumerate() {
        for offset in 0..*size as u64 {
            if bytes + offset == 0 {
                continue;
            }
            assert_eq!(
                tree.seek(bytes + offset).unwrap(),
                (i as u64, offset),
                "seek to {}",
                bytes + offset
            );
        }
        bytes += *size as u64;
    }

    assert!(tree.seek(bytes + 1).is_err());
}

#[test]
fn test_truncate_and_reappend() {
    let mut tree = create(10);
    let original = tree.hash();

    let batch = tree.truncate(5, 1).unwrap();
    assert_eq!(batch.ancestors(), 5);
    batch.commit(&mut tree).unwrap();

    assert_eq!(tree.length(), 5);
    assert_eq!(tree.fork(), 1);
    assert_eq!(tree.hash(), create(5).hash());
    assert!(tree.get_optional(17).unwrap().is_none());
    assert!(tree.get_optional(7).unwrap().is_none());
    assert!(tree.get_optional(8).unwrap().is_some());

    append(&mut tree, (5..10).map(block));
    assert_eq!(tree.hash(), original);
}

#[test]
fn test_truncate_survives_flush() {
    let store = InMemoryNodeStore::new();
    let mut tree = MerkleTree::new(store.clone());
    append(&mut tree, (0..10).map(block));
    tree.flush().unwrap();

    tree.truncate(3, 1).unwrap().commit(&mut tree).unwrap();
    tree.flush().unwrap();

    assert!(store.get(7).unwrap().is_none());
    assert!(store.get(3).unwrap().is_none());
    assert!(store.get(1).unwrap().is_some());
    assert!(store.get(4).unwrap().is_some());

    let reopened = MerkleTree::open(store, 3, 1, None).unwrap();
    assert_eq!(reopened.hash(), tree.hash());
}

#[test]
fn test_commit_refused_when_tree_moved() {
    let mut tree = create(4);

    let mut a = tree.batch();
    a.append(b"a");
    let mut b = tree.batch();
    b.append(b"b");

    a.commit(&mut tree).unwrap();
    assert!(matches!(b.commit(&mut tree), Err(Error::InvalidOperation(_))));

    let stale = tree.truncate(2, 1).unwrap();
    tree.truncate(3, 1).unwrap().commit(&mut tree).unwrap();
    assert!(!stale.commitable(&tree));
}

#[test]
fn test_open_requires_roots() {
    let store = InMemoryNodeStore::new();
    let mut tree = MerkleTree::new(store.clone());
    append(&mut tree, (0..4).map(block));
    tree.flush().unwrap();

    assert!(MerkleTree::open(store.clone(), 4, 0, None).is_ok());
    assert!(matches!(
        MerkleTree::open(store, 5, 0, None),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn test_flat_node_store_round_trips_tree() {
    let storage = MemoryStorage::new();
    let mut tree = MerkleTree::new(FlatNodeStore::new(storage.clone()));
    let mut batch = tree.batch();
    for i in 0..7 {
        batch.append(&block(i));
    }
    batch.commit(&mut tree).unwrap();
    tree.flush().unwrap();

    let reopened = MerkleTree::open(FlatNodeStore::new(storage.clone()), 7, 0, None).unwrap();
    assert_eq!(reopened.hash(), tree.hash());
    assert_eq!(reopened.get(9).unwrap(), tree.get(9).unwrap());

    tree.truncate(4, 1).unwrap().commit(&mut tree).unwrap();
    tree.flush().unwrap();

    let store = FlatNodeStore::new(storage);
    assert!(store.get(3).unwrap().is_some());
    assert!(store.get(7).unwrap().is_none());
    assert!(store.get(9).unwrap().is_none());
}

#[test]
fn test_clear() {
    let mut tree = create(10);
    tree.flush().unwrap();
    tree.clear().unwrap();

    assert_eq!(tree.length(), 0);
    assert_eq!(tree.byte_length(), 0);
    assert!(tree.roots().is_empty());
    assert!(tree.get_optional(0).unwrap().is_none());
}

#[test]
fn test_audit_roots_rebuild_from_leaves() {
    let tree = create(11);

    for root in tree.roots() {
        let (left, right) = flat::spans(root.index);
        let mut level: Vec<vlog::Node> = (left..=right)
            .step_by(2)
            .map(|i| tree.get(i).unwrap())
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let parent = tree.get(flat::parent(pair[0].index)).unwrap();
                    assert_eq!(parent.hash, vlog::hash_parent(&pair[0], &pair[1]));
                    assert_eq!(parent.size, pair[0].size + pair[1].size);
                    parent
                })
                .collect();
        }

        assert_eq!(&level[0], root);
    }
}

mod reorg {
    use super::*;

    fn resolve(local: &Tree, remote: &Tree) -> vlog::ReorgBatch {
        let proof = remote
            .proof(&ProofRequest::upgrade(0, remote.length()))
            .unwrap();
        let mut reorg = local.reorg(&proof).unwrap();

        while let Some(request) = reorg.request() {
            let proof = remote.proof(&request).unwrap();
            reorg.update(local, &proof).unwrap();
        }
        reorg
    }

    #[test]
    fn test_reorg_simple() {
        let mut local = create(10);
        let remote = create_fork(5, 10);

        let reorg = resolve(&local, &remote);
        assert!(reorg.finished());
        assert_eq!(reorg.ancestors(), 5);
        assert_eq!(reorg.fork(), 1);

        reorg.commit(&mut local).unwrap();
        assert_eq!(local.length(), 10);
        assert_eq!(local.fork(), 1);
        assert_eq!(local.hash(), remote.hash());
        assert_eq!(local.get(17).unwrap(), remote.get(17).unwrap());
        assert!(local.get_optional(18).unwrap().is_none());
    }

    /// Two trees of equal length on fork 0 whose last block differs.
    fn diverged(extra: u64) -> (Tree, Tree) {
        let mut local = create(5);
        let mut remote = create(5);
        append(&mut local, [b"fork #2".to_vec()]);
        append(&mut remote, [b"fork #1".to_vec()]);
        append(&mut local, (0..extra).map(block));
        append(&mut remote, (0..extra).map(block));
        (local, remote)
    }

    #[test]
    fn test_reorg_divergent_tip() {
        let (mut local, remote) = diverged(0);

        let reorg = resolve(&local, &remote);
        assert_eq!(reorg.ancestors(), 5);

        reorg.commit(&mut local).unwrap();
        assert_eq!(local.length(), remote.length());
        assert_eq!(local.hash(), remote.hash());
    }

    #[test]
    fn test_reorg_long_fork() {
        let (mut local, remote) = diverged(100);
        assert_eq!(local.length(), 106);

        let reorg = resolve(&local, &remote);
        assert_eq!(reorg.ancestors(), 5);

        reorg.commit(&mut local).unwrap();
        assert_eq!(local.length(), remote.length());
        assert_eq!(local.hash(), remote.hash());

        assert!(audit(&local));
        local.flush().unwrap();
        assert!(audit(&local));
    }

    #[test]
    fn test_reorg_rejects_out_of_range_update() {
        let (local, remote) = diverged(0);
        let proof = remote.proof(&ProofRequest::upgrade(0, 6)).unwrap();
        let mut reorg = local.reorg(&proof).unwrap();
        assert!(!reorg.finished());

        let hostile = Proof {
            hash: Some(HashProof {
                index: u64::MAX,
                nodes: vec![junk(u64::MAX)],
            }),
            ..Default::default()
        };
        assert!(matches!(
            reorg.update(&local, &hostile),
            Err(Error::InsufficientProof(_))
        ));
        assert!(!reorg.finished());
    }

    #[test]
    fn test_reorg_small_gap() {
        let mut local = create(10);
        let remote = create_fork(8, 10);

        let reorg = resolve(&local, &remote);
        assert_eq!(reorg.ancestors(), 8);

        reorg.commit(&mut local).unwrap();
        assert_eq!(local.hash(), remote.hash());
    }

    #[test]
    fn test_reorg_bigger_gap() {
        let mut local = create(20);
        let remote = create_fork(1, 20);

        let reorg = resolve(&local, &remote);
        assert_eq!(reorg.ancestors(), 1);

        reorg.commit(&mut local).unwrap();
        assert_eq!(local.hash(), remote.hash());
    }

    #[test]
    fn test_reorg_remote_shorter() {
        let mut local = create(10);
        let remote = create_fork(5, 5);

        let proof = remote.proof(&ProofRequest::upgrade(0, 5)).unwrap();
        let reorg = local.reorg(&proof).unwrap();
        assert!(reorg.finished());
        assert_eq!(reorg.ancestors(), 5);

        reorg.commit(&mut local).unwrap();
        assert_eq!(local.length(), 5);
        assert_eq!(local.fork(), 1);
        assert_eq!(local.hash(), remote.hash());
    }

    #[test]
    fn test_reorg_want_range() {
        let local = create(10);
        let remote = create_fork(5, 10);

        let proof = remote.proof(&ProofRequest::upgrade(0, 10)).unwrap();
        let reorg = local.reorg(&proof).unwrap();

        let want = reorg.want().unwrap();
        assert_eq!((want.nodes, want.start, want.end), (3, 0, 8));
        let request = reorg.request().unwrap();
        assert_eq!(request.hash.unwrap().index, 14);
    }

    #[test]
    fn test_reorg_rejects_unrelated_update() {
        let local = create(10);
        let remote = create_fork(5, 10);

        let proof = remote.proof(&ProofRequest::upgrade(0, 10)).unwrap();
        let mut reorg = local.reorg(&proof).unwrap();

        let other = create_fork(2, 10);
        let bogus = other.proof(&reorg.request().unwrap()).unwrap();
        assert!(reorg.update(&local, &bogus).is_err());
    }
}
