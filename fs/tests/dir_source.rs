//! Directory source scenarios: flattening, integrity, cancellation.

use std::os::unix::fs::symlink;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use casfs_castore::{sri, Algorithm, Error, NodeKind, Source, Tree};
use casfs_fs::dir::DirSourceBuilder;

const HELLO_SRI: &str = "sha256-WJG1tSLV3whtD/CxEPvZ0hu0/HFjrzTQgoai6Eb2vgM=";

/// `/x/{a.txt="hello\n", b/c.txt="hello\n", link -> a.txt}`
fn scenario_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();
    std::fs::create_dir(dir.path().join("b")).unwrap();
    std::fs::write(dir.path().join("b/c.txt"), b"hello\n").unwrap();
    symlink("a.txt", dir.path().join("link")).unwrap();
    dir
}

#[tokio::test]
async fn emits_preorder_sorted_nodes_with_shared_digests() {
    let dir = scenario_tree();
    let mut source = DirSourceBuilder::new(dir.path().to_str().unwrap())
        .build_source()
        .unwrap();
    let tree = Tree::from_source(&mut source).await.unwrap();

    let names: Vec<&str> = tree.stats().map(|stat| stat.name.as_str()).collect();
    assert_eq!(names, vec!["/", "/a.txt", "/b", "/b/c.txt", "/link"]);

    let kinds: Vec<NodeKind> = tree.stats().map(|stat| stat.kind).collect();
    assert_eq!(
        kinds,
        vec![
            NodeKind::Directory,
            NodeKind::Regular,
            NodeKind::Directory,
            NodeKind::Regular,
            NodeKind::Symlink,
        ]
    );

    // identical contents share one digest.
    assert_eq!(tree.nodes[1].stat.payload, HELLO_SRI);
    assert_eq!(tree.nodes[3].stat.payload, HELLO_SRI);

    // symlink target is preserved verbatim.
    assert_eq!(tree.nodes[4].stat.payload, "a.txt");
    assert_eq!(tree.nodes[4].stat.size, 0);

    source.close_wait().await.unwrap();
}

#[tokio::test]
async fn regular_node_contents_hash_to_their_payload() {
    let dir = scenario_tree();
    let mut source = DirSourceBuilder::new(dir.path().to_str().unwrap())
        .build_source()
        .unwrap();
    let tree = Tree::from_source(&mut source).await.unwrap();

    for node in &tree.nodes {
        if node.stat.kind != NodeKind::Regular {
            continue;
        }
        let mut reader = node.open().await.unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();

        let computed = sri::hash_reader(Algorithm::Sha256, contents.as_slice())
            .await
            .unwrap();
        assert_eq!(computed.to_string(), node.stat.payload);
    }

    source.close_wait().await.unwrap();
}

#[tokio::test]
async fn open_serves_visited_content_by_digest() {
    let dir = scenario_tree();
    let mut source = DirSourceBuilder::new(dir.path().to_str().unwrap())
        .build_source()
        .unwrap();
    let _tree = Tree::from_source(&mut source).await.unwrap();

    let digest = HELLO_SRI.parse().unwrap();
    let mut reader = casfs_castore::CasReader::open(&source, &digest)
        .await
        .unwrap();
    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).await.unwrap();
    assert_eq!(&contents, b"hello\n");

    let unknown = sri::hash_reader(Algorithm::Sha256, &b"unknown"[..])
        .await
        .unwrap();
    assert!(matches!(
        casfs_castore::CasReader::open(&source, &unknown).await,
        Err(Error::NotFound(_))
    ));

    source.close_wait().await.unwrap();
}

#[tokio::test]
async fn keep_prefix_keeps_absolute_names() {
    let dir = scenario_tree();
    let prefix = dir.path().to_str().unwrap().to_string();
    let mut source = DirSourceBuilder::new(&prefix)
        .with_keep_prefix(true)
        .build_source()
        .unwrap();
    let tree = Tree::from_source(&mut source).await.unwrap();

    for stat in tree.stats() {
        assert!(
            stat.name.starts_with(&prefix),
            "{} should keep prefix {}",
            stat.name,
            prefix
        );
    }

    source.close_wait().await.unwrap();
}

#[tokio::test]
async fn trailing_slash_on_dir_changes_nothing() {
    let dir = scenario_tree();
    let plain = dir.path().to_str().unwrap().to_string();
    let slashed = format!("{plain}/");

    let mut names = Vec::new();
    for configured in [plain, slashed] {
        let mut source = DirSourceBuilder::new(&configured).build_source().unwrap();
        let tree = Tree::from_source(&mut source).await.unwrap();
        names.push(
            tree.stats()
                .map(|stat| stat.name.clone())
                .collect::<Vec<_>>(),
        );
        source.close_wait().await.unwrap();
    }
    assert_eq!(names[0], names[1]);
}

#[tokio::test]
async fn json_listing_has_stable_fields() {
    let dir = scenario_tree();
    let mut source = DirSourceBuilder::new(dir.path().to_str().unwrap())
        .build_source()
        .unwrap();
    let tree = Tree::from_source(&mut source).await.unwrap();

    let value = serde_json::to_value(tree.stats().collect::<Vec<_>>()).unwrap();
    let records = value.as_array().unwrap();
    assert_eq!(records.len(), 5);

    let a = &records[1];
    assert_eq!(a["name"], "/a.txt");
    assert_eq!(a["kind"], "regular");
    assert_eq!(a["size"], 6);
    assert_eq!(a["payload"], HELLO_SRI);
    for field in ["mtime", "user_id", "group_id", "user_name", "group_name", "mode"] {
        assert!(a.get(field).is_some(), "missing field {field}");
    }
    assert!(a.get("xattrs").is_none());

    source.close_wait().await.unwrap();
}

#[tokio::test]
async fn close_wait_is_idempotent() {
    let dir = scenario_tree();
    let mut source = DirSourceBuilder::new(dir.path().to_str().unwrap())
        .build_source()
        .unwrap();

    source.close_wait().await.unwrap();
    source.close_wait().await.unwrap();
}

#[tokio::test]
async fn cancellation_mid_walk_terminates_promptly() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..500 {
        std::fs::write(dir.path().join(format!("file-{i:04}")), b"data").unwrap();
    }

    let mut source = DirSourceBuilder::new(dir.path().to_str().unwrap())
        .build_source()
        .unwrap();

    let first = source.next().await.expect("root node expected");
    first.unwrap();

    tokio::time::timeout(Duration::from_secs(5), source.close_wait())
        .await
        .expect("close_wait must return in bounded time")
        .unwrap();

    assert!(source.next().await.is_none(), "stream must be closed");
}

#[tokio::test]
async fn missing_dir_surfaces_one_error() {
    let mut source = DirSourceBuilder::new("/nonexistent/casfs-test-path")
        .build_source()
        .unwrap();

    let first = source.next().await.expect("an error record is emitted");
    assert!(first.is_err());
    assert!(source.next().await.is_none());

    source.close_wait().await.unwrap();
}
