//! Shared test fixtures.
//!
//! The canonical test graph is six blocks wired up as:
//!
//! ```text
//!     A  B  C
//!     \ / \ /
//!      D   E
//!       \ //
//!        F
//! ```
//!
//! A links to D, B has a diamond dependency on F, and E links to F twice.
//! F is a raw leaf; everything else is a dag-pb file node carrying a
//! UnixFS-style payload, so the fixture exercises the same wire formats the
//! default decoder dispatches on.

use std::collections::HashMap;

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use prost::Message;

use grove_kv::Cancel;

use crate::error::{StoreError, StoreResult};
use crate::links::dag_pb::{PbLink, PbNode};
use crate::links::{DAG_PB_CODEC, RAW_CODEC};
use crate::traits::{BlockSource, CounterStore};

/// UnixFS file metadata, the payload a dag-pb file node carries.
#[derive(Clone, PartialEq, ::prost::Message)]
struct FileData {
    /// 2 is the `File` data type.
    #[prost(int32, required, tag = "1")]
    kind: i32,
    #[prost(uint64, optional, tag = "3")]
    filesize: Option<u64>,
    #[prost(uint64, repeated, packed = "false", tag = "4")]
    blocksizes: Vec<u64>,
}

/// One fixture block with its derived sizes.
pub(crate) struct TestNode {
    pub cid: Cid,
    pub data: Vec<u8>,
    /// Cumulative subgraph size, counting shared children once per link.
    pub total: u64,
    /// Logical file size, the figure carried in the UnixFS payload.
    pub file_size: u64,
}

fn raw_node(payload: &[u8]) -> TestNode {
    let cid = Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(payload));
    TestNode {
        cid,
        data: payload.to_vec(),
        total: payload.len() as u64,
        file_size: payload.len() as u64,
    }
}

fn file_node(children: &[&TestNode]) -> TestNode {
    let file_size = children.iter().map(|c| c.file_size).sum();
    let payload = FileData {
        kind: 2,
        filesize: Some(file_size),
        blocksizes: children.iter().map(|c| c.file_size).collect(),
    };
    let node = PbNode {
        data: Some(payload.encode_to_vec()),
        links: children
            .iter()
            .map(|c| PbLink {
                hash: Some(c.cid.to_bytes()),
                name: Some(String::new()),
                tsize: Some(c.total),
            })
            .collect(),
    };
    let data = node.encode_to_vec();
    let cid = Cid::new_v1(DAG_PB_CODEC, Code::Sha2_256.digest(&data));
    let total = data.len() as u64 + children.iter().map(|c| c.total).sum::<u64>();
    TestNode {
        cid,
        data,
        total,
        file_size,
    }
}

/// The six-block graph in index order A, B, C, D, E, F.
pub(crate) struct TestDag {
    pub nodes: Vec<TestNode>,
    pub source: MapSource,
}

impl TestDag {
    pub fn cid(&self, index: usize) -> Cid {
        self.nodes[index].cid
    }

    pub fn cids(&self) -> Vec<Cid> {
        self.nodes.iter().map(|n| n.cid).collect()
    }
}

/// Build the canonical six-block graph.
pub(crate) fn setup() -> TestDag {
    let f = raw_node(b"Hello World!");
    let d = file_node(&[&f]);
    let e = file_node(&[&f, &f]);
    let a = file_node(&[&d]);
    let b = file_node(&[&d, &e]);
    let c = file_node(&[&e]);

    let nodes = vec![a, b, c, d, e, f];
    let source = MapSource::from_nodes(&nodes);
    TestDag { nodes, source }
}

/// A block source backed by a map, the test stand-in for a remote fetcher.
#[derive(Clone, Default)]
pub(crate) struct MapSource {
    blocks: HashMap<Cid, Vec<u8>>,
}

impl MapSource {
    pub fn from_nodes(nodes: &[TestNode]) -> Self {
        Self {
            blocks: nodes.iter().map(|n| (n.cid, n.data.clone())).collect(),
        }
    }

    pub fn single(id: Cid, data: Vec<u8>) -> Self {
        Self {
            blocks: HashMap::from([(id, data)]),
        }
    }

    pub fn remove(&mut self, id: &Cid) {
        self.blocks.remove(id);
    }
}

impl BlockSource for MapSource {
    fn get_block(&self, _cancel: &Cancel, id: &Cid) -> StoreResult<Vec<u8>> {
        self.blocks.get(id).cloned().ok_or(StoreError::Source {
            cid: *id,
            reason: "not in test source".into(),
        })
    }
}

/// Assert every node's visible count matches `expected` (A..F order).
pub(crate) fn check_counts<S: CounterStore>(store: &S, dag: &TestDag, expected: &[i64; 6]) {
    let cancel = Cancel::new();
    for (index, want) in expected.iter().enumerate() {
        let got = store.get_count(&cancel, &dag.cid(index)).unwrap();
        assert_eq!(got, *want, "count mismatch at index {index}");
    }
}

/// Assert the keys iterator yields exactly `expected` (in any order).
pub(crate) fn check_full_store<S: CounterStore>(store: &S, expected: &[Cid]) {
    let mut found: Vec<Cid> = store
        .cid_keys("")
        .unwrap()
        .collect::<StoreResult<_>>()
        .unwrap();
    let mut expected = expected.to_vec();
    found.sort();
    expected.sort();
    assert_eq!(found, expected, "stored data records");
}
