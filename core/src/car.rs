//! Record extraction from commit block payloads.
//!
//! A commit's `blocks` field is a CAR v1 archive: a varint-delimited header
//! (`{version: 1, roots: [commit]}`) followed by varint-delimited blocks,
//! each a binary CID then the block body. The commit block links to a merkle
//! search tree whose leaves name record paths; walking it yields the
//! `"{collection}/{rkey}" -> record bytes` mapping the consumer materializes.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, bail};
use ciborium::Value;
use tracing::debug;

use crate::firehose::{as_bytes, as_i64, map_get, require};

/// A raw binary content identifier, used only as a block-store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Cid(Vec<u8>);

/// Recovers record contents from a commit's block payload, keyed by record
/// path. Blocks referenced by the tree but absent from the payload are
/// skipped; an empty payload yields an empty mapping.
pub fn extract_records(blocks: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    if blocks.is_empty() {
        return Ok(HashMap::new());
    }

    let mut input = blocks;
    let header_len = read_uvarint(&mut input).context("reading archive header length")? as usize;
    if header_len > input.len() {
        bail!("truncated archive header");
    }
    let (header_bytes, mut rest) = input.split_at(header_len);
    let header: Value =
        ciborium::de::from_reader(header_bytes).context("decoding archive header")?;
    let version = as_i64(require(&header, "version")?).context("version")?;
    if version != 1 {
        bail!("unsupported archive version {version}");
    }
    let root = require(&header, "roots")?
        .as_array()
        .context("roots is not an array")?
        .first()
        .and_then(link_cid)
        .context("archive has no root")?;

    let mut store: HashMap<Cid, &[u8]> = HashMap::new();
    while !rest.is_empty() {
        let total = read_uvarint(&mut rest).context("reading block length")? as usize;
        if total == 0 || total > rest.len() {
            bail!("truncated block");
        }
        let (block, tail) = rest.split_at(total);
        rest = tail;
        let mut cursor = block;
        let cid = read_cid(&mut cursor)?;
        store.insert(cid, cursor);
    }

    let commit_bytes = store.get(&root).context("root block missing from payload")?;
    let commit: Value = ciborium::de::from_reader(*commit_bytes).context("decoding commit block")?;
    let tree_root = link_cid(require(&commit, "data")?).context("commit has no data link")?;

    let mut leaves: Vec<(String, Cid)> = Vec::new();
    let mut seen = HashSet::new();
    walk_tree(&tree_root, &store, &mut seen, &mut leaves)?;

    let mut records = HashMap::new();
    for (path, cid) in leaves {
        match store.get(&cid) {
            Some(bytes) => {
                records.insert(path, bytes.to_vec());
            }
            None => debug!(path, "record block missing from payload"),
        }
    }
    Ok(records)
}

fn walk_tree(
    cid: &Cid,
    store: &HashMap<Cid, &[u8]>,
    seen: &mut HashSet<Cid>,
    leaves: &mut Vec<(String, Cid)>,
) -> Result<()> {
    if !seen.insert(cid.clone()) {
        bail!("cycle in tree");
    }
    let Some(bytes) = store.get(cid) else {
        // Partial payloads elide subtrees; nothing to recover below here.
        return Ok(());
    };
    let node: Value = ciborium::de::from_reader(*bytes).context("decoding tree node")?;

    if let Some(left) = map_get(&node, "l") {
        if let Some(left) = link_cid(left) {
            walk_tree(&left, store, seen, leaves)?;
        }
    }

    let entries = match map_get(&node, "e") {
        Some(value) => value.as_array().context("entries is not an array")?,
        None => return Ok(()),
    };

    let mut last_key: Vec<u8> = Vec::new();
    for entry in entries {
        let prefix = as_i64(require(entry, "p")?).context("p")? as usize;
        let suffix = as_bytes(require(entry, "k")?).context("k")?;
        if prefix > last_key.len() {
            bail!("entry prefix exceeds previous key");
        }
        last_key.truncate(prefix);
        last_key.extend_from_slice(suffix);

        let value = link_cid(require(entry, "v")?).context("entry has no value link")?;
        let path = String::from_utf8(last_key.clone()).context("record path is not utf-8")?;
        leaves.push((path, value));

        match map_get(entry, "t") {
            Some(Value::Null) | None => {}
            Some(subtree) => {
                if let Some(subtree) = link_cid(subtree) {
                    walk_tree(&subtree, store, seen, leaves)?;
                }
            }
        }
    }
    Ok(())
}

/// A link node is CBOR tag 42 wrapping the CID bytes behind a multibase
/// identity prefix.
fn link_cid(value: &Value) -> Option<Cid> {
    match value {
        Value::Tag(42, inner) => match inner.as_ref() {
            Value::Bytes(bytes) if bytes.first() == Some(&0x00) => Some(Cid(bytes[1..].to_vec())),
            _ => None,
        },
        _ => None,
    }
}

fn read_uvarint(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let Some((&byte, rest)) = buf.split_first() else {
            bail!("truncated varint");
        };
        *buf = rest;
        if shift >= 63 && byte > 1 {
            bail!("varint overflow");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn read_cid(buf: &mut &[u8]) -> Result<Cid> {
    let start = *buf;
    if start.first() == Some(&0x12) {
        // Version 0: bare sha2-256 multihash, fixed 34 bytes.
        if start.len() < 34 {
            bail!("truncated cid");
        }
        let (cid, rest) = start.split_at(34);
        *buf = rest;
        return Ok(Cid(cid.to_vec()));
    }
    let version = read_uvarint(buf).context("cid version")?;
    if version != 1 {
        bail!("unsupported cid version {version}");
    }
    let _codec = read_uvarint(buf).context("cid codec")?;
    let _hash = read_uvarint(buf).context("multihash code")?;
    let digest_len = read_uvarint(buf).context("multihash length")? as usize;
    if digest_len > buf.len() {
        bail!("truncated cid digest");
    }
    *buf = &buf[digest_len..];
    let consumed = start.len() - buf.len();
    Ok(Cid(start[..consumed].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).expect("encode cbor");
        buf
    }

    fn uvarint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    /// CID v1, dag-cbor codec, sha2-256 multihash over an arbitrary digest.
    fn cid(digest: &[u8]) -> Vec<u8> {
        let mut out = vec![0x01, 0x71, 0x12, digest.len() as u8];
        out.extend_from_slice(digest);
        out
    }

    fn link(cid: &[u8]) -> Value {
        let mut bytes = vec![0x00];
        bytes.extend_from_slice(cid);
        Value::Tag(42, Box::new(Value::Bytes(bytes)))
    }

    struct CarBuilder {
        bytes: Vec<u8>,
    }

    impl CarBuilder {
        fn new(root: &[u8]) -> Self {
            let header = encode(&Value::Map(vec![
                (text("version"), Value::Integer(1.into())),
                (text("roots"), Value::Array(vec![link(root)])),
            ]));
            let mut bytes = uvarint(header.len() as u64);
            bytes.extend(header);
            Self { bytes }
        }

        fn block(mut self, cid: &[u8], body: &[u8]) -> Self {
            let total = cid.len() + body.len();
            self.bytes.extend(uvarint(total as u64));
            self.bytes.extend_from_slice(cid);
            self.bytes.extend_from_slice(body);
            self
        }

        fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }

    fn tree_entry(prefix: i64, suffix: &[u8], value: &[u8], subtree: Option<&[u8]>) -> Value {
        let mut fields = vec![
            (text("p"), Value::Integer(prefix.into())),
            (text("k"), Value::Bytes(suffix.to_vec())),
            (text("v"), link(value)),
        ];
        fields.push((
            text("t"),
            subtree.map(link).unwrap_or(Value::Null),
        ));
        Value::Map(fields)
    }

    fn commit_block(tree_root: &[u8]) -> Vec<u8> {
        encode(&Value::Map(vec![
            (text("did"), text("did:plc:abc")),
            (text("version"), Value::Integer(3.into())),
            (text("data"), link(tree_root)),
            (text("rev"), text("r1")),
        ]))
    }

    #[test]
    fn extracts_records_with_prefix_compressed_keys() {
        let commit_cid = cid(b"commit");
        let tree_cid = cid(b"tree");
        let rec1_cid = cid(b"rec1");
        let rec2_cid = cid(b"rec2");

        let tree = encode(&Value::Map(vec![
            (text("l"), Value::Null),
            (
                text("e"),
                Value::Array(vec![
                    tree_entry(0, b"app.bsky.feed.post/k1", &rec1_cid, None),
                    tree_entry(20, b"2", &rec2_cid, None),
                ]),
            ),
        ]));

        let payload = CarBuilder::new(&commit_cid)
            .block(&commit_cid, &commit_block(&tree_cid))
            .block(&tree_cid, &tree)
            .block(&rec1_cid, b"one")
            .block(&rec2_cid, b"two")
            .finish();

        let records = extract_records(&payload).expect("extracts");
        assert_eq!(records.len(), 2);
        assert_eq!(records["app.bsky.feed.post/k1"], b"one");
        assert_eq!(records["app.bsky.feed.post/k2"], b"two");
    }

    #[test]
    fn walks_left_and_entry_subtrees() {
        let commit_cid = cid(b"commit");
        let root_cid = cid(b"root");
        let left_cid = cid(b"left");
        let sub_cid = cid(b"sub");
        let rec_a = cid(b"a");
        let rec_b = cid(b"b");
        let rec_c = cid(b"c");

        let left = encode(&Value::Map(vec![(
            text("e"),
            Value::Array(vec![tree_entry(0, b"col/a", &rec_a, None)]),
        )]));
        let sub = encode(&Value::Map(vec![(
            text("e"),
            Value::Array(vec![tree_entry(0, b"col/c", &rec_c, None)]),
        )]));
        let root = encode(&Value::Map(vec![
            (text("l"), link(&left_cid)),
            (
                text("e"),
                Value::Array(vec![tree_entry(0, b"col/b", &rec_b, Some(sub_cid.as_slice()))]),
            ),
        ]));

        let payload = CarBuilder::new(&commit_cid)
            .block(&commit_cid, &commit_block(&root_cid))
            .block(&root_cid, &root)
            .block(&left_cid, &left)
            .block(&sub_cid, &sub)
            .block(&rec_a, b"A")
            .block(&rec_b, b"B")
            .block(&rec_c, b"C")
            .finish();

        let records = extract_records(&payload).expect("extracts");
        assert_eq!(records.len(), 3);
        assert_eq!(records["col/a"], b"A");
        assert_eq!(records["col/b"], b"B");
        assert_eq!(records["col/c"], b"C");
    }

    #[test]
    fn missing_record_blocks_are_skipped() {
        let commit_cid = cid(b"commit");
        let tree_cid = cid(b"tree");
        let present = cid(b"present");
        let absent = cid(b"absent");

        let tree = encode(&Value::Map(vec![(
            text("e"),
            Value::Array(vec![
                tree_entry(0, b"col/here", &present, None),
                tree_entry(4, b"gone", &absent, None),
            ]),
        )]));

        let payload = CarBuilder::new(&commit_cid)
            .block(&commit_cid, &commit_block(&tree_cid))
            .block(&tree_cid, &tree)
            .block(&present, b"kept")
            .finish();

        let records = extract_records(&payload).expect("extracts");
        assert_eq!(records.len(), 1);
        assert_eq!(records["col/here"], b"kept");
    }

    #[test]
    fn empty_payload_yields_empty_mapping() {
        let records = extract_records(&[]).expect("extracts");
        assert!(records.is_empty());
    }

    #[test]
    fn truncated_payload_fails() {
        let commit_cid = cid(b"commit");
        let mut payload = CarBuilder::new(&commit_cid)
            .block(&commit_cid, &commit_block(&cid(b"tree")))
            .finish();
        payload.truncate(payload.len() - 3);
        assert!(extract_records(&payload).is_err());
    }

    #[test]
    fn uvarint_round_trips() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u64::from(u32::MAX)] {
            let bytes = uvarint(value);
            let mut cursor = bytes.as_slice();
            assert_eq!(read_uvarint(&mut cursor).expect("decodes"), value);
            assert!(cursor.is_empty());
        }
    }
}
