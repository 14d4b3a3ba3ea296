//! Deterministic key derivation for counter, data, and tag records.
//!
//! Every record belonging to a CID lives under a key whose first segment is
//! the CID's bytes in padded URL-safe base64, prefixed by `/` and the `U`
//! encoding tag (the multibase identifier for that alphabet, so the segment
//! minus the slash is itself a valid multibase string). Persisted layout:
//!
//! - `/U<base64-cid>/c` — counter record
//! - `/U<base64-cid>/d` — raw block bytes
//! - `/U<base64-cid>/t/<tag>` — tag holder (empty value)
//! - `/t/<tag>/U<base64-cid>` — reverse tag index (empty value)
//! - `/U<base64-cid>/i/...` — reserved internal namespace
//!
//! Key order is lexicographic; all enumeration is prefix matching over this
//! layout. Encoding is total on valid CIDs and injective.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use cid::Cid;

use grove_kv::Key;

use crate::error::{StoreError, StoreResult};

/// Counter record suffix.
pub(crate) const COUNTER_SUFFIX: &str = "/c";
/// Data record suffix.
pub(crate) const DATA_SUFFIX: &str = "/d";
/// Tag record suffix; also the top-level prefix of the reverse index.
pub(crate) const TAG_SUFFIX: &str = "/t";
/// Reserved for internal-tag variants.
#[allow(dead_code)]
pub(crate) const INTERNAL_SUFFIX: &str = "/i";

/// Single-byte identifier of the base encoding used for the CID segment.
const ENCODING_TAG: char = 'U';

/// The `/U<base64-cid>` segment for `id`.
fn cid_segment(id: &Cid) -> String {
    let encoded = URL_SAFE.encode(id.to_bytes());
    let mut out = String::with_capacity(2 + encoded.len());
    out.push('/');
    out.push(ENCODING_TAG);
    out.push_str(&encoded);
    out
}

/// Derive a key from a CID followed by the given suffixes, concatenated
/// verbatim. Never fails on a valid CID.
pub fn cid_key(id: &Cid, suffixes: &[&str]) -> Key {
    let mut out = cid_segment(id);
    for suffix in suffixes {
        out.push_str(suffix);
    }
    Key::raw(out)
}

/// Key of the counter record for `id`.
pub fn counter_key(id: &Cid) -> Key {
    cid_key(id, &[COUNTER_SUFFIX])
}

/// Key of the data record for `id`.
pub fn data_key(id: &Cid) -> Key {
    cid_key(id, &[DATA_SUFFIX])
}

/// Key of the tag record for `(id, tag)`.
pub fn tag_key(id: &Cid, tag: &Key) -> Key {
    cid_key(id, &[TAG_SUFFIX, tag.as_str()])
}

/// Prefix under which all of `id`'s tag records live.
pub fn tag_prefix(id: &Cid) -> Key {
    cid_key(id, &[TAG_SUFFIX])
}

/// Key of the reverse tag index record for `(tag, id)`.
pub fn tag_index_key(tag: &Key, id: &Cid) -> Key {
    Key::raw(format!("{TAG_SUFFIX}{}{}", tag.as_str(), cid_segment(id)))
}

/// Prefix under which all members of `tag` live in the reverse index.
///
/// Ends with `/` so that the members of `/x` are never confused with the
/// members of `/xy`.
pub fn tag_index_prefix(tag: &Key) -> Key {
    Key::raw(format!("{TAG_SUFFIX}{}/", tag.as_str()))
}

/// Decode the CID out of a `/U<base64-cid>` segment.
fn segment_to_cid(key: &str, segment: &str) -> StoreResult<Cid> {
    let malformed = || StoreError::MalformedKey {
        key: key.to_string(),
    };
    let encoded = segment
        .strip_prefix('/')
        .and_then(|s| s.strip_prefix(ENCODING_TAG))
        .ok_or_else(malformed)?;
    let bytes = URL_SAFE.decode(encoded).map_err(|_| malformed())?;
    Cid::try_from(bytes.as_slice()).map_err(|_| malformed())
}

/// Recover the CID from a data record key. Strict inverse of [`data_key`]:
/// fails on anything that is not exactly `/U<base64-cid>/d`.
pub fn data_key_to_cid(key: &str) -> StoreResult<Cid> {
    let segment = key
        .strip_suffix(DATA_SUFFIX)
        .ok_or_else(|| StoreError::MalformedKey {
            key: key.to_string(),
        })?;
    segment_to_cid(key, segment)
}

/// Recover the CID from a reverse tag index key, given the scan prefix it
/// was found under. The remainder past the prefix is the CID segment.
pub fn tag_index_key_to_cid(prefix: &str, key: &str) -> StoreResult<Cid> {
    let segment = key
        .strip_prefix(prefix)
        .ok_or_else(|| StoreError::MalformedKey {
            key: key.to_string(),
        })?;
    // The prefix ends with '/', the segment encodes its own leading slash.
    segment_to_cid(key, &format!("/{segment}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash_codetable::{Code, MultihashDigest};

    const RAW: u64 = 0x55;

    fn test_cid(data: &[u8]) -> Cid {
        Cid::new_v1(RAW, Code::Sha2_256.digest(data))
    }

    #[test]
    fn counter_and_data_keys_share_the_cid_segment() {
        let id = test_cid(b"block");
        let counter = counter_key(&id);
        let data = data_key(&id);
        assert!(counter.as_str().ends_with("/c"));
        assert!(data.as_str().ends_with("/d"));
        assert_eq!(
            counter.as_str().strip_suffix("/c"),
            data.as_str().strip_suffix("/d")
        );
    }

    #[test]
    fn keys_start_with_encoding_tag() {
        let id = test_cid(b"block");
        assert!(data_key(&id).as_str().starts_with("/U"));
    }

    #[test]
    fn data_key_roundtrip() {
        let id = test_cid(b"roundtrip");
        let key = data_key(&id);
        let decoded = data_key_to_cid(key.as_str()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn data_key_to_cid_rejects_wrong_suffix() {
        let id = test_cid(b"x");
        let key = counter_key(&id);
        assert!(matches!(
            data_key_to_cid(key.as_str()),
            Err(StoreError::MalformedKey { .. })
        ));
    }

    #[test]
    fn data_key_to_cid_rejects_garbage() {
        for bad in ["", "/d", "/Unot-base64!!/d", "/X/d", "short"] {
            assert!(
                data_key_to_cid(bad).is_err(),
                "expected failure for {bad:?}"
            );
        }
    }

    #[test]
    fn encoding_is_injective() {
        let a = test_cid(b"a");
        let b = test_cid(b"b");
        assert_ne!(data_key(&a), data_key(&b));
        assert_ne!(counter_key(&a), counter_key(&b));
    }

    #[test]
    fn tag_key_layout() {
        let id = test_cid(b"tagged");
        let tag = Key::new("pin/set-1");
        let key = tag_key(&id, &tag);
        assert!(key.as_str().contains("/t/pin/set-1"));
        assert!(key.as_str().starts_with("/U"));
    }

    #[test]
    fn tag_index_roundtrip() {
        let id = test_cid(b"member");
        let tag = Key::new("x");
        let prefix = tag_index_prefix(&tag);
        let key = tag_index_key(&tag, &id);
        assert!(key.as_str().starts_with(prefix.as_str()));
        let decoded = tag_index_key_to_cid(prefix.as_str(), key.as_str()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn tag_index_prefixes_do_not_collide() {
        let x = tag_index_prefix(&Key::new("x"));
        let xy = tag_index_key(&Key::new("xy"), &test_cid(b"m"));
        assert!(!xy.as_str().starts_with(x.as_str()));
    }

    #[test]
    fn tag_prefix_covers_only_own_tags() {
        let id = test_cid(b"mine");
        let prefix = tag_prefix(&id);
        let mine = tag_key(&id, &Key::new("a"));
        let theirs = tag_key(&test_cid(b"other"), &Key::new("a"));
        assert!(mine.as_str().starts_with(prefix.as_str()));
        assert!(!theirs.as_str().starts_with(prefix.as_str()));
    }
}
