//! Object key layout of a transfer in the object store.
//!
//! ```text
//!     - bucket
//!       L {dst}.manifest
//!       L {dst}/part0
//!       L {dst}/part1
//!       L {dst}/part...
//! ```

use super::ChunkIndex;

const MANIFEST_SUFFIX: &str = ".manifest";
const PART_PREFIX: &str = "part";

/// Key of the manifest object for destination prefix `dst`.
pub fn manifest_key(dst: &str) -> String {
    format!("{dst}{MANIFEST_SUFFIX}")
}

/// Key of chunk object `index` for destination prefix `dst`.
pub fn chunk_key(dst: &str, index: ChunkIndex) -> String {
    format!("{dst}/{PART_PREFIX}{index}")
}

/// Split a chunk object key back into its destination prefix and chunk index.
pub fn parse_chunk_key(key: &str) -> Option<(&str, ChunkIndex)> {
    let (dst, part) = key.rsplit_once('/')?;
    let index = part.strip_prefix(PART_PREFIX)?;

    // reject `part01` or `part+1`, which `parse` would accept or which would not round-trip
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) || (index.len() > 1 && index.starts_with('0')) {
        return None;
    }

    Some((dst, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(manifest_key("yt_md"), "yt_md.manifest");
        assert_eq!(chunk_key("yt_md", 0), "yt_md/part0");
        assert_eq!(chunk_key("videos/yt_md", 12), "videos/yt_md/part12");
    }

    #[test]
    fn test_parse_chunk_key() {
        assert_eq!(parse_chunk_key("videos/yt_md/part12"), Some(("videos/yt_md", 12)));
        assert_eq!(parse_chunk_key(&chunk_key("a", 7)), Some(("a", 7)));
        assert_eq!(parse_chunk_key("yt_md.manifest"), None);
        assert_eq!(parse_chunk_key("yt_md/part"), None);
        assert_eq!(parse_chunk_key("yt_md/part01"), None);
        assert_eq!(parse_chunk_key("yt_md/part+1"), None);
        assert_eq!(parse_chunk_key("yt_md/chunk1"), None);
    }
}
