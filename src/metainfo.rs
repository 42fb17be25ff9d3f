use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use bencode::ValueRef;
use sha1::{Digest, Sha1};

pub use peer_proto::InfoHash;

pub const HASH_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Parsed torrent descriptor. Immutable once built.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_len: u32,
    pub length: u64,
    pub piece_hashes: Vec<u8>,
    pub files: Vec<FileEntry>,
    /// Tracker tiers: round-robin within a tier, failover across tiers.
    pub trackers: Vec<Vec<String>>,
    /// Seed nodes for the DHT.
    pub nodes: Vec<SocketAddr>,
    pub private: bool,
}

impl Metainfo {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let value = ValueRef::decode(data)?;
        let root = value.as_dict().context("Torrent file is not a dict")?;

        let info = root.get_dict("info").context("Missing info dict")?;
        let info_hash = InfoHash(Sha1::digest(info.as_raw_bytes()).into());

        let name = info.get_str("name").unwrap_or_default().to_owned();
        let piece_len = info
            .get_int("piece length")
            .context("Missing piece length")? as u32;
        anyhow::ensure!(
            piece_len > 0 && piece_len.is_power_of_two(),
            "Piece length must be a positive power of two"
        );

        let piece_hashes = info.get_bytes("pieces").context("Missing pieces")?.to_vec();
        anyhow::ensure!(
            !piece_hashes.is_empty() && piece_hashes.len() % HASH_LEN == 0,
            "Piece hash string must be a multiple of {} bytes",
            HASH_LEN
        );

        let files = parse_files(info, &name)?;
        let length: u64 = files.iter().map(|f| f.length).sum();
        anyhow::ensure!(length > 0, "Torrent has no content");

        let num_pieces = (length + piece_len as u64 - 1) / piece_len as u64;
        anyhow::ensure!(
            num_pieces == (piece_hashes.len() / HASH_LEN) as u64,
            "Piece count does not match total length"
        );

        let mut trackers = Vec::new();
        if let Some(tiers) = root.get_list("announce-list") {
            for tier in tiers {
                let urls: Vec<String> = tier
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|u| u.as_str().map(String::from))
                    .collect();
                if !urls.is_empty() {
                    trackers.push(urls);
                }
            }
        }
        if trackers.is_empty() {
            if let Some(announce) = root.get_str("announce") {
                trackers.push(vec![announce.to_owned()]);
            }
        }

        let mut nodes = Vec::new();
        if let Some(list) = root.get_list("nodes") {
            for entry in list {
                if let Some(addr) = parse_node(entry) {
                    nodes.push(addr);
                }
            }
        }

        let private = info.get_int("private") == Some(1);

        Ok(Metainfo {
            info_hash,
            name,
            piece_len,
            length,
            piece_hashes,
            files,
            trackers,
            nodes,
            private,
        })
    }

    pub fn num_pieces(&self) -> u32 {
        (self.piece_hashes.len() / HASH_LEN) as u32
    }

    /// Length of the given piece; only the last may be short.
    pub fn piece_len_at(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_len as u64;
        debug_assert!(start < self.length);
        (self.length - start).min(self.piece_len as u64) as u32
    }

    pub fn piece_hash(&self, index: u32) -> &[u8] {
        &self.piece_hashes[index as usize * HASH_LEN..][..HASH_LEN]
    }
}

fn parse_files(info: &bencode::Dict<'_>, name: &str) -> anyhow::Result<Vec<FileEntry>> {
    if let Some(list) = info.get_list("files") {
        // Multi-file: paths are nested under the torrent name.
        let mut files = Vec::with_capacity(list.len());
        for entry in list {
            let dict = entry.as_dict().context("File entry is not a dict")?;
            let length = dict.get_int("length").context("File missing length")? as u64;

            let mut path = PathBuf::from(name);
            let components = dict.get_list("path").context("File missing path")?;
            anyhow::ensure!(!components.is_empty(), "Empty file path");
            for c in components {
                let c = c.as_str().context("Path component is not a string")?;
                anyhow::ensure!(
                    !c.is_empty() && c != "." && c != ".." && !c.contains('/'),
                    "Unsafe path component: {:?}",
                    c
                );
                path.push(c);
            }

            files.push(FileEntry { path, length });
        }
        anyhow::ensure!(!files.is_empty(), "Empty files list");
        Ok(files)
    } else {
        let length = info.get_int("length").context("Missing length")? as u64;
        Ok(vec![FileEntry {
            path: PathBuf::from(name),
            length,
        }])
    }
}

fn parse_node(entry: &ValueRef<'_>) -> Option<SocketAddr> {
    let pair = entry.as_list()?;
    let host = pair.first()?.as_str()?;
    let port = pair.get(1)?.as_int()?;
    // Host names would need a resolver; only literals are kept.
    let ip: IpAddr = host.parse().ok()?;
    Some(SocketAddr::new(ip, u16::try_from(port).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencode::{DictEncoder, Encode};

    fn single_file_torrent(length: i64, piece_len: i64, num_pieces: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut root = DictEncoder::new(&mut buf);
        root.insert("announce", "http://tracker.example/announce");
        let mut info = root.insert_dict("info");
        info.insert("length", length);
        info.insert("name", "payload.bin");
        info.insert("piece length", piece_len);
        info.insert("pieces", vec![0u8; num_pieces * HASH_LEN]);
        info.finish();
        root.finish();
        buf
    }

    #[test]
    fn parse_single_file() {
        let data = single_file_torrent(40960, 16384, 3);
        let m = Metainfo::parse(&data).unwrap();
        assert_eq!(m.name, "payload.bin");
        assert_eq!(m.length, 40960);
        assert_eq!(m.piece_len, 16384);
        assert_eq!(m.num_pieces(), 3);
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.trackers, vec![vec!["http://tracker.example/announce".to_owned()]]);

        // 40960 = 2 * 16384 + 8192; the tail piece is short.
        assert_eq!(m.piece_len_at(0), 16384);
        assert_eq!(m.piece_len_at(2), 8192);
    }

    #[test]
    fn info_hash_covers_exactly_the_info_dict() {
        let data = single_file_torrent(16384, 16384, 1);
        let m = Metainfo::parse(&data).unwrap();

        // Recompute by hand from the expected info-dict encoding.
        let mut info = Vec::new();
        let mut d = DictEncoder::new(&mut info);
        d.insert("length", 16384i64);
        d.insert("name", "payload.bin");
        d.insert("piece length", 16384i64);
        d.insert("pieces", vec![0u8; HASH_LEN]);
        d.finish();

        let expected: [u8; 20] = Sha1::digest(&info).into();
        assert_eq!(m.info_hash, InfoHash(expected));
    }

    #[test]
    fn parse_multi_file() {
        let mut buf = Vec::new();
        let mut root = DictEncoder::new(&mut buf);
        let mut info = root.insert_dict("info");
        let mut files = info.insert_list("files");
        for (len, name) in [(10240i64, "a.bin"), (10240, "b.bin")] {
            let mut f = files.push_dict();
            f.insert("length", len);
            let mut p = f.insert_list("path");
            p.push(name);
            p.finish();
            f.finish();
        }
        files.finish();
        info.insert("name", "pair");
        info.insert("piece length", 16384i64);
        info.insert("pieces", vec![0u8; 2 * HASH_LEN]);
        info.finish();
        root.finish();

        let m = Metainfo::parse(&buf).unwrap();
        assert_eq!(m.length, 20480);
        assert_eq!(m.num_pieces(), 2);
        assert_eq!(m.files[0].path, PathBuf::from("pair/a.bin"));
        assert_eq!(m.files[1].path, PathBuf::from("pair/b.bin"));
        assert_eq!(m.piece_len_at(1), 4096);
    }

    #[test]
    fn rejects_traversal_paths() {
        let mut buf = Vec::new();
        let mut root = DictEncoder::new(&mut buf);
        let mut info = root.insert_dict("info");
        let mut files = info.insert_list("files");
        let mut f = files.push_dict();
        f.insert("length", 1i64);
        let mut p = f.insert_list("path");
        p.push("..");
        p.finish();
        f.finish();
        files.finish();
        info.insert("name", "evil");
        info.insert("piece length", 16384i64);
        info.insert("pieces", vec![0u8; HASH_LEN]);
        info.finish();
        root.finish();

        assert!(Metainfo::parse(&buf).is_err());
    }

    #[test]
    fn rejects_mismatched_piece_count() {
        let data = single_file_torrent(40960, 16384, 2);
        assert!(Metainfo::parse(&data).is_err());
    }

    #[test]
    fn nodes_with_ip_literals() {
        let mut buf = Vec::new();
        let mut root = DictEncoder::new(&mut buf);
        let mut info = root.insert_dict("info");
        info.insert("length", 16384i64);
        info.insert("name", "x");
        info.insert("piece length", 16384i64);
        info.insert("pieces", vec![0u8; HASH_LEN]);
        info.finish();
        let mut nodes = root.insert_list("nodes");
        // A dict entry is not a [host, port] pair; it is skipped.
        nodes.push_dict().finish();
        {
            // [ip, port] pair; hostnames would need a resolver and are
            // skipped.
            let mut pair = Vec::new();
            let mut l = bencode::ListEncoder::new(&mut pair);
            l.push("10.0.0.1");
            l.push(6881i64);
            l.finish();
            nodes.push(RawValue(pair));
        }
        nodes.finish();
        root.finish();

        let m = Metainfo::parse(&buf).unwrap();
        assert_eq!(m.nodes, vec![SocketAddr::from(([10, 0, 0, 1], 6881))]);
    }

    struct RawValue(Vec<u8>);

    impl Encode for RawValue {
        fn encode(&self, buf: &mut Vec<u8>) {
            buf.extend(&self.0);
        }
    }
}
