use super::{Descriptor, FileEntry};
use crate::bencode::{decode, raw_dict_value, BencodeValue};
use crate::error::{BittorrentError, Result};
use crate::hash::{self, Sha1Hash};

/// Top-level metainfo structure from a .torrent file
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// URL of the tracker
    pub announce: String,
    /// Additional tracker URLs, grouped in tiers
    pub announce_list: Option<Vec<Vec<String>>>,
    /// Information about the torrent contents
    pub info: Descriptor,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: Sha1Hash,
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(invalid("Torrent must be a dict"));
        }

        let announce = root
            .get_str("announce")
            .ok_or_else(|| invalid("Missing 'announce' field"))?
            .to_string();

        let announce_list = root.get("announce-list").and_then(|v| {
            v.as_list().map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect()
                        })
                    })
                    .collect()
            })
        });

        let info_value = root
            .get("info")
            .ok_or_else(|| invalid("Missing 'info' field"))?;
        let info = parse_info(info_value)?;

        let raw_info =
            raw_dict_value(data, b"info")?.ok_or_else(|| invalid("Missing 'info' field"))?;
        let info_hash = hash::digest(raw_info);

        Ok(Metainfo {
            announce,
            announce_list,
            info,
            info_hash,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        self.info_hash.to_hex()
    }

    /// Every tracker URL, `announce` first, tiers in order, without repeats
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls = vec![self.announce.clone()];
        for url in self.announce_list.iter().flatten().flatten() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

fn invalid(msg: &str) -> BittorrentError {
    BittorrentError::InvalidTorrent(msg.to_string())
}

fn parse_info(info: &BencodeValue) -> Result<Descriptor> {
    if info.as_dict().is_none() {
        return Err(invalid("Info must be a dict"));
    }

    let name = info
        .get_str("name")
        .ok_or_else(|| invalid("Missing 'name' field"))?
        .to_string();

    let piece_length = info
        .get_u64("piece length")
        .ok_or_else(|| invalid("Missing 'piece length' field"))?;

    let pieces = info
        .get("pieces")
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| invalid("Missing 'pieces' field"))?;
    let piece_hashes = Sha1Hash::split_concatenated(pieces)?;

    if let Some(length) = info.get("length") {
        let length = length
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| invalid("Invalid 'length' field"))?;
        return Descriptor::single_file(name, piece_length, piece_hashes, length);
    }

    let entries = info
        .get("files")
        .and_then(|v| v.as_list())
        .ok_or_else(|| invalid("Missing 'length' or 'files' field"))?;

    // Multi-file content lives under a directory named after the torrent
    let files = entries
        .iter()
        .map(|entry| {
            let length = entry
                .get_u64("length")
                .ok_or_else(|| invalid("Missing file 'length'"))?;

            let components = entry
                .get("path")
                .and_then(|v| v.as_list())
                .ok_or_else(|| invalid("Missing file 'path'"))?;

            let mut path = vec![name.clone()];
            for component in components {
                let component = component
                    .as_str()
                    .ok_or_else(|| invalid("Invalid path component"))?;
                path.push(component.to_string());
            }

            Ok(FileEntry { path, length })
        })
        .collect::<Result<Vec<_>>>()?;

    Descriptor::new(name, piece_length, piece_hashes, files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;
    use std::collections::BTreeMap;

    fn dict(entries: Vec<(&str, BencodeValue)>) -> BencodeValue {
        BencodeValue::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_parse_single_file() {
        let info = dict(vec![
            ("name", "file.bin".into()),
            ("piece length", BencodeValue::Integer(16384)),
            ("pieces", BencodeValue::Bytes(vec![0xab; 40])),
            ("length", BencodeValue::Integer(20000)),
        ]);
        let torrent = encode(&dict(vec![
            ("announce", "http://tracker.example/announce".into()),
            ("info", info.clone()),
        ]));

        let metainfo = Metainfo::from_bytes(&torrent).unwrap();

        assert_eq!(metainfo.announce, "http://tracker.example/announce");
        assert_eq!(metainfo.info.piece_count(), 2);
        assert_eq!(metainfo.info.total_length, 20000);
        assert_eq!(metainfo.info.files[0].path, vec!["file.bin".to_string()]);
        assert_eq!(metainfo.info_hash, hash::digest(&encode(&info)));
    }

    #[test]
    fn test_parse_multi_file() {
        let file = |path: &str, length: i64| {
            dict(vec![
                ("length", BencodeValue::Integer(length)),
                ("path", BencodeValue::List(vec![path.into()])),
            ])
        };
        let info = dict(vec![
            ("name", "album".into()),
            ("piece length", BencodeValue::Integer(16)),
            ("pieces", BencodeValue::Bytes(vec![0; 40])),
            (
                "files",
                BencodeValue::List(vec![file("a.txt", 10), file("b.txt", 12)]),
            ),
        ]);
        let torrent = encode(&dict(vec![
            ("announce", "http://t/announce".into()),
            (
                "announce-list",
                BencodeValue::List(vec![BencodeValue::List(vec!["http://backup".into()])]),
            ),
            ("info", info),
        ]));

        let metainfo = Metainfo::from_bytes(&torrent).unwrap();

        assert_eq!(metainfo.info.total_length, 22);
        assert_eq!(
            metainfo.info.files[1].path,
            vec!["album".to_string(), "b.txt".to_string()]
        );
        assert_eq!(
            metainfo.announce_list,
            Some(vec![vec!["http://backup".to_string()]])
        );
        assert_eq!(
            metainfo.tracker_urls(),
            vec!["http://t/announce".to_string(), "http://backup".to_string()]
        );
    }

    #[test]
    fn test_missing_fields() {
        let torrent = encode(&dict(vec![("announce", "http://t".into())]));
        assert!(matches!(
            Metainfo::from_bytes(&torrent),
            Err(BittorrentError::InvalidTorrent(_))
        ));
    }
}
