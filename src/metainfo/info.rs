use std::collections::BTreeMap;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};

/// The parsed info dictionary together with its raw bytes.
///
/// The raw bytes are what the metadata extension serves to other peers, so
/// they are kept verbatim rather than re-encoded.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory.
    pub name: String,
    /// Number of bytes per piece; the last piece may be shorter.
    pub piece_length: u32,
    /// SHA1 hash of each piece.
    pub pieces: Vec<[u8; 20]>,
    /// Total size of all files combined.
    pub total_length: u64,
    raw: Bytes,
}

impl Info {
    /// Parses metadata received from a peer, trusting it only if its hash
    /// matches `expected`.
    pub fn verified(raw: Bytes, expected: &InfoHash) -> Result<Self, MetainfoError> {
        if InfoHash::of(&raw) != *expected {
            return Err(MetainfoError::HashMismatch);
        }
        Self::parse(raw)
    }

    /// Parses an info dictionary without checking its hash.
    pub fn parse(raw: Bytes) -> Result<Self, MetainfoError> {
        let value = decode(&raw)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(Value::as_str)
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(Value::as_integer)
            .ok_or(MetainfoError::MissingField("piece length"))?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|&len| len > 0)
            .ok_or(MetainfoError::InvalidField("piece length"))?;

        let hashes = dict
            .get(b"pieces".as_slice())
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if hashes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let pieces: Vec<[u8; 20]> = hashes
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect();

        let total_length = total_length(dict)?;
        let expected = total_length.div_ceil(piece_length as u64);
        if total_length == 0 || expected != pieces.len() as u64 {
            return Err(MetainfoError::InvalidField("pieces"));
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            total_length,
            raw,
        })
    }

    /// Builds a single-file info dictionary describing `data`.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerwire::Info;
    ///
    /// let info = Info::from_data("file.bin", 16384, &[7u8; 40000]).unwrap();
    /// assert_eq!(info.piece_count(), 3);
    /// assert_eq!(info.piece_size(2), 40000 - 2 * 16384);
    ///
    /// let copy = Info::verified(info.raw().clone(), &info.info_hash()).unwrap();
    /// assert_eq!(copy.name, "file.bin");
    /// ```
    pub fn from_data(name: &str, piece_length: u32, data: &[u8]) -> Result<Self, MetainfoError> {
        if piece_length == 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }
        let mut hashes = Vec::with_capacity(data.len().div_ceil(piece_length as usize) * 20);
        for chunk in data.chunks(piece_length as usize) {
            hashes.extend_from_slice(&Sha1::digest(chunk));
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"length"), Value::Integer(data.len() as i64));
        dict.insert(Bytes::from_static(b"name"), Value::string(name));
        dict.insert(
            Bytes::from_static(b"piece length"),
            Value::Integer(piece_length as i64),
        );
        dict.insert(Bytes::from_static(b"pieces"), Value::Bytes(hashes.into()));

        Self::parse(Bytes::from(encode(&Value::Dict(dict))))
    }

    /// SHA1 of the raw dictionary.
    pub fn info_hash(&self) -> InfoHash {
        InfoHash::of(&self.raw)
    }

    /// Raw bencoded info dictionary.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Size of the raw dictionary, as announced for ut_metadata.
    pub fn metadata_size(&self) -> u32 {
        self.raw.len() as u32
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Length of piece `index`; zero when out of range.
    pub fn piece_size(&self, index: u32) -> u32 {
        let count = self.piece_count();
        if index >= count {
            return 0;
        }
        if index + 1 < count {
            return self.piece_length;
        }
        (self.total_length - self.piece_length as u64 * (count as u64 - 1)) as u32
    }

    /// Expected SHA1 of piece `index`.
    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.pieces.get(index as usize)
    }
}

fn total_length(dict: &BTreeMap<Bytes, Value>) -> Result<u64, MetainfoError> {
    if let Some(length) = dict.get(b"length".as_slice()).and_then(Value::as_integer) {
        return u64::try_from(length).map_err(|_| MetainfoError::InvalidField("length"));
    }

    let files = dict
        .get(b"files".as_slice())
        .and_then(Value::as_list)
        .ok_or(MetainfoError::MissingField("length or files"))?;

    files.iter().try_fold(0u64, |total, file| {
        let length = file
            .get(b"length")
            .and_then(Value::as_integer)
            .ok_or(MetainfoError::MissingField("file length"))?;
        let length = u64::try_from(length).map_err(|_| MetainfoError::InvalidField("file length"))?;
        Ok(total + length)
    })
}
