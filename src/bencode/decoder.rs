use super::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::collections::BTreeMap;

/// Decode a complete bencoded document; trailing bytes are an error
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let mut decoder = Decoder::new(data);
    let value = decoder.value()?;
    if !decoder.is_at_end() {
        return Err(decoder.error("Trailing data after value"));
    }
    Ok(value)
}

/// Raw encoded bytes of `key`'s value in a top-level dictionary.
///
/// The info-hash is defined over the exact bytes the author encoded, so the
/// `info` dictionary is sliced out rather than re-encoded.
pub fn raw_dict_value<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>> {
    let mut decoder = Decoder::new(data);
    decoder.expect(b'd')?;

    while decoder.peek()? != b'e' {
        let current = decoder.byte_string()?;
        let start = decoder.pos;
        decoder.value()?;
        if current == key {
            return Ok(Some(&data[start..decoder.pos]));
        }
    }

    Ok(None)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn error(&self, msg: &str) -> BittorrentError {
        BittorrentError::Bencode(format!("{} at byte {}", msg, self.pos))
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("Unexpected end of input"))
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek()? != byte {
            return Err(self.error(&format!("Expected '{}'", byte as char)));
        }
        self.pos += 1;
        Ok(())
    }

    /// Bytes up to (not including) `terminator`, consuming the terminator
    fn take_until(&mut self, terminator: u8) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or_else(|| self.error("Unterminated token"))?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(BencodeValue::Bytes(self.byte_string()?.to_vec())),
            c => Err(self.error(&format!("Invalid bencode token '{}'", c as char))),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        self.expect(b'i')?;
        let digits = self.take_until(b'e')?;

        let valid = match digits {
            [] | [b'-'] => false,
            [b'-', b'0', ..] => false,
            [b'0', _, ..] => false,
            _ => true,
        };
        if !valid {
            return Err(self.error("Invalid integer"));
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(BencodeValue::Integer)
            .ok_or_else(|| self.error("Invalid integer"))
    }

    fn byte_string(&mut self) -> Result<&'a [u8]> {
        let len_digits = self.take_until(b':')?;
        let len = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| self.error("Invalid string length"))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.error("String length exceeds data"))?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<BencodeValue> {
        self.expect(b'l')?;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.value()?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(list))
    }

    fn dict(&mut self) -> Result<BencodeValue> {
        self.expect(b'd')?;
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(self.error("Dictionary key must be a string"));
            }
            let key = self.byte_string()?.to_vec();
            let value = self.value()?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dict(dict))
    }
}
