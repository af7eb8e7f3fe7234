mod decoder;
mod encoder;
mod value;

pub use decoder::{decode, raw_dict_value};
pub use encoder::encode;
pub use value::BencodeValue;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), BencodeValue::Integer(-7));
        assert_eq!(decode(b"4:spam").unwrap(), BencodeValue::from("spam"));
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::Bytes(Vec::new()));
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d4:listl4:spami3ee3:numi1ee").unwrap();

        assert_eq!(value.get_int("num"), Some(1));
        let list = value.get("list").and_then(|v| v.as_list()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_str(), Some("spam"));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"di1ei2ee").is_err());
        assert!(decode(b"i1ei2e").is_err());
        assert!(decode(b"x").is_err());
    }

    #[test]
    fn test_encode_sorts_dict_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zeta".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"alpha".to_vec(), BencodeValue::from("x"));

        assert_eq!(
            encode(&BencodeValue::Dict(dict)),
            b"d5:alpha1:x4:zetai1ee".to_vec()
        );
    }

    #[test]
    fn test_raw_dict_value_preserves_bytes() {
        // Non-canonical key order inside "info" must survive untouched
        let data = b"d8:announce3:url4:infod1:bi1e1:ai2eee";

        let raw = raw_dict_value(data, b"info").unwrap().unwrap();
        assert_eq!(raw, b"d1:bi1e1:ai2ee");

        assert!(raw_dict_value(data, b"missing").unwrap().is_none());
    }
}
