use super::BencodeValue;

/// Encode a value into its canonical byte representation
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode_into(&mut out);
    out
}

impl BencodeValue {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            BencodeValue::Bytes(s) => write_bytes(s, out),
            BencodeValue::List(list) => {
                out.push(b'l');
                list.iter().for_each(|item| item.encode_into(out));
                out.push(b'e');
            }
            BencodeValue::Dict(dict) => {
                // BTreeMap iteration keeps keys in the sorted order bencode requires
                out.push(b'd');
                for (key, value) in dict {
                    write_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
