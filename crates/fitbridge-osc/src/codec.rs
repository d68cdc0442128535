//! OSC 1.0 message codec
//!
//! Messages are an address, a type-tag string and big-endian arguments, each
//! padded to four bytes. Persisted objects travel as tagged strings and are
//! decoded back into records on receipt. An empty argument list is encoded as
//! the single string `"()"` so every message carries at least one argument.

use fitbridge_core::codec as tagged;
use fitbridge_core::Record;
use tracing::warn;

use crate::error::{OscError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Placeholder argument standing in for an empty list
pub const EMPTY_SENTINEL: &str = "()";

const BUNDLE_TAG: &[u8] = b"#bundle\0";

// ----------------------------------------------------------------------------
// Arguments
// ----------------------------------------------------------------------------

/// One OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Blob(Vec<u8>),
    Nil,
    Record(Box<Record>),
}

impl Arg {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(i) => Some(*i),
            Arg::Float(f) => Some(*f as i64),
            Arg::Bool(b) => Some(i64::from(*b)),
            Arg::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Int(i) => Some(*i as f64),
            Arg::Float(f) => Some(*f),
            Arg::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(b) => Some(*b),
            Arg::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Arg::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Take a specific entity out of a record argument
    pub fn into_entity<E>(self) -> Option<E>
    where
        E: TryFrom<Record, Error = Record>,
    {
        match self {
            Arg::Record(r) => E::try_from(*r).ok(),
            _ => None,
        }
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(i64::from(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Blob(v)
    }
}

impl From<Record> for Arg {
    fn from(v: Record) -> Self {
        Arg::Record(Box::new(v))
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// An address and its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<Arg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }
}

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

fn pad4(bytes: &mut Vec<u8>) {
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
}

fn push_str(bytes: &mut Vec<u8>, s: &str) {
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    pad4(bytes);
}

/// Encode one message
pub fn encode(message: &OscMessage) -> Result<Vec<u8>> {
    if !message.address.starts_with('/') {
        return Err(OscError::Encode(format!(
            "address {:?} must start with '/'",
            message.address
        )));
    }
    let sentinel = [Arg::Str(EMPTY_SENTINEL.to_string())];
    let args: &[Arg] = if message.args.is_empty() {
        &sentinel
    } else {
        &message.args
    };

    let mut tags = String::with_capacity(args.len() + 1);
    tags.push(',');
    let mut payload = Vec::new();
    for arg in args {
        match arg {
            Arg::Int(i) => match i32::try_from(*i) {
                Ok(small) => {
                    tags.push('i');
                    payload.extend_from_slice(&small.to_be_bytes());
                }
                Err(_) => {
                    tags.push('h');
                    payload.extend_from_slice(&i.to_be_bytes());
                }
            },
            Arg::Float(f) => {
                tags.push('d');
                payload.extend_from_slice(&f.to_be_bytes());
            }
            Arg::Str(s) => {
                if s.contains('\0') {
                    return Err(OscError::Encode("string argument contains NUL".into()));
                }
                tags.push('s');
                push_str(&mut payload, s);
            }
            Arg::Bool(true) => tags.push('T'),
            Arg::Bool(false) => tags.push('F'),
            Arg::Nil => tags.push('N'),
            Arg::Blob(b) => {
                tags.push('b');
                let len = i32::try_from(b.len())
                    .map_err(|_| OscError::Encode("blob too large".into()))?;
                payload.extend_from_slice(&len.to_be_bytes());
                payload.extend_from_slice(b);
                pad4(&mut payload);
            }
            Arg::Record(record) => {
                tags.push('s');
                push_str(&mut payload, &tagged::serialize(record)?);
            }
        }
    }

    let mut bytes = Vec::with_capacity(message.address.len() + tags.len() + payload.len() + 8);
    push_str(&mut bytes, &message.address);
    push_str(&mut bytes, &tags);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| OscError::decode("truncated packet"))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn align(&mut self) {
        self.offset = (self.offset + 3) & !3;
    }

    fn string(&mut self) -> Result<String> {
        let rest = &self.bytes[self.offset.min(self.bytes.len())..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| OscError::decode("unterminated string"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| OscError::decode(format!("invalid utf-8: {e}")))?
            .to_string();
        self.offset += nul + 1;
        self.align();
        Ok(s)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

/// Turn a received string into a record when it carries a tag
fn string_arg(s: String) -> Arg {
    if !tagged::is_tagged(&s) {
        return Arg::Str(s);
    }
    match tagged::deserialize(&s) {
        Ok(record) => Arg::Record(Box::new(record)),
        Err(e) => {
            warn!("Undecodable tagged argument: {}", e);
            Arg::Str(s)
        }
    }
}

fn decode_message(bytes: &[u8]) -> Result<OscMessage> {
    let mut reader = Reader::new(bytes);
    let address = reader.string()?;
    if !address.starts_with('/') {
        return Err(OscError::decode(format!("bad address {address:?}")));
    }
    if reader.offset >= bytes.len() {
        return Ok(OscMessage::new(address, Vec::new()));
    }
    let tags = reader.string()?;
    let tags = tags
        .strip_prefix(',')
        .ok_or_else(|| OscError::decode("missing type tags"))?;

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' => Arg::Int(i64::from(i32::from_be_bytes(reader.array()?))),
            'h' => Arg::Int(i64::from_be_bytes(reader.array()?)),
            'f' => Arg::Float(f64::from(f32::from_be_bytes(reader.array()?))),
            'd' => Arg::Float(f64::from_be_bytes(reader.array()?)),
            's' | 'S' => string_arg(reader.string()?),
            'T' => Arg::Bool(true),
            'F' => Arg::Bool(false),
            'N' | 'I' => Arg::Nil,
            'b' => {
                let len = i32::from_be_bytes(reader.array()?);
                let len = usize::try_from(len).map_err(|_| OscError::decode("negative blob size"))?;
                let blob = reader.take(len)?.to_vec();
                reader.align();
                Arg::Blob(blob)
            }
            other => return Err(OscError::decode(format!("unsupported type tag {other:?}"))),
        };
        args.push(arg);
    }

    if args.len() == 1 && args[0] == Arg::Str(EMPTY_SENTINEL.to_string()) {
        args.clear();
    }
    Ok(OscMessage::new(address, args))
}

fn decode_into(bytes: &[u8], out: &mut Vec<OscMessage>) -> Result<()> {
    if !bytes.starts_with(BUNDLE_TAG) {
        out.push(decode_message(bytes)?);
        return Ok(());
    }
    let mut reader = Reader::new(bytes);
    reader.take(BUNDLE_TAG.len() + 8)?;
    while reader.offset < bytes.len() {
        let size = i32::from_be_bytes(reader.array()?);
        let size = usize::try_from(size).map_err(|_| OscError::decode("negative element size"))?;
        decode_into(reader.take(size)?, out)?;
    }
    Ok(())
}

/// Decode a packet, flattening bundles into their messages
pub fn decode(bytes: &[u8]) -> Result<Vec<OscMessage>> {
    let mut out = Vec::new();
    decode_into(bytes, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitbridge_core::{Device, User};

    #[test]
    fn encodes_standard_layout() {
        let bytes = encode(&OscMessage::new("/ab", vec![Arg::Int(1), Arg::Str("x".into())])).unwrap();
        assert_eq!(
            bytes,
            vec![
                b'/', b'a', b'b', 0, b',', b'i', b's', 0, 0, 0, 0, 1, b'x', 0, 0, 0
            ]
        );
    }

    #[test]
    fn empty_args_use_sentinel_both_ways() {
        let bytes = encode(&OscMessage::new("/ping", vec![])).unwrap();
        assert!(bytes.windows(2).any(|w| w == b"()"));
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, vec![OscMessage::new("/ping", vec![])]);
    }

    #[test]
    fn wide_ints_and_doubles_survive() {
        let message = OscMessage::new(
            "/n",
            vec![
                Arg::Int(1_700_000_000_000),
                Arg::Int(-5),
                Arg::Float(0.1),
                Arg::Bool(true),
                Arg::Nil,
                Arg::Blob(vec![1, 2, 3]),
            ],
        );
        assert_eq!(decode(&encode(&message).unwrap()).unwrap(), vec![message]);
    }

    #[test]
    fn records_are_rebuilt_from_tags() {
        let device = Device::new("hrdevice", "AA").with_alias("hr");
        let message = OscMessage::new("/device_save", vec![Arg::from(Record::Device(device.clone()))]);
        let decoded = decode(&encode(&message).unwrap()).unwrap().remove(0);
        let back: Device = decoded.args[0].clone().into_entity().unwrap();
        assert_eq!(back, device);
        assert!(decoded.args[0].clone().into_entity::<User>().is_none());
    }

    #[test]
    fn bundles_are_flattened() {
        let a = encode(&OscMessage::new("/a", vec![Arg::Int(1)])).unwrap();
        let b = encode(&OscMessage::new("/b", vec![Arg::Int(2)])).unwrap();
        let mut bundle = BUNDLE_TAG.to_vec();
        bundle.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
        for part in [&a, &b] {
            bundle.extend_from_slice(&(part.len() as i32).to_be_bytes());
            bundle.extend_from_slice(part);
        }
        let decoded = decode(&bundle).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].address, "/b");
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let bytes = encode(&OscMessage::new("/a", vec![Arg::Int(1)])).unwrap();
        assert!(decode(&bytes[..bytes.len() - 2]).is_err());
        assert!(decode(b"nope\0\0\0\0").is_err());
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..256)) {
            let _ = decode(&bytes);
        }

        #[test]
        fn packets_stay_aligned(text in "[ -~]{0,40}", value in proptest::num::i64::ANY) {
            let message = OscMessage::new("/device_fit", vec![Arg::from(text.as_str()), Arg::from(value)]);
            let bytes = encode(&message).unwrap();
            proptest::prop_assert_eq!(bytes.len() % 4, 0);
            proptest::prop_assert_eq!(decode(&bytes).unwrap(), vec![message]);
        }
    }
}
