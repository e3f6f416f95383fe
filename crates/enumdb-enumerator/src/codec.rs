//! Value codecs and equality policies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use enumdb_common::{varint, Result, StorageError};

/// Serializes values into self-delimiting records.
///
/// `deserialize` advances `input` past exactly the bytes `serialize` wrote;
/// the enumerator treats leftovers as corruption.
pub trait Codec<T>: Send + Sync {
    fn serialize(&self, value: &T, out: &mut BytesMut) -> Result<()>;

    fn deserialize(&self, input: &mut &[u8]) -> Result<T>;
}

/// Hashing and equality used to find an existing id for a value.
///
/// `hash` must be stable across processes; it is persisted as a B-tree key.
pub trait EqualityPolicy<T>: Send + Sync {
    fn hash(&self, value: &T) -> i32;

    fn equals(&self, a: &T, b: &T) -> bool;
}

fn get_len(input: &mut &[u8]) -> Result<usize> {
    let len = varint::get_int(input)?;
    if len < 0 || len as usize > input.remaining() {
        return Err(StorageError::Codec(format!(
            "record length {len} with {} bytes left",
            input.remaining()
        )));
    }
    Ok(len as usize)
}

fn put_len(out: &mut BytesMut, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| StorageError::Codec(format!("value of {len} bytes is too large")))?;
    varint::put_int(out, len);
    Ok(())
}

/// UTF-8 strings, varint length prefixed.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn serialize(&self, value: &String, out: &mut BytesMut) -> Result<()> {
        put_len(out, value.len())?;
        out.put_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<String> {
        let len = get_len(input)?;
        let (text, rest) = (*input).split_at(len);
        let value = std::str::from_utf8(text)
            .map_err(|e| StorageError::Codec(format!("invalid UTF-8: {e}")))?
            .to_owned();
        *input = rest;
        Ok(value)
    }
}

/// Raw byte sequences, varint length prefixed.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec<Bytes> for BytesCodec {
    fn serialize(&self, value: &Bytes, out: &mut BytesMut) -> Result<()> {
        put_len(out, value.len())?;
        out.put_slice(value);
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<Bytes> {
        let len = get_len(input)?;
        Ok(input.copy_to_bytes(len))
    }
}

/// Equality on content with a deterministic polynomial hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentEquality;

/// `h = 31 * h + unit` over the value's units, wrapping, starting from 0.
#[inline]
pub fn polynomial_hash(units: impl IntoIterator<Item = i32>) -> i32 {
    units
        .into_iter()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit))
}

impl EqualityPolicy<String> for ContentEquality {
    fn hash(&self, value: &String) -> i32 {
        polynomial_hash(value.encode_utf16().map(i32::from))
    }

    fn equals(&self, a: &String, b: &String) -> bool {
        a == b
    }
}

/// Hashes signed bytes with [`polynomial_hash`], seeded with 0 like strings.
///
/// Array hashes seeded with 1 give different values for the same bytes, so
/// these hashes are only meaningful inside enumdb files.
impl EqualityPolicy<Bytes> for ContentEquality {
    fn hash(&self, value: &Bytes) -> i32 {
        polynomial_hash(value.iter().map(|&b| b as i8 as i32))
    }

    fn equals(&self, a: &Bytes, b: &Bytes) -> bool {
        a == b
    }
}
