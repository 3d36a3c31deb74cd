//! Key hashing, varint codec, and little-endian stream helpers.

use std::hash::Hasher;
use std::io::{self, Read, Write};

use twox_hash::XxHash64;

/// Fixed seed for the 64-bit key hash. Slot assignment derived from this
/// hash is persisted in snapshots, so the seed must never change.
const HASH_SEED: u64 = 0x1420_3A94;

/// Hash a key into the 64-bit value used for slot addressing and index
/// entry identity.
#[inline]
pub fn hash64(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(data);
    hasher.finish()
}

/// Slot number for a hash in a table of `2^level` slots: the top `level`
/// bits of the hash.
#[inline]
pub fn slot_for(hash: u64, level: u32) -> usize {
    debug_assert!(level >= 1 && level < 64);
    (hash >> (64 - level)) as usize
}

/// Number of bytes `v` occupies as an unsigned LEB128 varint.
#[inline]
pub fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Append `v` as an unsigned LEB128 varint.
pub fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Decode an unsigned LEB128 varint from the front of `data`.
///
/// Returns `(value, encoded_len)`, or `None` on truncated input or a varint
/// longer than 10 bytes.
pub fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Serialized size of a key/value pair as stored in a segment item,
/// excluding the 8-byte expiration prefix.
#[inline]
pub fn kv_size(key_len: usize, value_len: usize) -> usize {
    uvarint_len(key_len as u64) + uvarint_len(value_len as u64) + key_len + value_len
}

// Little-endian stream helpers for snapshot files.

pub fn put_u8<W: Write + ?Sized>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn put_u16<W: Write + ?Sized>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn put_u32<W: Write + ?Sized>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn put_u64<W: Write + ?Sized>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn put_f64<W: Write + ?Sized>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_bits().to_le_bytes())
}

pub fn get_u8<R: Read + ?Sized>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn get_u16<R: Read + ?Sized>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn get_u32<R: Read + ?Sized>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn get_u64<R: Read + ?Sized>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn get_f64<R: Read + ?Sized>(r: &mut R) -> io::Result<f64> {
    Ok(f64::from_bits(get_u64(r)?))
}
