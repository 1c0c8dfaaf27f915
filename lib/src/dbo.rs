//! The tagged, self-describing object format used by TOC files and CAS
//! bundle metadata. Values are big-endian; on-disk files may carry an
//! additional XOR obfuscation layer which [`un_xor`] strips.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use binrw::BinReaderExt;

use crate::error::FrostpackError;
use crate::fsutil;
use crate::guid::{Guid, Sha1};
use crate::xor::{XorRead, KEY_LEN};

/// Obfuscated files open with one of these signature magics.
const OBFUSCATED_MAGICS: [[u8; 4]; 2] = [[0x00, 0xD1, 0xCE, 0x00], [0x00, 0xD1, 0xCE, 0x01]];
/// The rolling key sits inside the signature block.
const KEY_OFFSET: u64 = 296;
/// Payload bytes follow the signature block.
const DATA_OFFSET: u64 = 556;

mod tag {
    pub const TERMINATOR: u8 = 0x00;
    pub const LIST: u8 = 0x01;
    pub const OBJECT: u8 = 0x02;
    pub const BOOL: u8 = 0x06;
    pub const STRING: u8 = 0x07;
    pub const INT32: u8 = 0x08;
    pub const INT64: u8 = 0x09;
    pub const GUID: u8 = 0x0F;
    pub const SHA1: u8 = 0x10;
    pub const BLOB: u8 = 0x13;
}

/// Read a TOC or catalog file into memory, removing the XOR obfuscation
/// layer when its signature magic is present.
pub fn un_xor(path: &Path) -> Result<Cursor<Vec<u8>>, FrostpackError> {
    let mut f = fsutil::open_input(path)?;
    let mut magic = [0u8; 4];
    // A file shorter than the magic is necessarily clear.
    let obfuscated = match f.read_exact(&mut magic) {
        Ok(()) => OBFUSCATED_MAGICS.contains(&magic),
        Err(_) => false,
    };

    let mut data = Vec::new();
    if obfuscated {
        let mut key = [0u8; KEY_LEN];
        f.seek(SeekFrom::Start(KEY_OFFSET))
            .and_then(|_| f.read_exact(&mut key))
            .and_then(|_| f.seek(SeekFrom::Start(DATA_OFFSET)))
            .map_err(|e| FrostpackError::Io("Couldn't read obfuscation key".into(), e))?;
        XorRead::new(f, key)
            .read_to_end(&mut data)
            .map_err(|e| FrostpackError::Io("Couldn't deobfuscate".into(), e))?;
    } else {
        f.seek(SeekFrom::Start(0))
            .and_then(|_| f.read_to_end(&mut data))
            .map_err(|e| FrostpackError::Io("Couldn't read file".into(), e))?;
    }
    Ok(Cursor::new(data))
}

/// Read the root object of a TOC file.
pub fn read_toc(path: &Path) -> Result<DbObject, FrostpackError> {
    let mut data = un_xor(path)?;
    DbObject::read(&mut data, path)
        .map_err(|e| e.add_context(format!("Couldn't read TOC '{}'", path.display())))
}

#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Guid(Guid),
    Sha1(Sha1),
    Blob(Vec<u8>),
    List(Vec<DbValue>),
    Object(DbObject),
}

impl DbValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_guid(&self) -> Option<Guid> {
        match self {
            Self::Guid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_sha1(&self) -> Option<Sha1> {
        match self {
            Self::Sha1(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DbValue]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&DbObject> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }
}

/// A named-field object node. Field order is preserved as read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DbObject {
    members: Vec<(String, DbValue)>,
}

impl DbObject {
    /// Parse a tagged object value from the current position.
    pub fn read<R: Read + Seek>(r: &mut R, src: &Path) -> Result<Self, FrostpackError> {
        let t = read_u8(r, src)?;
        if t != tag::OBJECT {
            return Err(FrostpackError::invalid_format(
                src,
                position(r).saturating_sub(1),
                format!("expected an object, found tag {t:#04x}"),
            ));
        }
        read_object_body(r, src)
    }

    pub fn get(&self, name: &str) -> Option<&DbValue> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: DbValue) {
        let name = name.into();
        match self.members.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.members.push((name, value)),
        }
    }

    pub fn members(&self) -> &[(String, DbValue)] {
        &self.members
    }

    fn missing(&self, name: &str, src: &Path) -> FrostpackError {
        FrostpackError::Custom(format!(
            "Missing or mistyped field '{}' in '{}'",
            name,
            src.display()
        ))
    }

    pub fn require_u64(&self, name: &str, src: &Path) -> Result<u64, FrostpackError> {
        self.get(name)
            .and_then(DbValue::as_u64)
            .ok_or_else(|| self.missing(name, src))
    }

    pub fn require_str(&self, name: &str, src: &Path) -> Result<&str, FrostpackError> {
        self.get(name)
            .and_then(DbValue::as_str)
            .ok_or_else(|| self.missing(name, src))
    }

    pub fn require_guid(&self, name: &str, src: &Path) -> Result<Guid, FrostpackError> {
        self.get(name)
            .and_then(DbValue::as_guid)
            .ok_or_else(|| self.missing(name, src))
    }

    pub fn require_sha1(&self, name: &str, src: &Path) -> Result<Sha1, FrostpackError> {
        self.get(name)
            .and_then(DbValue::as_sha1)
            .ok_or_else(|| self.missing(name, src))
    }
}

fn position<R: Seek>(r: &mut R) -> u64 {
    r.stream_position().unwrap_or_default()
}

fn read_u8<R: Read>(r: &mut R, _src: &Path) -> Result<u8, FrostpackError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)
        .map_err(|e| FrostpackError::Io("Couldn't read DBO tag".into(), e))?;
    Ok(b[0])
}

/// Little-endian base-128 length with a continuation bit per group.
fn read_leb128<R: Read>(r: &mut R, src: &Path) -> Result<u64, FrostpackError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let b = read_u8(r, src)?;
        result |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

fn read_null_string<R: Read + Seek>(r: &mut R, src: &Path) -> Result<String, FrostpackError> {
    let mut data = Vec::new();
    loop {
        let b = read_u8(r, src)?;
        if b == 0 {
            break;
        }
        data.push(b);
    }
    String::from_utf8(data).map_err(|_| {
        FrostpackError::invalid_format(src, position(r), "DBO name is not valid UTF-8")
    })
}

fn read_object_body<R: Read + Seek>(r: &mut R, src: &Path) -> Result<DbObject, FrostpackError> {
    let len = read_leb128(r, src)?;
    let start = position(r);
    let mut members = Vec::new();
    loop {
        let t = read_u8(r, src)?;
        if t == tag::TERMINATOR {
            break;
        }
        let name = read_null_string(r, src)?;
        members.push((name, read_value(r, t, src)?));
    }
    r.seek(SeekFrom::Start(start + len))
        .map_err(|e| FrostpackError::Io("Couldn't skip past DBO object".into(), e))?;
    Ok(DbObject { members })
}

fn read_list_body<R: Read + Seek>(r: &mut R, src: &Path) -> Result<Vec<DbValue>, FrostpackError> {
    let len = read_leb128(r, src)?;
    let start = position(r);
    let mut items = Vec::new();
    loop {
        let t = read_u8(r, src)?;
        if t == tag::TERMINATOR {
            break;
        }
        items.push(read_value(r, t, src)?);
    }
    r.seek(SeekFrom::Start(start + len))
        .map_err(|e| FrostpackError::Io("Couldn't skip past DBO list".into(), e))?;
    Ok(items)
}

fn read_value<R: Read + Seek>(r: &mut R, t: u8, src: &Path) -> Result<DbValue, FrostpackError> {
    let binrw_err = |e| FrostpackError::BinRW("Couldn't read DBO value".into(), e);
    Ok(match t {
        tag::LIST => DbValue::List(read_list_body(r, src)?),
        tag::OBJECT => DbValue::Object(read_object_body(r, src)?),
        tag::BOOL => DbValue::Bool(read_u8(r, src)? != 0),
        tag::STRING => {
            let len = read_leb128(r, src)?;
            if len == 0 {
                return Err(FrostpackError::invalid_format(
                    src,
                    position(r),
                    "DBO string without terminator",
                ));
            }
            let mut data = vec![0u8; len as usize - 1];
            r.read_exact(&mut data)
                .map_err(|e| FrostpackError::Io("Couldn't read DBO string".into(), e))?;
            r.seek(SeekFrom::Current(1))
                .map_err(|e| FrostpackError::Io("Couldn't skip string terminator".into(), e))?;
            DbValue::String(String::from_utf8(data).map_err(|_| {
                FrostpackError::invalid_format(src, position(r), "DBO string is not valid UTF-8")
            })?)
        }
        tag::INT32 => DbValue::Int32(r.read_be::<i32>().map_err(binrw_err)?),
        tag::INT64 => DbValue::Int64(r.read_be::<i64>().map_err(binrw_err)?),
        tag::GUID => DbValue::Guid(r.read_be::<Guid>().map_err(binrw_err)?),
        tag::SHA1 => DbValue::Sha1(r.read_be::<Sha1>().map_err(binrw_err)?),
        tag::BLOB => {
            let len = read_leb128(r, src)?;
            let mut data = vec![0u8; len as usize];
            r.read_exact(&mut data)
                .map_err(|e| FrostpackError::Io("Couldn't read DBO blob".into(), e))?;
            DbValue::Blob(data)
        }
        other => {
            return Err(FrostpackError::invalid_format(
                src,
                position(r).saturating_sub(1),
                format!("unknown DBO tag {other:#04x}"),
            ))
        }
    })
}

/// Test-only writer for authoring DBO fixtures. Kept alongside the reader
/// so the two agree on the wire layout.
#[cfg(test)]
pub(crate) mod build {
    use std::io::{Cursor, Write};

    use binrw::BinWriterExt;

    use super::{tag, DbObject, DbValue};

    pub(crate) fn write_leb128(out: &mut Vec<u8>, mut v: u64) {
        loop {
            let mut b = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            out.push(b);
            if v == 0 {
                break;
            }
        }
    }

    fn value_tag(v: &DbValue) -> u8 {
        match v {
            DbValue::List(_) => tag::LIST,
            DbValue::Object(_) => tag::OBJECT,
            DbValue::Bool(_) => tag::BOOL,
            DbValue::String(_) => tag::STRING,
            DbValue::Int32(_) => tag::INT32,
            DbValue::Int64(_) => tag::INT64,
            DbValue::Guid(_) => tag::GUID,
            DbValue::Sha1(_) => tag::SHA1,
            DbValue::Blob(_) => tag::BLOB,
        }
    }

    fn value_payload(v: &DbValue) -> Vec<u8> {
        let mut out = Vec::new();
        match v {
            DbValue::Bool(b) => out.push(u8::from(*b)),
            DbValue::Int32(n) => out.extend_from_slice(&n.to_be_bytes()),
            DbValue::Int64(n) => out.extend_from_slice(&n.to_be_bytes()),
            DbValue::String(s) => {
                write_leb128(&mut out, s.len() as u64 + 1);
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            DbValue::Guid(g) => {
                Cursor::new(&mut out).write_be(g).unwrap();
            }
            DbValue::Sha1(s) => out.extend_from_slice(&s.0),
            DbValue::Blob(data) => {
                write_leb128(&mut out, data.len() as u64);
                out.extend_from_slice(data);
            }
            DbValue::List(items) => {
                let mut body = Vec::new();
                for item in items {
                    body.push(value_tag(item));
                    body.extend(value_payload(item));
                }
                body.push(tag::TERMINATOR);
                write_leb128(&mut out, body.len() as u64);
                out.extend(body);
            }
            DbValue::Object(obj) => {
                let mut body = Vec::new();
                for (name, item) in obj.members() {
                    body.push(value_tag(item));
                    body.extend_from_slice(name.as_bytes());
                    body.push(0);
                    body.extend(value_payload(item));
                }
                body.push(tag::TERMINATOR);
                write_leb128(&mut out, body.len() as u64);
                out.extend(body);
            }
        }
        out
    }

    /// Encode an object as a complete tagged root value (the layout of a
    /// deobfuscated TOC file).
    pub(crate) fn encode_root(obj: &DbObject) -> Vec<u8> {
        let root = DbValue::Object(obj.clone());
        let mut out = vec![value_tag(&root)];
        out.extend(value_payload(&root));
        out
    }

    /// Wrap cleartext bytes into an obfuscated file image.
    pub(crate) fn obfuscate(clear: &[u8]) -> Vec<u8> {
        use crate::xor::{KEY_LEN, KEY_SALT};

        let mut out = vec![0u8; super::DATA_OFFSET as usize];
        out[..4].copy_from_slice(&super::OBFUSCATED_MAGICS[0]);
        let mut key = [0u8; KEY_LEN];
        for (i, k) in key.iter_mut().enumerate() {
            *k = (i * 7 % 256) as u8;
        }
        out[super::KEY_OFFSET as usize..super::KEY_OFFSET as usize + KEY_LEN]
            .copy_from_slice(&key);
        out.extend(
            clear
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % KEY_LEN] ^ KEY_SALT),
        );
        out
    }

    pub(crate) fn write_file(path: &std::path::Path, data: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(data).unwrap();
    }
}
