//! EBX is the typed descriptor format at the heart of Frostbite assets: a
//! header, keyword pool and descriptor tables describe a payload of typed
//! instances, each a tree of complexes and fields. Files are platform
//! native endian; only GUID tails are fixed big-endian.
//!
//! Parsing never follows references. Class fields hold raw reference
//! words and are resolved lazily through [`Dbx::link`] against an
//! [`EbxEnvironment`], which caches parses by file GUID.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use binrw::{binread, BinReaderExt, Endian};
use bitvec::prelude::*;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use strum::FromRepr;

use crate::error::FrostpackError;
use crate::fsutil;
use crate::guid::{Guid, Sha1};

use self::guid_table::GuidTable;

pub mod guid_table;

pub const MAGIC_LITTLE: [u8; 4] = [0xCE, 0xD1, 0xB2, 0x0F];
pub const MAGIC_BIG: [u8; 4] = [0x0F, 0xB2, 0xD1, 0xCE];

pub fn detect_endian(magic: [u8; 4]) -> Option<Endian> {
    match magic {
        MAGIC_LITTLE => Some(Endian::Little),
        MAGIC_BIG => Some(Endian::Big),
        _ => None,
    }
}

/// Hash a keyword-pool name the way descriptors reference it: FNV-1 with
/// offset basis 5381 and prime 33, truncated to 32 bits.
pub fn keyword_hash(keyword: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in keyword.bytes() {
        hash = hash.wrapping_mul(33) ^ u32::from(b);
    }
    hash
}

/// The eleven words that follow the magic.
#[binread]
#[derive(Debug, Clone)]
pub struct Header {
    /// Absolute offset of the string section.
    pub abs_string_offset: u32,
    /// Byte length from the string section start to EOF.
    pub len_string_to_eof: u32,
    /// Number of external GUID pairs.
    pub num_guid: u32,
    pub null: u32,
    pub num_instance_repeater: u32,
    pub num_complex: u32,
    pub num_field: u32,
    /// Length of the keyword pool, padding included.
    pub len_name: u32,
    /// Length of the string section, padding included.
    pub len_string: u32,
    pub num_array_repeater: u32,
    /// Length of the instance payload; the array payload follows it.
    pub len_payload: u32,
}

/// The 5-bit tag selecting a field's value encoding.
#[derive(FromRepr, Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FieldKind {
    Void = 0x0,
    DbObject = 0x1,
    ValueType = 0x2,
    Class = 0x3,
    Array = 0x4,
    FixedArray = 0x5,
    String = 0x6,
    CString = 0x7,
    Enum = 0x8,
    FileRef = 0x9,
    Boolean = 0xA,
    Int8 = 0xB,
    UInt8 = 0xC,
    Int16 = 0xD,
    UInt16 = 0xE,
    Int32 = 0xF,
    UInt32 = 0x10,
    Int64 = 0x11,
    UInt64 = 0x12,
    Float32 = 0x13,
    Float64 = 0x14,
    Guid = 0x15,
    Sha1 = 0x16,
}

#[binread]
#[derive(Debug)]
struct RawFieldDescriptor {
    name_hash: u32,
    #[br(temp, map = BitArray::new)]
    type_bits: BitArray<u16, Lsb0>,
    #[br(calc = type_bits[4..9].load_le::<u8>())]
    kind_code: u8,
    ref_index: u16,
    offset: u32,
    secondary_offset: u32,
}

#[binread]
#[derive(Debug)]
struct RawComplexDescriptor {
    name_hash: u32,
    field_start_index: u32,
    num_field: u8,
    alignment: u8,
    type_code: u16,
    size: u16,
    secondary_size: u16,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind_code: u8,
    /// Index of the complex this field nests, when its kind has one.
    pub ref_index: u16,
    /// Offset in the payload, relative to the enclosing complex.
    pub offset: u32,
    pub secondary_offset: u32,
}

impl FieldDescriptor {
    pub fn kind(&self) -> Option<FieldKind> {
        FieldKind::from_repr(self.kind_code)
    }
}

#[derive(Debug, Clone)]
pub struct ComplexDescriptor {
    pub name: String,
    pub field_start_index: u32,
    pub num_field: u8,
    pub alignment: u8,
    pub type_code: u16,
    /// Total payload length of the complex.
    pub size: u16,
    pub secondary_size: u16,
}

#[binread]
#[derive(Debug, Clone, Copy)]
pub struct InstanceRepeater {
    // Always observed as zero.
    #[br(temp)]
    internal_count: u32,
    pub repetitions: u32,
    pub complex_index: u32,
}

#[binread]
#[derive(Debug, Clone, Copy)]
pub struct ArrayRepeater {
    /// Offset in the array payload section.
    pub offset: u32,
    pub repetitions: u32,
    pub complex_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Inline complex: Void and ValueType fields, plus array wrappers.
    Complex(Complex),
    /// Raw Class reference word, resolved through [`Dbx::link`].
    ClassRef(u32),
    /// CString and FileRef; `None` is the null string.
    CString(Option<String>),
    /// Raw value plus the label resolved from the enum complex, when any.
    Enum { value: i32, label: Option<String> },
    Boolean(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Guid(Guid),
    Sha1(Sha1),
}

impl Value {
    pub fn as_complex(&self) -> Option<&Complex> {
        match self {
            Self::Complex(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_ref(&self) -> Option<u32> {
        match self {
            Self::ClassRef(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::CString(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_guid(&self) -> Option<Guid> {
        match self {
            Self::Guid(g) => Some(*g),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v) => Some(i64::from(*v)),
            Self::UInt8(v) => Some(i64::from(*v)),
            Self::Int16(v) => Some(i64::from(*v)),
            Self::UInt16(v) => Some(i64::from(*v)),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::UInt32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt64(v) => Some(*v),
            other => other.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Complex {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Complex {
    /// A direct child field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Navigate a `/`-separated path whose final segment names a field.
    /// Intermediate segments are written `field::Complex` and descend into
    /// nested complexes.
    pub fn get_field(&self, path: &str) -> Result<&Field, FrostpackError> {
        let mut segments: Vec<&str> = path.split('/').collect();
        let last = segments.pop().unwrap_or(path);
        let mut current = self;
        for segment in segments {
            current = current.child_complex(segment).ok_or_else(|| {
                FrostpackError::Custom(format!(
                    "Could not find complex '{segment}' (full path '{path}')"
                ))
            })?;
        }
        current.field(last).ok_or_else(|| {
            FrostpackError::Custom(format!("Could not find field '{last}' (full path '{path}')"))
        })
    }

    /// Navigate a `/`-separated path of `field::Complex` segments.
    pub fn get_complex(&self, path: &str) -> Result<&Complex, FrostpackError> {
        let mut current = self;
        for segment in path.split('/') {
            current = current.child_complex(segment).ok_or_else(|| {
                FrostpackError::Custom(format!(
                    "Could not find complex '{segment}' (full path '{path}')"
                ))
            })?;
        }
        Ok(current)
    }

    fn child_complex(&self, segment: &str) -> Option<&Complex> {
        self.fields.iter().find_map(|f| {
            if !matches!(
                f.kind,
                FieldKind::Void | FieldKind::ValueType | FieldKind::Array
            ) {
                return None;
            }
            match &f.value {
                Value::Complex(c) if format!("{}::{}", f.name, c.name) == segment => Some(c),
                _ => None,
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub guid: Guid,
    pub complex: Complex,
}

/// A fully decoded EBX file. Immutable once built.
#[derive(Debug)]
pub struct Dbx {
    pub big_endian: bool,
    pub file_guid: Guid,
    pub primary_instance_guid: Guid,
    pub external_guids: Vec<(Guid, Guid)>,
    /// Every instance GUID, in payload order.
    pub internal_guids: Vec<Guid>,
    pub instances: Vec<Instance>,
    primary: Option<usize>,
    /// Logical name: the primary instance's `Name` field when present,
    /// else the relative input path.
    pub true_filename: String,
}

impl Dbx {
    pub fn read_file(path: &Path, logical_name: &str) -> Result<Dbx, FrostpackError> {
        let f = fsutil::open_input(path)?;
        Self::read(&mut BufReader::new(f), path, logical_name)
    }

    pub fn read<R: Read + Seek>(
        reader: &mut R,
        src: &Path,
        logical_name: &str,
    ) -> Result<Dbx, FrostpackError> {
        Parser::parse(reader, src, logical_name)
            .map_err(|e| e.add_context(format!("Couldn't decode EBX '{}'", src.display())))
    }

    pub fn primary_instance(&self) -> Option<&Instance> {
        self.primary.map(|i| &self.instances[i])
    }

    /// Resolve a Class field to its target instance.
    pub fn link(
        &self,
        field: &Field,
        env: &EbxEnvironment,
    ) -> Result<LinkedInstance, FrostpackError> {
        if field.kind != FieldKind::Class {
            return Err(FrostpackError::Custom(format!(
                "Invalid link, field '{}' has kind {:?} in '{}'",
                field.name, field.kind, self.true_filename
            )));
        }
        let Some(value) = field.value.as_class_ref() else {
            return Err(FrostpackError::Custom(format!(
                "Invalid link, field '{}' carries no reference in '{}'",
                field.name, self.true_filename
            )));
        };

        if value >> 31 != 0 {
            let index = (value & 0x7FFF_FFFF) as usize;
            let (file_guid, instance_guid) =
                self.external_guids.get(index).copied().ok_or_else(|| {
                    FrostpackError::Custom(format!(
                        "External reference {index} out of range in '{}'",
                        self.true_filename
                    ))
                })?;
            let target = env.resolve_file(file_guid).map_err(|e| {
                e.add_context(format!(
                    "Resolving link from field '{}' in '{}'",
                    field.name, self.true_filename
                ))
            })?;
            let instance = target
                .instances
                .iter()
                .position(|i| i.guid == instance_guid)
                .ok_or_else(|| {
                    FrostpackError::Custom(format!(
                        "No instance {} in '{}'",
                        instance_guid, target.true_filename
                    ))
                })?;
            Ok(LinkedInstance::External(target, instance))
        } else if value != 0 {
            let guid = self
                .internal_guids
                .get(value as usize - 1)
                .copied()
                .ok_or_else(|| {
                    FrostpackError::Custom(format!(
                        "Internal reference {value} out of range in '{}'",
                        self.true_filename
                    ))
                })?;
            let instance = self
                .instances
                .iter()
                .position(|i| i.guid == guid)
                .ok_or_else(|| {
                    FrostpackError::Custom(format!(
                        "No instance {} in '{}'",
                        guid, self.true_filename
                    ))
                })?;
            Ok(LinkedInstance::Internal(instance))
        } else {
            Err(FrostpackError::Custom(format!(
                "Null GUID link for field '{}' in '{}'",
                field.name, self.true_filename
            )))
        }
    }
}

/// A resolved Class reference.
#[derive(Debug)]
pub enum LinkedInstance {
    Internal(usize),
    External(Arc<Dbx>, usize),
}

impl LinkedInstance {
    pub fn complex<'a>(&'a self, owner: &'a Dbx) -> &'a Complex {
        match self {
            Self::Internal(i) => &owner.instances[*i].complex,
            Self::External(dbx, i) => &dbx.instances[*i].complex,
        }
    }
}

/// Shared state for cross-file link resolution: the extracted EBX root,
/// the GUID table addressing it, and a cache of parsed files.
pub struct EbxEnvironment {
    ebx_root: PathBuf,
    guid_table: GuidTable,
    parsed: RwLock<HashMap<Guid, Arc<Dbx>>>,
}

impl EbxEnvironment {
    pub fn new(ebx_root: PathBuf, guid_table: GuidTable) -> Self {
        Self {
            ebx_root,
            guid_table,
            parsed: RwLock::new(HashMap::new()),
        }
    }

    pub fn ebx_root(&self) -> &Path {
        &self.ebx_root
    }

    pub fn guid_table(&self) -> &GuidTable {
        &self.guid_table
    }

    /// Parse the EBX owning `file_guid`, or fetch the cached parse.
    pub fn resolve_file(&self, file_guid: Guid) -> Result<Arc<Dbx>, FrostpackError> {
        // Pass one: check with read lock.
        {
            let parsed = self.parsed.read();
            if let Some(v) = parsed.get(&file_guid) {
                return Ok(Arc::clone(v));
            }
        }

        // Pass two: try again with upgradable read lock.
        let parsed = self.parsed.upgradable_read();
        if let Some(v) = parsed.get(&file_guid) {
            return Ok(Arc::clone(v));
        }
        // Pass three: parse it under upgradable read lock, and then write
        // lock to save it.
        let name = self.guid_table.get(&file_guid).ok_or_else(|| {
            FrostpackError::MissingDependency(format!("No GUID table entry for {file_guid}"))
        })?;
        let path = self.ebx_root.join(format!("{name}.ebx"));
        let dbx = Arc::new(Dbx::read_file(&path, name)?);
        let mut parsed = RwLockUpgradableReadGuard::upgrade(parsed);
        parsed.insert(file_guid, Arc::clone(&dbx));
        Ok(dbx)
    }

    /// Parse an EBX by path and cache it under its file GUID so later
    /// links back into it are free.
    pub fn open(&self, path: &Path, logical_name: &str) -> Result<Arc<Dbx>, FrostpackError> {
        let dbx = Arc::new(Dbx::read_file(path, logical_name)?);
        self.parsed.write().insert(dbx.file_guid, Arc::clone(&dbx));
        Ok(dbx)
    }
}

struct Parser<'a, R> {
    reader: &'a mut R,
    endian: Endian,
    src: &'a Path,
    string_section: u64,
    array_section: u64,
    field_descriptors: Vec<FieldDescriptor>,
    complex_descriptors: Vec<ComplexDescriptor>,
    array_repeaters: Vec<ArrayRepeater>,
    enumerations: HashMap<u16, HashMap<i32, String>>,
    true_filename: String,
    is_primary_instance: bool,
}

impl<'a, R: Read + Seek> Parser<'a, R> {
    fn parse(reader: &'a mut R, src: &'a Path, logical_name: &str) -> Result<Dbx, FrostpackError> {
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| FrostpackError::Io("Couldn't read EBX magic".into(), e))?;
        let endian = detect_endian(magic)
            .ok_or_else(|| FrostpackError::invalid_format(src, 0, "not an EBX file"))?;
        let berr = |e| FrostpackError::BinRW("Couldn't read EBX tables".into(), e);

        let header: Header = reader.read_type(endian).map_err(berr)?;
        let string_section = u64::from(header.abs_string_offset);
        let array_section =
            string_section + u64::from(header.len_string) + u64::from(header.len_payload);

        let file_guid: Guid = reader.read_type(endian).map_err(berr)?;
        let primary_instance_guid: Guid = reader.read_type(endian).map_err(berr)?;
        let external_guids = (0..header.num_guid)
            .map(|_| {
                let file: Guid = reader.read_type(endian)?;
                let instance: Guid = reader.read_type(endian)?;
                Ok((file, instance))
            })
            .collect::<Result<Vec<_>, binrw::Error>>()
            .map_err(berr)?;

        let mut pool = vec![0u8; header.len_name as usize];
        reader
            .read_exact(&mut pool)
            .map_err(|e| FrostpackError::Io("Couldn't read EBX keyword pool".into(), e))?;
        let pool = String::from_utf8(pool).map_err(|_| {
            FrostpackError::invalid_format(src, string_section, "keyword pool is not valid UTF-8")
        })?;
        let keywords: HashMap<u32, String> = pool
            .split('\0')
            .map(|kw| (keyword_hash(kw), kw.to_string()))
            .collect();
        let resolve = |hash: u32, what: &str, at: u64| {
            keywords.get(&hash).cloned().ok_or_else(|| {
                FrostpackError::invalid_format(
                    src,
                    at,
                    format!("{what} name hash {hash:#010x} has no keyword"),
                )
            })
        };

        let mut field_descriptors = Vec::with_capacity(header.num_field as usize);
        for _ in 0..header.num_field {
            let at = reader.stream_position().unwrap_or_default();
            let raw: RawFieldDescriptor = reader.read_type(endian).map_err(berr)?;
            field_descriptors.push(FieldDescriptor {
                name: resolve(raw.name_hash, "field", at)?,
                kind_code: raw.kind_code,
                ref_index: raw.ref_index,
                offset: raw.offset,
                secondary_offset: raw.secondary_offset,
            });
        }

        let mut complex_descriptors = Vec::with_capacity(header.num_complex as usize);
        for _ in 0..header.num_complex {
            let at = reader.stream_position().unwrap_or_default();
            let raw: RawComplexDescriptor = reader.read_type(endian).map_err(berr)?;
            complex_descriptors.push(ComplexDescriptor {
                name: resolve(raw.name_hash, "complex", at)?,
                field_start_index: raw.field_start_index,
                num_field: raw.num_field,
                alignment: raw.alignment,
                type_code: raw.type_code,
                size: raw.size,
                secondary_size: raw.secondary_size,
            });
        }

        let instance_repeaters = (0..header.num_instance_repeater)
            .map(|_| reader.read_type::<InstanceRepeater>(endian))
            .collect::<Result<Vec<_>, _>>()
            .map_err(berr)?;

        // The array repeater table is 16-byte aligned.
        let pos = reader
            .stream_position()
            .map_err(|e| FrostpackError::Io("Couldn't read EBX position".into(), e))?;
        reader
            .seek(SeekFrom::Current(((16 - pos % 16) % 16) as i64))
            .map_err(|e| FrostpackError::Io("Couldn't align EBX reader".into(), e))?;
        let array_repeaters = (0..header.num_array_repeater)
            .map(|_| reader.read_type::<ArrayRepeater>(endian))
            .collect::<Result<Vec<_>, _>>()
            .map_err(berr)?;

        let mut parser = Parser {
            reader,
            endian,
            src,
            string_section,
            array_section,
            field_descriptors,
            complex_descriptors,
            array_repeaters,
            enumerations: HashMap::new(),
            true_filename: String::new(),
            is_primary_instance: false,
        };

        parser.seek(string_section + u64::from(header.len_string))?;
        let mut internal_guids = Vec::new();
        let mut instances = Vec::new();
        for repeater in &instance_repeaters {
            for _ in 0..repeater.repetitions {
                let guid: Guid = parser.reader.read_type(endian).map_err(berr)?;
                internal_guids.push(guid);
                parser.is_primary_instance = guid == primary_instance_guid;
                let complex = parser.read_complex(repeater.complex_index as usize)?;
                instances.push(Instance { guid, complex });
            }
        }

        let mut true_filename = parser.true_filename;
        if true_filename.is_empty() {
            true_filename = logical_name.to_string();
        }
        let primary = instances
            .iter()
            .position(|i| i.guid == primary_instance_guid);
        Ok(Dbx {
            big_endian: endian == Endian::Big,
            file_guid,
            primary_instance_guid,
            external_guids,
            internal_guids,
            instances,
            primary,
            true_filename,
        })
    }

    fn pos(&mut self) -> u64 {
        self.reader.stream_position().unwrap_or_default()
    }

    fn seek(&mut self, to: u64) -> Result<(), FrostpackError> {
        self.reader
            .seek(SeekFrom::Start(to))
            .map_err(|e| FrostpackError::Io("Couldn't seek EBX payload".into(), e))?;
        Ok(())
    }

    fn read_complex(&mut self, complex_index: usize) -> Result<Complex, FrostpackError> {
        let desc = self
            .complex_descriptors
            .get(complex_index)
            .cloned()
            .ok_or_else(|| {
                FrostpackError::invalid_format(
                    self.src,
                    self.reader.stream_position().unwrap_or_default(),
                    format!("complex index {complex_index} out of range"),
                )
            })?;
        let start = self.pos();
        let first = desc.field_start_index as usize;
        let mut fields = Vec::with_capacity(desc.num_field as usize);
        for field_index in first..first + desc.num_field as usize {
            let fd = self
                .field_descriptors
                .get(field_index)
                .cloned()
                .ok_or_else(|| {
                    FrostpackError::invalid_format(
                        self.src,
                        start,
                        format!("field index {field_index} out of range"),
                    )
                })?;
            self.seek(start + u64::from(fd.offset))?;
            fields.push(self.read_field(&fd)?);
        }
        // Trailing padding up to the declared size is tolerated.
        self.seek(start + u64::from(desc.size))?;
        Ok(Complex {
            name: desc.name,
            fields,
        })
    }

    fn read_field(&mut self, fd: &FieldDescriptor) -> Result<Field, FrostpackError> {
        let at = self.pos();
        let kind = FieldKind::from_repr(fd.kind_code).ok_or_else(|| {
            FrostpackError::invalid_format(
                self.src,
                at,
                format!("unknown field kind {:#04x}", fd.kind_code),
            )
        })?;
        let e = self.endian;
        let value = match kind {
            FieldKind::Void | FieldKind::ValueType => {
                Value::Complex(self.read_complex(fd.ref_index as usize)?)
            }
            FieldKind::Class => {
                Value::ClassRef(self.reader.read_type::<u32>(e).map_err(payload_err)?)
            }
            FieldKind::Array => self.read_array_field(fd)?,
            FieldKind::CString | FieldKind::FileRef => self.read_string_field(fd)?,
            FieldKind::Enum => {
                let value: i32 = self.reader.read_type(e).map_err(payload_err)?;
                let label = self.enumeration(fd.ref_index)?.get(&value).cloned();
                Value::Enum { value, label }
            }
            FieldKind::Boolean => {
                Value::Boolean(self.reader.read_type::<u8>(e).map_err(payload_err)? != 0)
            }
            FieldKind::Int8 => Value::Int8(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::UInt8 => Value::UInt8(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::Int16 => Value::Int16(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::UInt16 => Value::UInt16(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::Int32 => Value::Int32(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::UInt32 => Value::UInt32(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::Int64 => Value::Int64(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::UInt64 => Value::UInt64(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::Float32 => Value::Float32(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::Float64 => Value::Float64(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::Guid => Value::Guid(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::Sha1 => Value::Sha1(self.reader.read_type(e).map_err(payload_err)?),
            FieldKind::DbObject | FieldKind::String | FieldKind::FixedArray => {
                return Err(FrostpackError::invalid_format(
                    self.src,
                    at,
                    format!("unhandled field kind {kind:?} for field '{}'", fd.name),
                ))
            }
        };
        Ok(Field {
            name: fd.name.clone(),
            kind,
            value,
        })
    }

    fn read_array_field(&mut self, fd: &FieldDescriptor) -> Result<Value, FrostpackError> {
        let at = self.pos();
        let repeater_index: u32 = self
            .reader
            .read_type(self.endian)
            .map_err(payload_err)?;
        let repeater = self
            .array_repeaters
            .get(repeater_index as usize)
            .copied()
            .ok_or_else(|| {
                FrostpackError::invalid_format(
                    self.src,
                    at,
                    format!("array repeater {repeater_index} out of range"),
                )
            })?;
        let desc = self
            .complex_descriptors
            .get(fd.ref_index as usize)
            .cloned()
            .ok_or_else(|| {
                FrostpackError::invalid_format(
                    self.src,
                    at,
                    format!("array complex {} out of range", fd.ref_index),
                )
            })?;

        self.seek(self.array_section + u64::from(repeater.offset))?;
        let mut fields = Vec::with_capacity(repeater.repetitions as usize);
        if repeater.repetitions > 0 {
            let element = self
                .field_descriptors
                .get(desc.field_start_index as usize)
                .cloned()
                .ok_or_else(|| {
                    FrostpackError::invalid_format(
                        self.src,
                        at,
                        format!("array element field {} out of range", desc.field_start_index),
                    )
                })?;
            for _ in 0..repeater.repetitions {
                fields.push(self.read_field(&element)?);
            }
        }
        Ok(Value::Complex(Complex {
            name: desc.name,
            fields,
        }))
    }

    fn read_string_field(&mut self, fd: &FieldDescriptor) -> Result<Value, FrostpackError> {
        let start = self.pos();
        let string_offset: i32 = self
            .reader
            .read_type(self.endian)
            .map_err(payload_err)?;
        if string_offset == -1 {
            return Ok(Value::CString(None));
        }
        let target = i64::try_from(self.string_section)
            .ok()
            .map(|base| base + i64::from(string_offset))
            .filter(|t| *t >= 0)
            .ok_or_else(|| {
                FrostpackError::invalid_format(
                    self.src,
                    start,
                    format!("string offset {string_offset} out of range"),
                )
            })?;
        self.seek(target as u64)?;

        let mut data = Vec::new();
        loop {
            let mut b = [0u8; 1];
            self.reader
                .read_exact(&mut b)
                .map_err(|e| FrostpackError::Io("Couldn't read EBX string".into(), e))?;
            if b[0] == 0 {
                break;
            }
            data.push(b[0]);
        }
        let value = String::from_utf8(data).map_err(|_| {
            FrostpackError::invalid_format(self.src, target as u64, "string is not valid UTF-8")
        })?;
        self.seek(start + 4)?;

        if self.is_primary_instance && fd.name == "Name" && self.true_filename.is_empty() {
            self.true_filename = value.clone();
        }
        Ok(Value::CString(Some(value)))
    }

    /// Enum complexes map member field offsets to labels; built lazily
    /// per referenced complex.
    fn enumeration(&mut self, ref_index: u16) -> Result<&HashMap<i32, String>, FrostpackError> {
        let Parser {
            enumerations,
            complex_descriptors,
            field_descriptors,
            src,
            ..
        } = self;
        match enumerations.entry(ref_index) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let desc = complex_descriptors
                    .get(ref_index as usize)
                    .ok_or_else(|| {
                        FrostpackError::invalid_format(
                            &**src,
                            0,
                            format!("enum complex {ref_index} out of range"),
                        )
                    })?;
                let first = desc.field_start_index as usize;
                let mut values = HashMap::new();
                for index in first..first + desc.num_field as usize {
                    let fd = field_descriptors.get(index).ok_or_else(|| {
                        FrostpackError::invalid_format(
                            &**src,
                            0,
                            format!("enum member field {index} out of range"),
                        )
                    })?;
                    values.insert(fd.offset as i32, fd.name.clone());
                }
                Ok(entry.insert(values))
            }
        }
    }
}

fn payload_err(e: binrw::Error) -> FrostpackError {
    FrostpackError::BinRW("Couldn't read EBX payload".into(), e)
}

/// Sniff whether a file is EBX without parsing it: used both by the GUID
/// table's fast mode and by full scans to skip foreign files.
pub(crate) fn read_file_guid(path: &Path) -> Result<Option<Guid>, FrostpackError> {
    let mut f = fsutil::open_input(path)?;
    let mut magic = [0u8; 4];
    if f.read_exact(&mut magic).is_err() {
        return Ok(None);
    }
    let Some(endian) = detect_endian(magic) else {
        return Ok(None);
    };
    // The file GUID sits right after the header words.
    f.seek(SeekFrom::Start(48))
        .map_err(|e| FrostpackError::Io("Couldn't seek to file GUID".into(), e))?;
    let guid: Guid = f
        .read_type(endian)
        .map_err(|e| FrostpackError::BinRW("Couldn't read file GUID".into(), e))?;
    Ok(Some(guid))
}
