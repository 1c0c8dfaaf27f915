//! Non-CAS bundles: payloads live directly inside the superbundle at
//! offsets given by a small big-endian table. Patched TOCs replace the
//! table's bundle with a delta stream that splices runs from the
//! unpatched superbundle, the patched stream itself, and `common.dat`.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use binrw::{binread, BinReaderExt, NullString};

use crate::error::FrostpackError;
use crate::guid::Guid;

/// Header (16 bytes) ahead of a delta record run.
#[binread]
#[derive(Debug, Copy, Clone)]
#[br(big)]
pub struct DeltaHeader {
    /// Total byte length of the delta records that follow.
    pub delta_size: u32,
    pub magic: u32,
    pub padding: u64,
}

/// One 16-byte splice directive.
#[binread]
#[derive(Debug, Copy, Clone)]
#[br(big)]
pub struct Delta {
    pub size: u32,
    pub typ: i32,
    pub offset: u64,
}

impl DeltaHeader {
    pub fn record_count(&self) -> u32 {
        self.delta_size / 16
    }
}

#[binread]
#[derive(Debug)]
#[br(big, magic = 0x970D1C13u32)]
pub struct Bundle {
    #[br(temp)]
    num_ebx: u32,
    #[br(temp)]
    num_res: u32,
    #[br(temp)]
    num_chunks: u32,
    #[br(args { count: num_ebx as usize })]
    pub ebx_entries: Vec<BundleEntry>,
    #[br(args { count: num_res as usize })]
    pub res_entries: Vec<BundleEntry>,
    #[br(args { count: num_chunks as usize })]
    pub chunk_entries: Vec<ChunkEntry>,
}

#[binread]
#[derive(Debug)]
#[br(big)]
pub struct BundleEntry {
    #[br(map = |s: NullString| s.to_string())]
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub original_size: u32,
}

#[binread]
#[derive(Debug)]
#[br(big)]
pub struct ChunkEntry {
    pub id: Guid,
    pub offset: u32,
    pub size: u32,
}

impl Bundle {
    /// Parse the bundle tables at the reader's current position.
    pub fn read<R: Read + Seek>(reader: &mut R, src: &Path) -> Result<Self, FrostpackError> {
        let offset = reader.stream_position().unwrap_or_default();
        reader.read_be::<Bundle>().map_err(|e| {
            FrostpackError::invalid_format(src, offset, format!("bad bundle tables: {e}"))
        })
    }
}

/// Read the delta records announced by `header` from the patched stream.
pub fn read_deltas<R: Read + Seek>(
    reader: &mut R,
    header: &DeltaHeader,
    src: &Path,
) -> Result<Vec<Delta>, FrostpackError> {
    (0..header.record_count())
        .map(|_| {
            reader
                .read_be::<Delta>()
                .map_err(|e| FrostpackError::BinRW(format!("Couldn't read delta in '{}'", src.display()), e))
        })
        .collect()
}

/// Rebuild a patched bundle in memory. The patched stream must be
/// positioned just past the delta records; type-0 runs consume it
/// sequentially.
pub fn synthesize_patched_bundle<P, U, C>(
    patched: &mut P,
    deltas: &[Delta],
    unpatched: &mut U,
    mut common_dat: Option<&mut C>,
    src: &Path,
    bundle_offset: u64,
) -> Result<Vec<u8>, FrostpackError>
where
    P: Read + Seek,
    U: Read + Seek,
    C: Read + Seek,
{
    let mut out = Vec::new();
    for delta in deltas {
        match delta.typ {
            1 => {
                unpatched
                    .seek(SeekFrom::Start(delta.offset))
                    .map_err(|e| FrostpackError::Io("Couldn't seek unpatched superbundle".into(), e))?;
                copy_run(unpatched, delta.size, &mut out)?;
            }
            0 => {
                copy_run(patched, delta.size, &mut out)?;
            }
            -1 => match common_dat.as_mut() {
                Some(common) => {
                    common
                        .seek(SeekFrom::Start(delta.offset))
                        .map_err(|e| FrostpackError::Io("Couldn't seek common.dat".into(), e))?;
                    copy_run(&mut **common, delta.size, &mut out)?;
                }
                None => {
                    return Err(FrostpackError::MissingDependency(
                        "Found delta type -1 without common.dat present".into(),
                    ))
                }
            },
            other => {
                return Err(FrostpackError::invalid_format(
                    src,
                    bundle_offset,
                    format!("unknown delta type {other} in patched bundle"),
                ))
            }
        }
    }
    Ok(out)
}

fn copy_run<R: Read>(reader: &mut R, size: u32, out: &mut Vec<u8>) -> Result<(), FrostpackError> {
    std::io::copy(&mut reader.take(u64::from(size)), out)
        .map_err(|e| FrostpackError::Io("Couldn't copy delta run".into(), e))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod noncas_tests {
    use std::io::Cursor;
    use std::path::Path;

    use super::*;
    use crate::error::FrostpackError;

    pub(crate) fn encode_bundle(
        ebx: &[(&str, u32, u32, u32)],
        res: &[(&str, u32, u32, u32)],
        chunks: &[(Guid, u32, u32)],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x970D1C13u32.to_be_bytes());
        out.extend_from_slice(&(ebx.len() as u32).to_be_bytes());
        out.extend_from_slice(&(res.len() as u32).to_be_bytes());
        out.extend_from_slice(&(chunks.len() as u32).to_be_bytes());
        for (name, offset, size, original_size) in ebx.iter().chain(res) {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(&original_size.to_be_bytes());
        }
        for (id, offset, size) in chunks {
            out.extend_from_slice(&id.val.0.to_be_bytes());
            out.extend_from_slice(&id.val.1.to_be_bytes());
            out.extend_from_slice(&id.val.2.to_be_bytes());
            out.extend_from_slice(&id.val.3.to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
        }
        out
    }

    #[test]
    fn bundle_tables_parse() {
        let id = Guid {
            val: (9, 8, 7, 0x11),
        };
        let encoded = encode_bundle(
            &[("levels/sp_01", 64, 10, 10)],
            &[("textures/car", 80, 6, 12)],
            &[(id, 96, 4)],
        );
        let bundle = Bundle::read(&mut Cursor::new(encoded), Path::new("t.sb")).unwrap();
        assert_eq!(bundle.ebx_entries.len(), 1);
        assert_eq!(bundle.ebx_entries[0].name, "levels/sp_01");
        assert_eq!(bundle.ebx_entries[0].offset, 64);
        assert_eq!(bundle.res_entries[0].original_size, 12);
        assert_eq!(bundle.chunk_entries[0].id, id);
        assert_eq!(bundle.chunk_entries[0].size, 4);
    }

    #[test]
    fn bad_magic_is_invalid_format() {
        let err = Bundle::read(&mut Cursor::new(vec![0u8; 16]), Path::new("t.sb"));
        assert!(matches!(
            err,
            Err(FrostpackError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn delta_synthesis_splices_three_sources() {
        let deltas = [
            Delta {
                size: 4,
                typ: 1,
                offset: 0,
            },
            Delta {
                size: 4,
                typ: 0,
                offset: 0,
            },
            Delta {
                size: 4,
                typ: -1,
                offset: 0,
            },
        ];
        let mut patched = Cursor::new(b"BBBB".to_vec());
        let mut unpatched = Cursor::new(b"AAAA....".to_vec());
        let mut common = Cursor::new(b"CCCC".to_vec());
        let out = synthesize_patched_bundle(
            &mut patched,
            &deltas,
            &mut unpatched,
            Some(&mut common),
            Path::new("t.sb"),
            0,
        )
        .unwrap();
        assert_eq!(out, b"AAAABBBBCCCC");
    }

    #[test]
    fn missing_common_dat_is_fatal() {
        let deltas = [Delta {
            size: 4,
            typ: -1,
            offset: 0,
        }];
        let mut patched = Cursor::new(Vec::new());
        let mut unpatched = Cursor::new(Vec::new());
        let err = synthesize_patched_bundle::<_, _, Cursor<Vec<u8>>>(
            &mut patched,
            &deltas,
            &mut unpatched,
            None,
            Path::new("t.sb"),
            0,
        );
        assert!(matches!(err, Err(FrostpackError::MissingDependency(_))));
    }

    #[test]
    fn unknown_delta_type_is_fatal() {
        let deltas = [Delta {
            size: 4,
            typ: 3,
            offset: 0,
        }];
        let mut patched = Cursor::new(Vec::new());
        let mut unpatched = Cursor::new(Vec::new());
        let err = synthesize_patched_bundle::<_, _, Cursor<Vec<u8>>>(
            &mut patched,
            &deltas,
            &mut unpatched,
            None,
            Path::new("t.sb"),
            0x40,
        );
        assert!(matches!(err, Err(FrostpackError::InvalidFormat { .. })));
    }
}
