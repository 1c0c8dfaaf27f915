//! Streamed audio assembly. A `SoundWaveAsset` names ordered chunks and
//! variations; each variation's segments index SPS streams inside a
//! chunk file, which are copied out block by block.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use binrw::BinReaderExt;

use crate::ebx::{Complex, Dbx, EbxEnvironment};
use crate::error::FrostpackError;
use crate::fsutil;
use crate::guid::Guid;

use super::{AssetDirs, AssetDriver};

const SPS_HEADER_BLOCK: u32 = 0x48;
const SPS_TERMINATOR_BLOCK: u32 = 0x45;

pub struct SoundWaveDriver;

struct ChunkRef {
    id: Guid,
    size: u64,
}

struct Segment {
    samples_offset: u64,
    seek_table_offset: u64,
    segment_length: u64,
}

struct Variation {
    chunk_id: Guid,
    chunk_index: u32,
    /// Small per-chunk ordinal, not the raw variation index.
    index: u32,
    segments: Vec<Segment>,
}

impl AssetDriver for SoundWaveDriver {
    fn wants(&self, primary_name: &str) -> bool {
        primary_name == "SoundWaveAsset"
    }

    fn extract(
        &self,
        dbx: &Dbx,
        env: &EbxEnvironment,
        dirs: &AssetDirs,
    ) -> Result<(), FrostpackError> {
        log::info!("{}", dbx.true_filename);
        let Some(primary) = dbx.primary_instance() else {
            return Ok(());
        };
        let prim = &primary.complex;
        let file = dbx.true_filename.as_str();

        let chunks = prim
            .get_complex("$::SoundDataAsset/Chunks::array")
            .map_err(|e| e.add_context(format!("In '{file}'")))?
            .fields
            .iter()
            .map(|member| {
                let c = complex_of(member.value.as_complex(), "Chunks member", file)?;
                Ok(ChunkRef {
                    id: guid_of(c, "ChunkId", file)?,
                    size: u64_of(c, "ChunkSize", file)?,
                })
            })
            .collect::<Result<Vec<_>, FrostpackError>>()?;

        let variation_refs = prim
            .get_complex("Variations::array")
            .map_err(|e| e.add_context(format!("In '{file}'")))?;

        let mut histogram = HashMap::new();
        let mut variations = Vec::new();
        for link_field in &variation_refs.fields {
            let linked = dbx.link(link_field, env)?;
            let var = linked.complex(dbx);
            let chunk_index = u32_of(var, "ChunkIndex", file)?;
            let first_loop = i64_of(var, "FirstLoopSegmentIndex", file)?;
            let last_loop = i64_of(var, "LastLoopSegmentIndex", file)?;
            let segments = var
                .get_complex("Segments::array")
                .map_err(|e| e.add_context(format!("In '{file}'")))?
                .fields
                .iter()
                .map(|member| {
                    let c = complex_of(member.value.as_complex(), "Segments member", file)?;
                    Ok(Segment {
                        samples_offset: u64_of(c, "SamplesOffset", file)?,
                        seek_table_offset: u64_of(c, "SeekTableOffset", file)?,
                        segment_length: u64_of(c, "SegmentLength", file)?,
                    })
                })
                .collect::<Result<Vec<_>, FrostpackError>>()?;

            let chunk = chunks.get(chunk_index as usize).ok_or_else(|| {
                FrostpackError::Custom(format!(
                    "Variation chunk index {chunk_index} out of range in '{file}'"
                ))
            })?;
            let index = next_variation_index(&mut histogram, chunk_index);
            log::debug!(
                "Variation {index} on chunk {chunk_index} ({} bytes), loop segments {first_loop}..{last_loop}",
                chunk.size
            );
            variations.push(Variation {
                chunk_id: chunk.id,
                chunk_index,
                index,
                segments,
            });
        }

        let multi = chunks.len() > 1 || variations.len() > 1;

        // One handle per distinct chunk for the whole asset.
        let mut handles: HashMap<Guid, (PathBuf, File)> = HashMap::new();
        for var in &variations {
            if !handles.contains_key(&var.chunk_id) {
                let Some(path) = dirs.find_chunk(&var.chunk_id) else {
                    continue;
                };
                let handle = fsutil::open_input(&path)?;
                handles.insert(var.chunk_id, (path, handle));
            }
            let Some((chunk_path, chunk_file)) = handles.get_mut(&var.chunk_id) else {
                continue;
            };

            for (segment_index, segment) in var.segments.iter().enumerate() {
                log::debug!(
                    "Segment {segment_index} at {:#x} (seek table {:#x}, length {})",
                    segment.samples_offset,
                    segment.seek_table_offset,
                    segment.segment_length
                );
                let mut name = dbx.true_filename.clone();
                if multi || var.segments.len() > 1 {
                    name.push_str(&format!(
                        " {} {} {segment_index}",
                        var.chunk_index, var.index
                    ));
                }
                name.push_str(".sps");
                extract_sps(
                    chunk_file,
                    segment.samples_offset,
                    &dirs.output_dir.join(name),
                    chunk_path,
                )?;
            }
        }
        Ok(())
    }
}

/// Assign the small per-chunk ordinal: the first variation using a chunk
/// gets 0, the next 1, and so on, independently per chunk index.
fn next_variation_index(histogram: &mut HashMap<u32, u32>, chunk_index: u32) -> u32 {
    let slot = histogram.entry(chunk_index).or_insert(0);
    let index = *slot;
    *slot += 1;
    index
}

/// Copy one SPS stream starting at `offset` into `target`.
///
/// Blocks carry a 4-byte big-endian header: the high byte is the kind
/// (0x48 header, 0x44 data, 0x45 terminator), the low 24 bits the block
/// size including the header itself. Copying stops after the terminator
/// block is written.
pub fn extract_sps<R: Read + Seek>(
    source: &mut R,
    mut offset: u64,
    target: &Path,
    src: &Path,
) -> Result<(), FrostpackError> {
    source
        .seek(SeekFrom::Start(offset))
        .map_err(|e| FrostpackError::Io("Couldn't seek chunk".into(), e))?;
    let mut first = [0u8; 1];
    source
        .read_exact(&mut first)
        .map_err(|e| FrostpackError::Io("Couldn't read SPS header".into(), e))?;
    if u32::from(first[0]) != SPS_HEADER_BLOCK {
        return Err(FrostpackError::invalid_format(
            src,
            offset,
            "wrong SPS block header",
        ));
    }

    let Some(mut out) = fsutil::create_new_output(target)? else {
        return Ok(());
    };
    loop {
        source
            .seek(SeekFrom::Start(offset))
            .map_err(|e| FrostpackError::Io("Couldn't seek chunk".into(), e))?;
        let header: u32 = source
            .read_be()
            .map_err(|e| FrostpackError::BinRW("Couldn't read SPS block header".into(), e))?;
        let block_id = header >> 24;
        let block_size = u64::from(header & 0x00FF_FFFF);
        if block_size == 0 && block_id != SPS_TERMINATOR_BLOCK {
            return Err(FrostpackError::invalid_format(
                src,
                offset,
                "zero-length SPS block",
            ));
        }
        source
            .seek(SeekFrom::Start(offset))
            .map_err(|e| FrostpackError::Io("Couldn't seek chunk".into(), e))?;
        std::io::copy(&mut (&mut *source).take(block_size), &mut out)
            .map_err(|e| FrostpackError::Io("Couldn't copy SPS block".into(), e))?;
        offset += block_size;
        if block_id == SPS_TERMINATOR_BLOCK {
            break;
        }
    }
    Ok(())
}

fn complex_of<'a>(
    value: Option<&'a Complex>,
    what: &str,
    file: &str,
) -> Result<&'a Complex, FrostpackError> {
    value.ok_or_else(|| FrostpackError::Custom(format!("{what} is not a complex in '{file}'")))
}

fn guid_of(c: &Complex, name: &str, file: &str) -> Result<Guid, FrostpackError> {
    c.get_field(name)?
        .value
        .as_guid()
        .ok_or_else(|| FrostpackError::Custom(format!("Field '{name}' is not a GUID in '{file}'")))
}

fn u64_of(c: &Complex, name: &str, file: &str) -> Result<u64, FrostpackError> {
    c.get_field(name)?
        .value
        .as_u64()
        .ok_or_else(|| {
            FrostpackError::Custom(format!("Field '{name}' is not an integer in '{file}'"))
        })
}

fn u32_of(c: &Complex, name: &str, file: &str) -> Result<u32, FrostpackError> {
    c.get_field(name)?
        .value
        .as_u32()
        .ok_or_else(|| {
            FrostpackError::Custom(format!("Field '{name}' is not an integer in '{file}'"))
        })
}

fn i64_of(c: &Complex, name: &str, file: &str) -> Result<i64, FrostpackError> {
    c.get_field(name)?
        .value
        .as_i64()
        .ok_or_else(|| {
            FrostpackError::Custom(format!("Field '{name}' is not an integer in '{file}'"))
        })
}

#[cfg(test)]
mod sound_tests {
    use std::io::Cursor;
    use std::path::{Path, PathBuf};

    use binrw::Endian;

    use super::super::{AssetDirs, AssetDriver};
    use super::{extract_sps, next_variation_index, SoundWaveDriver};
    use crate::ebx::build::{wguid, wi32, w32, EbxBuilder};
    use crate::ebx::guid_table::GuidTable;
    use crate::ebx::{Dbx, EbxEnvironment};
    use crate::error::FrostpackError;
    use crate::guid::Guid;

    fn sps_stream(data_payload: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x48, 0, 0, 0x08]);
        out.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        out.extend_from_slice(&[0x44, 0, 0, 0x08]);
        out.extend_from_slice(&data_payload);
        out.extend_from_slice(&[0x45, 0, 0, 0x04]);
        out
    }

    #[test]
    fn variation_indices_are_per_chunk_ordinals() {
        let mut histogram = std::collections::HashMap::new();
        let indices: Vec<u32> = [5, 5, 5, 7]
            .into_iter()
            .map(|chunk| next_variation_index(&mut histogram, chunk))
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
    }

    #[test]
    fn sps_blocks_copy_until_the_terminator() {
        let mut chunk = sps_stream(*b"DATA");
        chunk.extend_from_slice(b"TRAILING GARBAGE");

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.sps");
        extract_sps(
            &mut Cursor::new(chunk.clone()),
            0,
            &target,
            Path::new("c.chunk"),
        )
        .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), chunk[..20].to_vec());
    }

    #[test]
    fn sps_header_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_sps(
            &mut Cursor::new(b"not an sps stream".to_vec()),
            0,
            &dir.path().join("out.sps"),
            Path::new("c.chunk"),
        );
        assert!(matches!(err, Err(FrostpackError::InvalidFormat { .. })));
    }

    const CHUNK_GUID: Guid = Guid {
        val: (0xC0, 1, 2, 0x10),
    };

    /// A SoundWaveAsset with one chunk and three variations of one
    /// segment each, pointing at consecutive SPS streams.
    fn sound_wave_fixture() -> Vec<u8> {
        let e = Endian::Little;
        let gp = Guid { val: (1, 0, 0, 1) };
        let gv = [
            Guid { val: (2, 0, 0, 2) },
            Guid { val: (3, 0, 0, 3) },
            Guid { val: (4, 0, 0, 4) },
        ];

        let keywords = vec![
            "SoundWaveAsset",        // 0
            "$",                     // 1
            "SoundDataAsset",        // 2
            "Chunks",                // 3
            "member",                // 4
            "array",                 // 5
            "ChunkId",               // 6
            "ChunkSize",             // 7
            "Variations",            // 8
            "ChunkIndex",            // 9
            "FirstLoopSegmentIndex", // 10
            "LastLoopSegmentIndex",  // 11
            "Segments",              // 12
            "SamplesOffset",         // 13
            "SeekTableOffset",       // 14
            "SegmentLength",         // 15
            "SoundWaveVariation",    // 16
            "SoundChunk",            // 17
            "SegmentData",           // 18
            "Name",                  // 19
        ];
        let field_descriptors = vec![
            (1, 0x0, 1, 0),    // $: Void -> SoundDataAsset
            (19, 0x7, 0, 4),   // Name: CString
            (8, 0x4, 4, 8),    // Variations: Array -> complex 4
            (3, 0x4, 2, 0),    // Chunks: Array -> complex 2
            (4, 0x2, 3, 0),    // member: ValueType -> SoundChunk
            (6, 0x15, 0, 0),   // ChunkId: Guid
            (7, 0x10, 0, 16),  // ChunkSize: UInt32
            (4, 0x3, 0, 0),    // member: Class
            (9, 0xF, 0, 0),    // ChunkIndex: Int32
            (10, 0xF, 0, 4),   // FirstLoopSegmentIndex
            (11, 0xF, 0, 8),   // LastLoopSegmentIndex
            (12, 0x4, 6, 12),  // Segments: Array -> complex 6
            (4, 0x2, 7, 0),    // member: ValueType -> SegmentData
            (13, 0x10, 0, 0),  // SamplesOffset
            (14, 0x10, 0, 4),  // SeekTableOffset
            (15, 0x10, 0, 8),  // SegmentLength
        ];
        let complex_descriptors = vec![
            (0, 0, 3, 12),  // 0: SoundWaveAsset
            (2, 3, 1, 4),   // 1: SoundDataAsset
            (5, 4, 1, 20),  // 2: array of SoundChunk
            (17, 5, 2, 20), // 3: SoundChunk
            (5, 7, 1, 4),   // 4: array of Class refs
            (16, 8, 4, 16), // 5: SoundWaveVariation
            (5, 12, 1, 12), // 6: array of SegmentData
            (18, 13, 3, 12),// 7: SegmentData
        ];

        let mut payload = Vec::new();
        wguid(&mut payload, e, gp);
        w32(&mut payload, e, 0); // $ -> Chunks array repeater 0
        wi32(&mut payload, e, 0); // Name -> "audio/music/track"
        w32(&mut payload, e, 1); // Variations repeater 1
        for (i, guid) in gv.iter().enumerate() {
            wguid(&mut payload, e, *guid);
            wi32(&mut payload, e, 0); // ChunkIndex
            wi32(&mut payload, e, 0); // FirstLoopSegmentIndex
            wi32(&mut payload, e, 0); // LastLoopSegmentIndex
            w32(&mut payload, e, 2 + i as u32); // Segments repeater
        }

        let mut array_payload = Vec::new();
        // Repeater 0: the chunk list.
        wguid(&mut array_payload, e, CHUNK_GUID);
        w32(&mut array_payload, e, 60); // ChunkSize
        // Repeater 1: variation references (internal links 2..4).
        for v in [2u32, 3, 4] {
            w32(&mut array_payload, e, v);
        }
        // Repeaters 2..4: one segment per variation.
        for samples_offset in [0u32, 20, 40] {
            w32(&mut array_payload, e, samples_offset);
            w32(&mut array_payload, e, 0); // SeekTableOffset
            w32(&mut array_payload, e, 20); // SegmentLength
        }

        EbxBuilder {
            file_guid: Guid {
                val: (0xFA, 0, 0, 0xFA),
            },
            primary_instance_guid: gp,
            keywords,
            field_descriptors,
            complex_descriptors,
            instance_repeaters: vec![(1, 0), (3, 5)],
            array_repeaters: vec![(0, 1, 2), (20, 3, 4), (32, 1, 6), (44, 1, 6), (56, 1, 6)],
            strings: b"audio/music/track\0".to_vec(),
            payload,
            array_payload,
            ..Default::default()
        }
        .build(e)
    }

    #[test]
    fn sound_wave_asset_emits_one_sps_per_segment() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = AssetDirs {
            chunk_dir: dir.path().join("bundles/chunks"),
            chunk_dir_overlay: dir.path().join("chunks"),
            res_dir: dir.path().join("bundles/res"),
            output_dir: dir.path().join("assets"),
        };
        std::fs::create_dir_all(&dirs.chunk_dir).unwrap();

        // Three SPS streams back to back in one chunk file.
        let mut chunk = Vec::new();
        for payload in [*b"ONE1", *b"TWO2", *b"TRI3"] {
            chunk.extend(sps_stream(payload));
        }
        std::fs::write(
            dirs.chunk_dir.join(format!("{}.chunk", CHUNK_GUID.format())),
            &chunk,
        )
        .unwrap();

        let dbx = Dbx::read(
            &mut Cursor::new(sound_wave_fixture()),
            Path::new("track.ebx"),
            "track",
        )
        .unwrap();
        assert_eq!(dbx.true_filename, "audio/music/track");

        let env = EbxEnvironment::new(PathBuf::new(), GuidTable::default());
        SoundWaveDriver.extract(&dbx, &env, &dirs).unwrap();

        // More than one variation, so every output carries the
        // chunk/variation/segment suffix.
        for (variation, expected) in [(0, &chunk[0..20]), (1, &chunk[20..40]), (2, &chunk[40..60])]
        {
            let path = dirs
                .output_dir
                .join(format!("audio/music/track 0 {variation} 0.sps"));
            assert_eq!(std::fs::read(&path).unwrap(), expected, "{path:?}");
        }
    }
}
