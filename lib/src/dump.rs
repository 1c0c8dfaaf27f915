//! Extraction driver: walks TOC catalogs, resolves bundle payloads
//! through the CAS catalog or superbundle offsets, and writes the
//! output tree. Every payload write is first-write-wins, which keeps
//! overlapping TOCs cheap and makes patched TOCs authoritative when
//! they run before their base.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use binrw::BinReaderExt;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::cat::Catalog;
use crate::dbo::{self, DbObject, DbValue};
use crate::ebx::guid_table::{self, GuidTable};
use crate::error::FrostpackError;
use crate::frame;
use crate::fsutil;
use crate::guid::Guid;
use crate::noncas;
use crate::superbundle::{self, X360Decompressor};

/// A payload is sourced from inline idata bytes or a CAS archive slice.
#[auto_enums::enum_derive(Read)]
enum PayloadSource<L, R> {
    Inline(L),
    Archive(R),
}

struct OutDirs {
    /// TOC-level chunks.
    toc_chunks: PathBuf,
    ebx: PathBuf,
    dbx: PathBuf,
    res: PathBuf,
    /// Bundle-level chunks.
    chunks: PathBuf,
}

impl OutDirs {
    fn new(target_dir: &Path) -> Self {
        let bundles = target_dir.join("bundles");
        Self {
            toc_chunks: target_dir.join("chunks"),
            ebx: bundles.join("ebx"),
            dbx: bundles.join("dbx"),
            res: bundles.join("res"),
            chunks: bundles.join("chunks"),
        }
    }
}

/// Everything one dump run mutates, passed explicitly instead of living
/// in globals: the catalog, the growing GUID table, and the X360
/// scratch space.
pub struct DumpContext {
    game_dir: PathBuf,
    target_dir: PathBuf,
    pub catalog: Catalog,
    pub guid_table: GuidTable,
    x360: X360Decompressor,
    scratch: TempDir,
    temp_files: Vec<PathBuf>,
}

impl DumpContext {
    pub fn new(
        game_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        x360: X360Decompressor,
    ) -> Result<Self, FrostpackError> {
        let scratch = TempDir::new()
            .map_err(|e| FrostpackError::Io("Couldn't create scratch dir".into(), e))?;
        Ok(Self {
            game_dir: game_dir.into(),
            target_dir: target_dir.into(),
            catalog: Catalog::default(),
            guid_table: GuidTable::default(),
            x360,
            scratch,
            temp_files: Vec::new(),
        })
    }

    pub fn game_dir(&self) -> &Path {
        &self.game_dir
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn load_catalog(&mut self, cat_path: &Path) -> Result<(), FrostpackError> {
        self.catalog.load(cat_path)
    }

    /// Persist the GUID table collected across every dumped root.
    pub fn write_guid_table(&self) -> Result<(), FrostpackError> {
        self.guid_table
            .save(&guid_table::table_path(&self.target_dir))
    }

    /// Walk one data root for TOC files. When a patched sibling exists
    /// under `patch_dir` it is dumped first, so its payloads win.
    pub fn dump_root(&mut self, data_dir: &Path, patch_dir: &Path) -> Result<(), FrostpackError> {
        if !data_dir.is_dir() {
            return Ok(());
        }
        for entry in WalkDir::new(data_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                FrostpackError::Custom(format!("Couldn't walk '{}': {e}", data_dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let toc_path = entry.path();
            if toc_path.extension().and_then(|e| e.to_str()) != Some("toc") {
                continue;
            }
            let local = toc_path.strip_prefix(data_dir).unwrap_or(toc_path);
            log::info!("{}", local.display());

            let patched = patch_dir.join(local);
            if patched.is_file() {
                self.dump(&patched, Some(toc_path), Some(&patch_dir.join("common.dat")))?;
            }
            self.dump(toc_path, None, None)?;
        }
        Ok(())
    }

    /// Extract one TOC and its superbundle. `base_toc_path` and
    /// `common_dat_path` are set when `toc_path` is the patched variant.
    pub fn dump(
        &mut self,
        toc_path: &Path,
        base_toc_path: Option<&Path>,
        common_dat_path: Option<&Path>,
    ) -> Result<(), FrostpackError> {
        let toc = dbo::read_toc(toc_path)?;
        // Nothing to extract; the superbundle might not even exist.
        if list_of(&toc, "bundles").is_empty() && list_of(&toc, "chunks").is_empty() {
            return Ok(());
        }

        let sb_path = toc_path.with_extension("sb");
        let mut sb = self.open_superbundle(&sb_path)?;
        let dirs = OutDirs::new(&self.target_dir);

        if toc.get("cas").and_then(DbValue::as_bool).unwrap_or(false) {
            self.dump_cas(&toc, &mut sb, &sb_path, &dirs)?;
        } else {
            self.dump_noncas(
                &toc,
                &mut sb,
                &sb_path,
                &dirs,
                base_toc_path,
                common_dat_path,
            )?;
        }

        drop(sb);
        superbundle::clear_temp_files(&mut self.temp_files);
        Ok(())
    }

    fn open_superbundle(&mut self, sb_path: &Path) -> Result<File, FrostpackError> {
        superbundle::open_superbundle(
            sb_path,
            &self.game_dir,
            self.scratch.path(),
            &self.x360,
            &mut self.temp_files,
        )
    }

    fn dump_cas(
        &mut self,
        toc: &DbObject,
        sb: &mut File,
        sb_path: &Path,
        dirs: &OutDirs,
    ) -> Result<(), FrostpackError> {
        for toc_entry in list_of(toc, "bundles") {
            let entry = object_of(toc_entry, "bundle", sb_path)?;
            let offset = entry.require_u64("offset", sb_path)?;
            sb.seek(SeekFrom::Start(offset))
                .map_err(|e| FrostpackError::Io("Couldn't seek superbundle".into(), e))?;
            let bundle = DbObject::read(sb, sb_path)?;

            for value in list_of(&bundle, "ebx") {
                let e = object_of(value, "ebx", sb_path)?;
                let name = e.require_str("name", sb_path)?;
                let path = dirs.ebx.join(format!("{name}.ebx"));
                if self.cas_payload(e, &path, sb_path)? {
                    self.guid_table.insert_file(&path, &dirs.ebx)?;
                }
            }
            for value in list_of(&bundle, "dbx") {
                // dbx ships as idata only, when it ships at all.
                let e = object_of(value, "dbx", sb_path)?;
                if e.get("idata").is_some() {
                    let name = e.require_str("name", sb_path)?;
                    let path = dirs.dbx.join(format!("{name}.dbx"));
                    self.cas_payload(e, &path, sb_path)?;
                }
            }
            for value in list_of(&bundle, "res") {
                let e = object_of(value, "res", sb_path)?;
                let name = e.require_str("name", sb_path)?;
                let path = dirs.res.join(format!("{name}.res"));
                self.cas_payload(e, &path, sb_path)?;
            }
            for value in list_of(&bundle, "chunks") {
                let e = object_of(value, "chunk", sb_path)?;
                let id = e.require_guid("id", sb_path)?;
                let path = dirs.chunks.join(format!("{}.chunk", id.format()));
                self.cas_chunk_payload(e, id, &path, sb_path)?;
            }
        }

        for value in list_of(toc, "chunks") {
            let e = object_of(value, "chunk", sb_path)?;
            let id = e.require_guid("id", sb_path)?;
            let path = dirs.toc_chunks.join(format!("{}.chunk", id.format()));
            self.cas_chunk_payload(e, id, &path, sb_path)?;
        }
        Ok(())
    }

    /// Write one content-addressed (or inline) payload. Returns whether
    /// a new file was produced.
    fn cas_payload(
        &self,
        entry: &DbObject,
        out_path: &Path,
        sb_path: &Path,
    ) -> Result<bool, FrostpackError> {
        if fsutil::exists(out_path) {
            return Ok(false);
        }

        let size = entry.require_u64("size", sb_path)?;
        let original_size = entry.require_u64("originalSize", sb_path)?;
        // No certain compression indicator exists for ebx/res; size
        // inequality is the working signal.
        let compressed = size != original_size;

        let (mut source, len) = match entry.get("idata").and_then(DbValue::as_blob) {
            Some(idata) => (
                PayloadSource::Inline(Cursor::new(idata)),
                idata.len() as u64,
            ),
            None => {
                let sha1 = entry.require_sha1("sha1", sb_path)?;
                let cat_entry = self.catalog.lookup(&sha1)?;
                let mut cas = fsutil::open_input(&cat_entry.path)?;
                cas.seek(SeekFrom::Start(u64::from(cat_entry.offset)))
                    .map_err(|e| FrostpackError::Io("Couldn't seek CAS archive".into(), e))?;
                (
                    PayloadSource::Archive(cas.take(u64::from(cat_entry.size))),
                    u64::from(cat_entry.size),
                )
            }
        };

        let Some(mut out) = fsutil::create_new_output(out_path)? else {
            return Ok(false);
        };
        write_payload(&mut source, len, compressed, &mut out, out_path)?;
        Ok(true)
    }

    /// Chunks carry their compression flag in the GUID instead of the
    /// size fields.
    fn cas_chunk_payload(
        &self,
        entry: &DbObject,
        id: Guid,
        out_path: &Path,
        sb_path: &Path,
    ) -> Result<bool, FrostpackError> {
        if fsutil::exists(out_path) {
            return Ok(false);
        }

        let sha1 = entry.require_sha1("sha1", sb_path)?;
        let cat_entry = self.catalog.lookup(&sha1)?;
        let mut cas = fsutil::open_input(&cat_entry.path)?;
        cas.seek(SeekFrom::Start(u64::from(cat_entry.offset)))
            .map_err(|e| FrostpackError::Io("Couldn't seek CAS archive".into(), e))?;

        let Some(mut out) = fsutil::create_new_output(out_path)? else {
            return Ok(false);
        };
        write_payload(
            &mut cas,
            u64::from(cat_entry.size),
            id.is_chunk_compressed(),
            &mut out,
            out_path,
        )?;
        Ok(true)
    }

    fn dump_noncas(
        &mut self,
        toc: &DbObject,
        sb: &mut File,
        sb_path: &Path,
        dirs: &OutDirs,
        base_toc_path: Option<&Path>,
        common_dat_path: Option<&Path>,
    ) -> Result<(), FrostpackError> {
        for toc_entry in list_of(toc, "bundles") {
            let entry = object_of(toc_entry, "bundle", sb_path)?;
            // A patched bundle marked `base` is supplied whole by the
            // unpatched superbundle.
            if entry.get("base").and_then(DbValue::as_bool).unwrap_or(false) {
                continue;
            }
            let offset = entry.require_u64("offset", sb_path)?;
            sb.seek(SeekFrom::Start(offset))
                .map_err(|e| FrostpackError::Io("Couldn't seek superbundle".into(), e))?;

            if entry.get("delta").and_then(DbValue::as_bool).unwrap_or(false) {
                // Rebuild the bundle by splicing the patched stream with
                // runs from the unpatched superbundle and common.dat.
                let header: noncas::DeltaHeader = sb
                    .read_be()
                    .map_err(|e| FrostpackError::BinRW("Couldn't read delta header".into(), e))?;
                let deltas = noncas::read_deltas(sb, &header, sb_path)?;

                let base_toc = base_toc_path.ok_or_else(|| {
                    FrostpackError::MissingDependency(
                        "patched bundle without a base TOC".into(),
                    )
                })?;
                let unpatched_path = base_toc.with_extension("sb");
                let mut unpatched = self.open_superbundle(&unpatched_path)?;
                let mut common = match common_dat_path {
                    Some(p) if p.is_file() => Some(fsutil::open_input(p)?),
                    _ => None,
                };

                let data = noncas::synthesize_patched_bundle(
                    sb,
                    &deltas,
                    &mut unpatched,
                    common.as_mut(),
                    sb_path,
                    offset,
                )?;
                let mut stream = Cursor::new(data);
                let bundle = noncas::Bundle::read(&mut stream, sb_path)?;
                self.extract_noncas_bundle(&bundle, &mut stream, dirs)?;
            } else {
                let bundle = noncas::Bundle::read(sb, sb_path)?;
                self.extract_noncas_bundle(&bundle, sb, dirs)?;
            }
        }

        for value in list_of(toc, "chunks") {
            let e = object_of(value, "chunk", sb_path)?;
            let id = e.require_guid("id", sb_path)?;
            let offset = e.require_u64("offset", sb_path)?;
            let size = e.require_u64("size", sb_path)?;
            let path = dirs.toc_chunks.join(format!("{}.chunk", id.format()));
            non_cas_chunk_payload(sb, id, offset, size, &path)?;
        }
        Ok(())
    }

    fn extract_noncas_bundle<S: Read + Seek>(
        &mut self,
        bundle: &noncas::Bundle,
        stream: &mut S,
        dirs: &OutDirs,
    ) -> Result<(), FrostpackError> {
        for e in &bundle.ebx_entries {
            let path = dirs.ebx.join(format!("{}.ebx", e.name));
            if non_cas_payload(stream, e.offset, e.size, e.original_size, &path)? {
                self.guid_table.insert_file(&path, &dirs.ebx)?;
            }
        }
        for e in &bundle.res_entries {
            let path = dirs.res.join(format!("{}.res", e.name));
            non_cas_payload(stream, e.offset, e.size, e.original_size, &path)?;
        }
        for e in &bundle.chunk_entries {
            let path = dirs.chunks.join(format!("{}.chunk", e.id.format()));
            non_cas_chunk_payload(stream, e.id, u64::from(e.offset), u64::from(e.size), &path)?;
        }
        Ok(())
    }
}

fn list_of<'a>(obj: &'a DbObject, key: &str) -> &'a [DbValue] {
    obj.get(key).and_then(DbValue::as_list).unwrap_or(&[])
}

fn object_of<'a>(
    value: &'a DbValue,
    what: &str,
    src: &Path,
) -> Result<&'a DbObject, FrostpackError> {
    value.as_object().ok_or_else(|| {
        FrostpackError::Custom(format!(
            "{what} entry is not an object in '{}'",
            src.display()
        ))
    })
}

fn write_payload(
    source: &mut impl Read,
    len: u64,
    compressed: bool,
    out: &mut File,
    label: &Path,
) -> Result<(), FrostpackError> {
    if compressed {
        let data = frame::decode_stream(&mut *source, len, label)?;
        out.write_all(&data)
            .map_err(|e| FrostpackError::Io("Couldn't write output".into(), e))?;
    } else {
        std::io::copy(&mut source.take(len), out)
            .map_err(|e| FrostpackError::Io("Couldn't write output".into(), e))?;
    }
    Ok(())
}

fn non_cas_payload<S: Read + Seek>(
    stream: &mut S,
    offset: u32,
    size: u32,
    original_size: u32,
    out_path: &Path,
) -> Result<bool, FrostpackError> {
    if fsutil::exists(out_path) {
        return Ok(false);
    }
    stream
        .seek(SeekFrom::Start(u64::from(offset)))
        .map_err(|e| FrostpackError::Io("Couldn't seek bundle stream".into(), e))?;
    let Some(mut out) = fsutil::create_new_output(out_path)? else {
        return Ok(false);
    };
    write_payload(
        stream,
        u64::from(size),
        size != original_size,
        &mut out,
        out_path,
    )?;
    Ok(true)
}

fn non_cas_chunk_payload<S: Read + Seek>(
    stream: &mut S,
    id: Guid,
    offset: u64,
    size: u64,
    out_path: &Path,
) -> Result<bool, FrostpackError> {
    if fsutil::exists(out_path) {
        return Ok(false);
    }
    stream
        .seek(SeekFrom::Start(offset))
        .map_err(|e| FrostpackError::Io("Couldn't seek bundle stream".into(), e))?;
    let Some(mut out) = fsutil::create_new_output(out_path)? else {
        return Ok(false);
    };
    write_payload(stream, size, id.is_chunk_compressed(), &mut out, out_path)?;
    Ok(true)
}
