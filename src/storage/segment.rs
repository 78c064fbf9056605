//! Append-only data file I/O.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{Bytes, BytesMut};

use super::index::DataEntry;

/// Append `payloads` to the data file at `path` in one pass.
///
/// The first payload lands at the file's length before the append; each
/// following one directly after its predecessor. Returns one entry per
/// payload, in input order.
pub(crate) fn append(path: &Path, payloads: &[&Bytes], sync: bool) -> std::io::Result<Vec<DataEntry>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let start = file.metadata()?.len();

    let mut writer = BufWriter::new(file);
    let mut cursor = start;
    let mut entries = Vec::with_capacity(payloads.len());

    for payload in payloads {
        writer.write_all(payload)?;
        entries.push(DataEntry::new(cursor, payload.len() as u32));
        cursor += payload.len() as u64;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    if sync {
        file.sync_data()?;
    }

    Ok(entries)
}

/// Open the data file at `path` for reading.
pub(crate) fn open(path: &Path) -> std::io::Result<File> {
    File::open(path)
}

/// Read one entry.
pub(crate) fn read_entry<R: Read + Seek>(reader: &mut R, entry: DataEntry) -> std::io::Result<Bytes> {
    reader.seek(SeekFrom::Start(entry.offset))?;
    let mut buf = BytesMut::zeroed(entry.length as usize);
    reader.read_exact(&mut buf)?;
    Ok(buf.freeze())
}
