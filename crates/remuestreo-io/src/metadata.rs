//! Textual metadata carried from input to output.
//!
//! WAV inputs are scanned directly for a LIST-INFO chunk and a raw
//! broadcast-extension (`bext`) chunk; compressed inputs surface their
//! tags through the decoder. On the write side the known fields map back
//! onto LIST-INFO ids and the bext chunk is passed through untouched.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian as LE, ReadBytesExt};

use crate::wav::WavWriter;

/// The tag set the converter copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaData {
    pub title: String,
    pub copyright: String,
    pub software: String,
    pub artist: String,
    pub comment: String,
    pub date: String,
    pub album: String,
    pub license: String,
    pub track_number: String,
    pub genre: String,
    /// Raw broadcast-extension chunk, if the input carried one.
    pub bext: Option<Vec<u8>>,
}

impl MetaData {
    pub fn is_empty(&self) -> bool {
        self.text_fields().iter().all(|(_, v)| v.is_empty()) && self.bext.is_none()
    }

    pub fn has_bext(&self) -> bool {
        self.bext.is_some()
    }

    /// (LIST-INFO id, value) pairs for the fields INFO can express.
    /// License has no INFO id and travels only where the decoder exposes
    /// it.
    fn text_fields(&self) -> [([u8; 4], &str); 9] {
        [
            (*b"INAM", &self.title),
            (*b"ICOP", &self.copyright),
            (*b"ISFT", &self.software),
            (*b"IART", &self.artist),
            (*b"ICMT", &self.comment),
            (*b"ICRD", &self.date),
            (*b"IPRD", &self.album),
            (*b"ITRK", &self.track_number),
            (*b"IGNR", &self.genre),
        ]
    }

    fn field_mut(&mut self, id: &[u8; 4]) -> Option<&mut String> {
        match id {
            b"INAM" => Some(&mut self.title),
            b"ICOP" => Some(&mut self.copyright),
            b"ISFT" => Some(&mut self.software),
            b"IART" => Some(&mut self.artist),
            b"ICMT" => Some(&mut self.comment),
            b"ICRD" => Some(&mut self.date),
            b"IPRD" => Some(&mut self.album),
            b"ITRK" => Some(&mut self.track_number),
            b"IGNR" => Some(&mut self.genre),
            _ => None,
        }
    }

    /// Attach every populated field to an output writer.
    pub fn apply_to(&self, writer: &mut WavWriter) {
        for (id, value) in self.text_fields() {
            writer.set_string(id, value);
        }
        if let Some(bext) = &self.bext {
            writer.set_bext(bext.clone());
        }
    }
}

/// Scan a RIFF/RF64 file for LIST-INFO tags and a bext chunk.
///
/// Unreadable or tagless files simply yield an empty record; metadata is
/// never a reason to fail a conversion.
pub fn read_wav_metadata<P: AsRef<Path>>(path: P) -> MetaData {
    scan(path.as_ref()).unwrap_or_default()
}

fn scan(path: &Path) -> std::io::Result<MetaData> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut meta = MetaData::default();

    let mut tag = [0u8; 4];
    reader.read_exact(&mut tag)?;
    if &tag != b"RIFF" && &tag != b"RF64" {
        return Ok(meta);
    }
    let _size = reader.read_u32::<LE>()?;
    let mut wave = [0u8; 4];
    reader.read_exact(&mut wave)?;
    if &wave != b"WAVE" {
        return Ok(meta);
    }

    let mut ds64_data: Option<u64> = None;
    loop {
        let mut id = [0u8; 4];
        if reader.read_exact(&mut id).is_err() {
            break;
        }
        let size32 = reader.read_u32::<LE>()?;
        let size = if &id == b"data" && size32 == u32::MAX {
            match ds64_data {
                Some(s) => s,
                None => break,
            }
        } else {
            u64::from(size32)
        };

        match &id {
            b"ds64" => {
                let _riff = reader.read_u64::<LE>()?;
                ds64_data = Some(reader.read_u64::<LE>()?);
                reader.seek(SeekFrom::Current(size as i64 - 16))?;
            }
            b"LIST" => {
                let mut kind = [0u8; 4];
                reader.read_exact(&mut kind)?;
                let mut remaining = size.saturating_sub(4);
                if &kind == b"INFO" {
                    while remaining >= 8 {
                        let mut sub_id = [0u8; 4];
                        reader.read_exact(&mut sub_id)?;
                        let sub_size = reader.read_u32::<LE>()?;
                        let padded = u64::from(sub_size) + u64::from(sub_size) % 2;
                        let mut value = vec![0u8; sub_size as usize];
                        reader.read_exact(&mut value)?;
                        if sub_size % 2 == 1 {
                            reader.seek(SeekFrom::Current(1))?;
                        }
                        if let Some(field) = meta.field_mut(&sub_id) {
                            let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                            *field = String::from_utf8_lossy(&value[..end]).into_owned();
                        }
                        remaining = remaining.saturating_sub(8 + padded);
                    }
                } else {
                    reader.seek(SeekFrom::Current(remaining as i64))?;
                }
                if size % 2 == 1 {
                    reader.seek(SeekFrom::Current(1))?;
                }
            }
            b"bext" => {
                let mut chunk = vec![0u8; size as usize];
                reader.read_exact(&mut chunk)?;
                meta.bext = Some(chunk);
                if size % 2 == 1 {
                    reader.seek(SeekFrom::Current(1))?;
                }
            }
            _ => {
                reader.seek(SeekFrom::Current((size + size % 2) as i64))?;
            }
        }
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{MajorFormat, SubFormat};
    use crate::wav::WriterOptions;
    use tempfile::TempDir;

    #[test]
    fn tags_round_trip_through_our_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tagged.wav");

        let mut writer = WavWriter::create(
            &path,
            MajorFormat::Wav,
            SubFormat::Float,
            1,
            48_000,
            WriterOptions { peak_chunk: false },
        )
        .unwrap();
        let mut meta = MetaData {
            title: "a title".into(),
            artist: "an artist".into(),
            genre: "electronic".into(),
            bext: Some(vec![7u8; 32]),
            ..Default::default()
        };
        meta.apply_to(&mut writer);
        writer.write_samples(&[0.0; 16]).unwrap();
        writer.finalize().unwrap();

        let back = read_wav_metadata(&path);
        assert_eq!(back.title, "a title");
        assert_eq!(back.artist, "an artist");
        assert_eq!(back.genre, "electronic");
        assert_eq!(back.bext, meta.bext);
        assert!(back.copyright.is_empty());
    }

    #[test]
    fn non_riff_files_yield_empty_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noise.bin");
        std::fs::write(&path, b"not a riff file at all").unwrap();
        assert!(read_wav_metadata(&path).is_empty());
    }
}
