//! Canonical RIFF/WAVE PCM codec.
//!
//! Only the 44-byte subset of the container is handled: `RIFF` + `WAVE`
//! magic, a 16-byte `fmt ` chunk (integer PCM, 16-bit), and a single `data`
//! chunk. The writer emits a placeholder header at open, appends interleaved
//! little-endian frames, and rewrites the header with final sizes on
//! finalize. The reader validates the fixed-offset fields and can rewrite
//! the PCM region in place without touching the header.
//!
//! ## Header layout
//!
//! ```text
//! offset  size  field
//!      0     4  "RIFF"
//!      4     4  file size − 8                u32 LE
//!      8     4  "WAVE"
//!     12     4  "fmt "
//!     16     4  16 (PCM fmt chunk size)      u32 LE
//!     20     2  1  (integer PCM)             u16 LE
//!     22     2  channels                     u16 LE
//!     24     4  sample rate                  u32 LE
//!     28     4  byte rate                    u32 LE
//!     32     2  block align                  u16 LE
//!     34     2  bits per sample (16)         u16 LE
//!     36     4  "data"
//!     40     4  data size = file size − 44   u32 LE
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{AudioFormat, BITS_PER_SAMPLE, WAV_HEADER_LEN};

/// Integer PCM encoding tag in the `fmt ` chunk.
const FORMAT_TAG_PCM: u16 = 1;
/// Size of the `fmt ` chunk body for plain PCM.
const FMT_CHUNK_SIZE: u32 = 16;
/// Stop-transient removal: amount of audio dropped from the end of a capture.
pub const TAIL_TRIM_SECONDS: f64 = 0.2;

#[derive(Debug, Error)]
pub enum WavError {
    /// The file is shorter than 44 bytes or a fixed-offset field is wrong.
    #[error("malformed WAV header: {0}")]
    MalformedHeader(&'static str),
    /// The file parses but is not 16-bit integer PCM in mono or stereo.
    #[error("unsupported WAV format: {0}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed fixed-offset header fields of a validated file.
#[derive(Debug, Clone, Copy)]
pub struct WavHeader {
    pub format: AudioFormat,
    pub bits_per_sample: u16,
    /// Byte length of the `data` chunk as recorded in the header.
    pub data_bytes: u32,
}

impl WavHeader {
    pub fn frame_count(&self) -> u64 {
        self.data_bytes as u64 / self.format.block_align() as u64
    }
}

/// Encode the full 44-byte header for `data_bytes` bytes of PCM.
fn encode_header(format: AudioFormat, data_bytes: u32) -> [u8; 44] {
    let mut h = [0u8; 44];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(data_bytes + WAV_HEADER_LEN as u32 - 8).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&FMT_CHUNK_SIZE.to_le_bytes());
    h[20..22].copy_from_slice(&FORMAT_TAG_PCM.to_le_bytes());
    h[22..24].copy_from_slice(&format.channels.to_le_bytes());
    h[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&format.byte_rate().to_le_bytes());
    h[32..34].copy_from_slice(&format.block_align().to_le_bytes());
    h[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_bytes.to_le_bytes());
    h
}

/// Parse and validate a 44-byte header.
fn decode_header(h: &[u8; 44]) -> Result<WavHeader, WavError> {
    if &h[0..4] != b"RIFF" || &h[8..12] != b"WAVE" {
        return Err(WavError::MalformedHeader("missing RIFF/WAVE magic"));
    }
    if &h[12..16] != b"fmt " {
        return Err(WavError::MalformedHeader("missing fmt chunk id"));
    }
    if &h[36..40] != b"data" {
        return Err(WavError::MalformedHeader("missing data chunk id"));
    }
    let format_tag = u16::from_le_bytes([h[20], h[21]]);
    if format_tag != FORMAT_TAG_PCM {
        return Err(WavError::UnsupportedFormat(format!(
            "encoding tag {format_tag} (expected integer PCM)"
        )));
    }
    let channels = u16::from_le_bytes([h[22], h[23]]);
    let sample_rate = u32::from_le_bytes([h[24], h[25], h[26], h[27]]);
    let bits_per_sample = u16::from_le_bytes([h[34], h[35]]);
    if bits_per_sample != BITS_PER_SAMPLE {
        return Err(WavError::UnsupportedFormat(format!(
            "{bits_per_sample} bits per sample"
        )));
    }
    if channels == 0 || channels > 2 {
        return Err(WavError::UnsupportedFormat(format!("{channels} channels")));
    }
    let data_bytes = u32::from_le_bytes([h[40], h[41], h[42], h[43]]);
    Ok(WavHeader {
        format: AudioFormat::new(sample_rate, channels),
        bits_per_sample,
        data_bytes,
    })
}

/// Streaming WAV writer for a capture session.
///
/// Created with a placeholder header; `data` grows by appending only. The
/// header is rewritten exactly once, in [`WavWriter::finalize`].
pub struct WavWriter {
    file: BufWriter<File>,
    path: PathBuf,
    format: AudioFormat,
    data_bytes: u64,
}

impl WavWriter {
    /// Open (or truncate) `path` and write the placeholder header.
    pub fn create<P: AsRef<Path>>(path: P, format: AudioFormat) -> Result<WavWriter, WavError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let mut file = BufWriter::new(file);
        file.write_all(&encode_header(format, 0))?;
        Ok(WavWriter {
            file,
            path: path.as_ref().to_path_buf(),
            format,
            data_bytes: 0,
        })
    }

    /// Append interleaved samples as little-endian PCM.
    pub fn write_samples(&mut self, samples: &[i16]) -> Result<(), WavError> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.file.write_all(&bytes)?;
        self.data_bytes += bytes.len() as u64;
        Ok(())
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn frames_written(&self) -> u64 {
        self.format.bytes_to_frames(self.data_bytes)
    }

    pub fn duration_ms(&self) -> u64 {
        self.format.frames_to_ms(self.frames_written())
    }

    /// Bytes removed from the end of a capture by [`WavWriter::trim_tail`].
    pub fn tail_trim_bytes(format: AudioFormat) -> u64 {
        (TAIL_TRIM_SECONDS * format.sample_rate as f64).floor() as u64
            * format.block_align() as u64
    }

    /// Truncate the stop transient from the end of the data.
    ///
    /// Skipped (returns `false`) when the remaining data length would be
    /// zero or negative.
    pub fn trim_tail(&mut self) -> Result<bool, WavError> {
        let trim = Self::tail_trim_bytes(self.format);
        if self.data_bytes <= trim {
            return Ok(false);
        }
        self.file.flush()?;
        self.data_bytes -= trim;
        let file = self.file.get_mut();
        file.set_len(WAV_HEADER_LEN + self.data_bytes)?;
        file.seek(SeekFrom::End(0))?;
        Ok(true)
    }

    /// Rewrite the header with final sizes, flush, and close the file.
    ///
    /// Returns the path of the finished file.
    pub fn finalize(mut self) -> Result<PathBuf, WavError> {
        self.file.flush()?;
        let data_bytes = self.data_bytes.min(u32::MAX as u64) as u32;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(self.format, data_bytes))?;
        file.sync_all()?;
        Ok(self.path)
    }
}

/// Validating reader over a finished WAV file.
#[derive(Debug)]
pub struct WavReader {
    file: File,
    header: WavHeader,
}

impl WavReader {
    /// Open read-only and validate the header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WavReader, WavError> {
        let file = File::open(path)?;
        Self::from_file(file)
    }

    /// Open read + write so the PCM region can be rewritten in place.
    pub fn open_editable<P: AsRef<Path>>(path: P) -> Result<WavReader, WavError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    fn from_file(mut file: File) -> Result<WavReader, WavError> {
        let mut h = [0u8; 44];
        let mut read = 0;
        while read < h.len() {
            match file.read(&mut h[read..])? {
                0 => return Err(WavError::MalformedHeader("file shorter than 44 bytes")),
                n => read += n,
            }
        }
        let header = decode_header(&h)?;
        Ok(WavReader { file, header })
    }

    pub fn header(&self) -> &WavHeader {
        &self.header
    }

    /// Read the whole data chunk as interleaved samples.
    ///
    /// Reads at most the bytes actually present past the header, so a header
    /// whose recorded size overshoots the file is tolerated.
    pub fn read_all(&mut self) -> Result<Vec<i16>, WavError> {
        let file_len = self.file.metadata()?.len();
        let available = file_len.saturating_sub(WAV_HEADER_LEN);
        let len = (self.header.data_bytes as u64).min(available) as usize;
        self.file.seek(SeekFrom::Start(WAV_HEADER_LEN))?;
        let mut bytes = vec![0u8; len];
        self.file.read_exact(&mut bytes)?;
        let samples = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(samples)
    }

    /// Rewrite the PCM region starting at byte 44. The header is untouched,
    /// so the sample count must match what the file already holds.
    pub fn overwrite_samples(&mut self, samples: &[i16]) -> Result<(), WavError> {
        self.file.seek(SeekFrom::Start(WAV_HEADER_LEN))?;
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.file.write_all(&bytes)?;
        self.file.sync_all()?;
        Ok(())
    }
}
