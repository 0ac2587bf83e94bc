//! File-backed audio sinks.

use crate::{
    audio::Frame,
    error::{Error, Result},
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

/// Destination for produced frames; the pull side of the audio context.
pub trait AudioSink: Send {
    /// Write one frame. Errors are fatal to the process.
    fn write(&mut self, frame: &Frame) -> io::Result<()>;
}

/// 16-bit PCM WAV writer. The header is patched with the final lengths
/// when the sink is dropped.
pub struct WavSink {
    file: BufWriter<File>,
    data_bytes: u32,
}

impl WavSink {
    /// Create (truncate) `path` and write a placeholder header.
    pub fn create(path: &Path, sample_rate: usize, channels: usize) -> Result<Self> {
        let file = File::create(path)?;
        let mut file = BufWriter::new(file);

        let byte_rate = (sample_rate * channels * 2) as u32;
        let block_align = (channels * 2) as u16;

        file.write_all(b"RIFF")?;
        file.write_u32::<LittleEndian>(0)?; // patched on drop
        file.write_all(b"WAVE")?;
        file.write_all(b"fmt ")?;
        file.write_u32::<LittleEndian>(16)?;
        file.write_u16::<LittleEndian>(1)?; // PCM
        file.write_u16::<LittleEndian>(channels as u16)?;
        file.write_u32::<LittleEndian>(sample_rate as u32)?;
        file.write_u32::<LittleEndian>(byte_rate)?;
        file.write_u16::<LittleEndian>(block_align)?;
        file.write_u16::<LittleEndian>(16)?;
        file.write_all(b"data")?;
        file.write_u32::<LittleEndian>(0)?; // patched on drop

        Ok(Self {
            file,
            data_bytes: 0,
        })
    }
}

impl AudioSink for WavSink {
    fn write(&mut self, frame: &Frame) -> io::Result<()> {
        for &s in &frame.samples {
            let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
            self.file.write_i16::<LittleEndian>(v)?;
        }
        self.data_bytes += (frame.samples.len() * 2) as u32;
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        let riff = 36 + self.data_bytes;
        let _ = self.file.flush();
        let file = self.file.get_mut();
        let _ = file.seek(SeekFrom::Start(4));
        let _ = file.write_all(&riff.to_le_bytes());
        let _ = file.seek(SeekFrom::Start(40));
        let _ = file.write_all(&self.data_bytes.to_le_bytes());
    }
}

/// Raw interleaved little-endian 16-bit PCM, no framing.
pub struct RawSink {
    file: BufWriter<File>,
}

impl RawSink {
    /// Create (truncate) `path`.
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
        })
    }
}

impl AudioSink for RawSink {
    fn write(&mut self, frame: &Frame) -> io::Result<()> {
        for &s in &frame.samples {
            let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
            self.file.write_i16::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

/// Open a sink by driver name (`wav` or `raw`).
pub fn open_sink(
    path: &Path,
    driver: &str,
    sample_rate: usize,
    channels: usize,
) -> Result<Box<dyn AudioSink>> {
    match driver {
        "wav" => Ok(Box::new(WavSink::create(path, sample_rate, channels)?)),
        "raw" => Ok(Box::new(RawSink::create(path)?)),
        _ => Err(Error::IllegalConfig("unknown sink driver")),
    }
}
