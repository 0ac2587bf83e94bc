//! Sample sources for the sender tool.

use crate::{
    audio::Sample,
    error::{Error, Result},
};
use byteorder::{LittleEndian, ReadBytesExt};
use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::Path,
};
use tracing::warn;

/// Pull side of the sender's audio input.
pub trait SampleSource: Send {
    /// Fill `out` with interleaved samples. False means end of stream;
    /// `out` is then zero-filled.
    fn read(&mut self, out: &mut [Sample]) -> bool;
}

/// Endless sine test tone.
pub struct ToneSource {
    sample_rate: usize,
    channels: usize,
    freq: f64,
    t: u64,
}

impl ToneSource {
    /// A tone at `freq` Hz.
    #[must_use]
    pub fn new(sample_rate: usize, channels: usize, freq: f64) -> Self {
        Self {
            sample_rate,
            channels,
            freq,
            t: 0,
        }
    }
}

impl SampleSource for ToneSource {
    fn read(&mut self, out: &mut [Sample]) -> bool {
        for chunk in out.chunks_mut(self.channels) {
            let phase = self.t as f64 / self.sample_rate as f64 * self.freq;
            let v = (2.0 * std::f64::consts::PI * phase).sin() as Sample * 0.5;
            chunk.fill(v);
            self.t += 1;
        }
        true
    }
}

/// Minimal 16-bit PCM WAV reader.
pub struct WavSource {
    file: BufReader<File>,
    data_left: u64,
}

impl WavSource {
    /// Open `path`, seeking to the `data` chunk. The caller's stream
    /// format wins: a rate mismatch plays at the stream rate.
    pub fn open(path: &Path, expect_rate: usize, expect_channels: usize) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);

        let mut tag = [0u8; 4];
        file.read_exact(&mut tag)?;
        if &tag != b"RIFF" {
            return Err(Error::IllegalConfig("input is not a RIFF file"));
        }
        file.seek(SeekFrom::Current(4))?;
        file.read_exact(&mut tag)?;
        if &tag != b"WAVE" {
            return Err(Error::IllegalConfig("input is not a WAV file"));
        }

        loop {
            file.read_exact(&mut tag)?;
            let len = u64::from(file.read_u32::<LittleEndian>()?);
            match &tag {
                b"fmt " => {
                    let codec = file.read_u16::<LittleEndian>()?;
                    if codec != 1 {
                        return Err(Error::IllegalConfig("input WAV is not 16-bit PCM"));
                    }
                    let channels = file.read_u16::<LittleEndian>()? as usize;
                    let rate = file.read_u32::<LittleEndian>()? as usize;
                    if rate != expect_rate {
                        warn!("input rate {rate} differs from stream rate {expect_rate}");
                    }
                    if channels != expect_channels {
                        return Err(Error::IllegalConfig("input channel count mismatch"));
                    }
                    file.seek(SeekFrom::Current(len as i64 - 8))?;
                },
                b"data" => {
                    return Ok(Self {
                        file,
                        data_left: len,
                    });
                },
                _ => {
                    file.seek(SeekFrom::Current(len as i64))?;
                },
            }
        }
    }
}

impl SampleSource for WavSource {
    fn read(&mut self, out: &mut [Sample]) -> bool {
        for s in out.iter_mut() {
            if self.data_left < 2 {
                *s = 0.0;
                continue;
            }
            match self.file.read_i16::<LittleEndian>() {
                Ok(v) => {
                    *s = Sample::from(v) / 32_768.0;
                    self.data_left -= 2;
                },
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.data_left = 0;
                    *s = 0.0;
                },
                Err(_) => {
                    self.data_left = 0;
                    *s = 0.0;
                },
            }
        }
        self.data_left >= 2
    }
}
