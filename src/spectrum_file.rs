//! Reading and writing [`SpectrumFile`]s, the `<id>.spec` output of the
//! spectrum worker. A file has three parts:
//!
//! - A header with some metadata:
//!   - the identifier of the observation it came from,
//!   - the center frequency and sample rate of that capture,
//!   - the number of bins,
//!   - whether a calibration was subtracted,
//!   - how full the accumulation buffer was when it was summed.
//! - A separator, the byte `0xFF`, which never occurs in UTF-8 text.
//! - The bins, each a big-endian `f32` pair: frequency in MHz, then power.
//!
//! The header is encoded with [serde] and [ron]:
//!
//! ```text
//! (identifier:"A-20240101T000000000000",frequency:1420200000,sample_rate:3200000,bins:1024,calibrated:true,percent_full:0.5)
//! ```

use crate::spectrum::Spectrum;

use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};
use thiserror::Error;

const SEPARATOR: u8 = 0xFF;

/// Metadata at the top of a [`SpectrumFile`].
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SpectrumHeader {
    pub identifier: String,
    pub frequency: u64,
    pub sample_rate: u64,
    pub bins: u64,
    pub calibrated: bool,
    pub percent_full: f32,
}

/// A header and its bins.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFile {
    header: SpectrumHeader,
    /// `(MHz, power)`
    bins: Vec<(f32, f32)>,
}

/// Things that go wrong reading or writing a [`SpectrumFile`].
#[derive(Debug, Error)]
pub enum SpectrumFileError {
    /// The builder was given a different number of frequencies and powers.
    #[error("{frequencies} frequencies but {powers} power values")]
    UnequalLengths {
        /// Number of frequencies given.
        frequencies: usize,
        /// Number of power values given.
        powers: usize,
    },

    /// No `0xFF` between header and bins.
    #[error("no separator in spectrum file")]
    NoSeparator,

    /// The bin section is not a whole number of pairs, or disagrees with
    /// the header's bin count.
    #[error("spectrum file holds {found} bytes of bins, expected {expected}")]
    Truncated {
        /// Bytes the header promises.
        expected: usize,
        /// Bytes actually present.
        found: usize,
    },

    /// Reading or writing the file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The header could not be serialized.
    #[error("ron error: {0}")]
    Ron(#[from] ron::Error),

    /// The header could not be parsed.
    #[error("ron header error: {0}")]
    RonSpanned(#[from] ron::de::SpannedError),
}

impl SpectrumFile {
    /// Starts a [`SpectrumFileBuilder`] for the observation `identifier`.
    pub fn builder(identifier: impl Into<String>) -> SpectrumFileBuilder {
        SpectrumFileBuilder {
            identifier: identifier.into(),
            frequency: 0,
            sample_rate: 0,
            calibrated: false,
            percent_full: 0.0,
            frequencies: Vec::new(),
            power: Vec::new(),
        }
    }

    /// The ron header.
    pub fn header(&self) -> &SpectrumHeader {
        &self.header
    }

    /// `(MHz, power)` pairs in frequency order.
    pub fn bins(&self) -> &[(f32, f32)] {
        &self.bins
    }

    /// Writes the file to `path`.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), SpectrumFileError> {
        let mut handle = BufWriter::new(File::create(path)?);
        self.to_writer(&mut handle)?;
        handle.flush()?;
        Ok(())
    }

    /// Writes the file to anything [Write]able.
    pub fn to_writer(&self, out: &mut impl Write) -> Result<(), SpectrumFileError> {
        let header = ron::ser::to_string(&self.header)?;
        out.write_all(header.as_bytes())?;
        out.write_all(&[SEPARATOR])?;

        let body: Vec<u8> = self
            .bins
            .iter()
            .flat_map(|(mhz, power)| {
                let mut pair = [0u8; 8];
                pair[..4].copy_from_slice(&mhz.to_be_bytes());
                pair[4..].copy_from_slice(&power.to_be_bytes());
                pair
            })
            .collect();
        out.write_all(&body)?;
        Ok(())
    }

    /// Reads a file from `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SpectrumFileError> {
        let mut handle = File::open(path)?;
        Self::from_reader(&mut handle)
    }

    /// Reads a file from anything [Read]able.
    pub fn from_reader(input: &mut impl Read) -> Result<Self, SpectrumFileError> {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;

        let split = raw
            .iter()
            .position(|b| *b == SEPARATOR)
            .ok_or(SpectrumFileError::NoSeparator)?;
        let (header_buf, body) = raw.split_at(split);
        let body = &body[1..];

        let header: SpectrumHeader = ron::de::from_bytes(header_buf)?;
        let expected = header.bins as usize * 8;
        if body.len() != expected {
            return Err(SpectrumFileError::Truncated {
                expected,
                found: body.len(),
            });
        }

        let word = |bytes: &[u8]| f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let bins = body
            .chunks_exact(8)
            .map(|pair| (word(&pair[..4]), word(&pair[4..])))
            .collect();

        Ok(SpectrumFile { header, bins })
    }
}

/// Collects what goes into a [`SpectrumFile`].
#[derive(Debug, Clone)]
pub struct SpectrumFileBuilder {
    identifier: String,
    frequency: u64,
    sample_rate: u64,
    calibrated: bool,
    percent_full: f32,
    frequencies: Vec<f64>,
    power: Vec<f32>,
}

impl SpectrumFileBuilder {
    /// Center frequency and sample rate of the capture, in Hz.
    pub fn tuning(self, frequency: u64, sample_rate: u64) -> Self {
        SpectrumFileBuilder {
            frequency,
            sample_rate,
            ..self
        }
    }

    /// Whether the bins had a calibration subtracted.
    pub fn calibrated(self, calibrated: bool) -> Self {
        SpectrumFileBuilder { calibrated, ..self }
    }

    /// Fullness of the buffer the spectrum was summed from, clamped to
    /// `0.0..=1.0`.
    pub fn percent_full(self, percent_full: f32) -> Self {
        SpectrumFileBuilder {
            percent_full: percent_full.clamp(0.0, 1.0),
            ..self
        }
    }

    /// The bins. Frequencies are in Hz here and stored in MHz.
    pub fn spectrum(mut self, spectrum: &Spectrum) -> Self {
        self.frequencies = spectrum.frequencies.clone();
        self.power = spectrum.power.clone();
        self
    }

    /// Fails if there are not as many frequencies as power values.
    pub fn build(self) -> Result<SpectrumFile, SpectrumFileError> {
        if self.frequencies.len() != self.power.len() {
            return Err(SpectrumFileError::UnequalLengths {
                frequencies: self.frequencies.len(),
                powers: self.power.len(),
            });
        }
        let bins: Vec<(f32, f32)> = self
            .frequencies
            .iter()
            .zip(&self.power)
            .map(|(hz, power)| ((hz / 1e6) as f32, *power))
            .collect();

        Ok(SpectrumFile {
            header: SpectrumHeader {
                identifier: self.identifier,
                frequency: self.frequency,
                sample_rate: self.sample_rate,
                bins: bins.len() as u64,
                calibrated: self.calibrated,
                percent_full: self.percent_full,
            },
            bins,
        })
    }
}
