use std::io::{self, Write};

use crate::engine::FusionResult;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("Could not write result record")]
    Io(#[from] io::Error),
}

/// Consumes results in timestamp order, one record per result.
pub trait OutputSink {
    /// Called once acquisition is running, before any result.
    fn start(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
    fn emit(&mut self, result: &FusionResult) -> Result<(), SinkError>;
}

impl<T: OutputSink + ?Sized> OutputSink for &mut T {
    fn start(&mut self) -> Result<(), SinkError> {
        (**self).start()
    }
    fn emit(&mut self, result: &FusionResult) -> Result<(), SinkError> {
        (**self).emit(result)
    }
}

impl<T: OutputSink + ?Sized> OutputSink for Box<T> {
    fn start(&mut self) -> Result<(), SinkError> {
        (**self).start()
    }
    fn emit(&mut self, result: &FusionResult) -> Result<(), SinkError> {
        (**self).emit(result)
    }
}

fn or_nan(value: Option<f32>) -> f32 {
    value.unwrap_or(f32::NAN)
}

pub const PIPE_HEADER: &str =
    "Timestamp|Temperature|Pressure|RelativeHumidity|GasRawReading|IAQ|IAQAccuracy";

/// `|` separated records meant to be piped into another process. The
/// header goes out on [`OutputSink::start`], or with the first record. Every line is flushed so a
/// reader sees it as soon as it is produced.
#[derive(Debug)]
pub struct PipeSink<W> {
    out: W,
    header_written: bool,
}

impl<W: Write> PipeSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        if !self.header_written {
            writeln!(self.out, "{PIPE_HEADER}")?;
            self.out.flush()?;
            self.header_written = true;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> OutputSink for PipeSink<W> {
    fn start(&mut self) -> Result<(), SinkError> {
        self.write_header()
    }

    fn emit(&mut self, r: &FusionResult) -> Result<(), SinkError> {
        self.write_header()?;
        writeln!(
            self.out,
            "{:.3}|{:.1}|{:.1}|{:.1}%|{:.0}|{:.1}|{}",
            r.timestamp.as_secs_f64(),
            r.temperature,
            r.pressure / 100.0,
            r.humidity,
            r.gas_resistance,
            or_nan(r.iaq),
            r.accuracy.as_u8(),
        )?;
        self.out.flush()?;
        Ok(())
    }
}

/// One human readable line per result, for watching a terminal.
#[derive(Debug)]
pub struct PrettySink<W> {
    out: W,
}

impl<W: Write> PrettySink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> OutputSink for PrettySink<W> {
    fn emit(&mut self, r: &FusionResult) -> Result<(), SinkError> {
        write!(
            self.out,
            "[{:.3}] T: {:.1}°C, P: {:.1} hPa, rH: {:.1}%, G: {:.0} Ω, IAQ: {:.1} ({})",
            r.timestamp.as_secs_f64(),
            r.temperature,
            r.pressure / 100.0,
            r.humidity,
            r.gas_resistance,
            or_nan(r.iaq),
            r.accuracy,
        )?;
        if let Some(co2) = r.co2_equivalent {
            write!(self.out, ", CO2eq: {co2:.0} ppm")?;
        }
        if let Some(voc) = r.breath_voc_equivalent {
            write!(self.out, ", bVOCeq: {voc:.2} ppm")?;
        }
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}
