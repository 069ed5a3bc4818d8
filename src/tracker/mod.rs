//! Experiment trackers.
//!
//! Tracker failures never abort training: callers go through
//! [`log_scalars_or_warn`] / [`log_images_or_warn`].

mod grid;

pub use grid::*;

use core::fmt;
use core::str::FromStr;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DdpmError, Result};

/// Sink for scalar metrics and sample images.
pub trait Tracker {
    fn log_scalars(&mut self, scalars: &[(&str, f64)], step: usize) -> Result<()>;
    fn log_images(&mut self, name: &str, images: &[RgbImage], step: usize) -> Result<()>;
}

pub fn log_scalars_or_warn(tracker: &mut dyn Tracker, scalars: &[(&str, f64)], step: usize) {
    if let Err(err) = tracker.log_scalars(scalars, step) {
        tracing::warn!("tracker failed to log scalars at step {step}: {err}");
    }
}

pub fn log_images_or_warn(tracker: &mut dyn Tracker, name: &str, images: &[RgbImage], step: usize) {
    if let Err(err) = tracker.log_images(name, images, step) {
        tracing::warn!("tracker failed to log images `{name}` at step {step}: {err}");
    }
}

/// Which tracker backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    #[default]
    Jsonl,
    None,
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Jsonl => "jsonl",
            Self::None => "none",
        })
    }
}

impl FromStr for TrackerKind {
    type Err = DdpmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jsonl" => Ok(Self::Jsonl),
            "none" => Ok(Self::None),
            other => Err(DdpmError::config(
                "logger",
                format!("unsupported tracker `{other}` (expected jsonl or none)"),
            )),
        }
    }
}

impl TrackerKind {
    pub fn init(&self, logging_dir: impl AsRef<Path>) -> Result<Box<dyn Tracker>> {
        Ok(match self {
            Self::Jsonl => Box::new(JsonlTracker::new(logging_dir)?),
            Self::None => Box::new(NoopTracker),
        })
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn log_scalars(&mut self, _scalars: &[(&str, f64)], _step: usize) -> Result<()> { Ok(()) }
    fn log_images(&mut self, _name: &str, _images: &[RgbImage], _step: usize) -> Result<()> { Ok(()) }
}

/// Appends one JSON object per call to `metrics.jsonl` and writes image grids as PNG.
pub struct JsonlTracker {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTracker {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new().create(true).append(true).open(dir.join("metrics.jsonl"))?;
        Ok(Self { dir, writer: BufWriter::new(file) })
    }
}

impl Tracker for JsonlTracker {
    fn log_scalars(&mut self, scalars: &[(&str, f64)], step: usize) -> Result<()> {
        let mut row = Map::new();
        row.insert("step".into(), Value::from(step));
        for (name, value) in scalars {
            row.insert((*name).to_string(), Value::from(*value));
        }
        serde_json::to_writer(&mut self.writer, &Value::Object(row))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn log_images(&mut self, name: &str, images: &[RgbImage], step: usize) -> Result<()> {
        let grid = make_grid(images)?;
        grid.save(self.dir.join(format!("{name}_{step:06}.png")))?;
        Ok(())
    }
}
