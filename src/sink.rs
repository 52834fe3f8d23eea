//! Result sinks polled by the monitor/display stage.

use std::io::Write;

use anyhow::{Context, Result};

use crate::detect::DetectionSnapshot;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[1;1H";

/// Result sink collaborator.
pub trait ResultSink: Send {
    fn name(&self) -> &'static str;

    fn publish(&mut self, snapshot: &DetectionSnapshot) -> Result<()>;
}

/// Redraws a detection table on a terminal.
pub struct ConsoleSink<W: Write + Send> {
    out: W,
    clear_screen: bool,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            clear_screen: true,
        }
    }

    pub fn without_clear(mut self) -> Self {
        self.clear_screen = false;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ResultSink for ConsoleSink<W> {
    fn name(&self) -> &'static str {
        "console"
    }

    fn publish(&mut self, snapshot: &DetectionSnapshot) -> Result<()> {
        let mut text = String::new();
        if self.clear_screen {
            text.push_str(CLEAR_SCREEN);
        }
        text.push_str("Detection Results:\n");
        text.push_str("================\n");
        for det in &snapshot.detections {
            text.push_str(&format!(
                "Object: {}, Confidence: {:.2}, Box: ({}, {}, {}, {})\n",
                det.class_name,
                det.confidence,
                det.bbox.x,
                det.bbox.y,
                det.bbox.width,
                det.bbox.height
            ));
        }
        self.out
            .write_all(text.as_bytes())
            .and_then(|_| self.out.flush())
            .context("write detection table")
    }
}

/// Emits one `info` line per result set.
#[derive(Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn publish(&mut self, snapshot: &DetectionSnapshot) -> Result<()> {
        let summary: Vec<String> = snapshot
            .detections
            .iter()
            .map(|d| format!("{}@{:.2}", d.class_name, d.confidence))
            .collect();
        log::info!(
            "detections #{}: {} object(s) [{}] inference={:?}",
            snapshot.sequence,
            snapshot.detections.len(),
            summary.join(", "),
            snapshot.inference_time
        );
        Ok(())
    }
}
