//! Image probing and conversion through `qemu-img`

use crate::backend::{ConvertRequest, ImageTool};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info};

/// Configuration for the qemu-img tool
#[derive(Debug, Clone)]
pub struct QemuImgConfig {
    /// qemu-img executable
    pub program: String,
}

impl Default for QemuImgConfig {
    fn default() -> Self {
        Self {
            program: "qemu-img".to_string(),
        }
    }
}

/// Subset of `qemu-img info --output=json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct QemuImgInfo {
    format: String,
    #[allow(dead_code)]
    virtual_size: Option<u64>,
}

/// Image tool backed by the `qemu-img` binary
pub struct QemuImgTool {
    config: QemuImgConfig,
}

impl QemuImgTool {
    /// Create a tool using the default `qemu-img`, checking that it runs
    pub fn new() -> Result<Self> {
        Self::with_config(QemuImgConfig::default())
    }

    /// Create a tool with custom configuration, checking that it runs
    pub fn with_config(config: QemuImgConfig) -> Result<Self> {
        let available = Command::new(&config.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success());
        if !available {
            return Err(Error::ToolNotFound(config.program));
        }
        Ok(Self { config })
    }

    fn command_line(&self, args: &[&str]) -> String {
        format!("{} {}", self.config.program, args.join(" "))
    }

    fn convert_args<'a>(request: &'a ConvertRequest<'a>, progress: bool) -> Vec<&'a str> {
        let mut args = vec![
            "convert",
            "-f",
            request.source_format.as_str(),
            "-O",
            request.destination_format.as_str(),
        ];
        if progress {
            args.push("-p");
        }
        args
    }

    /// Run a conversion while feeding `-p` output frames to `progress`
    fn convert_with_progress(
        &self,
        request: &ConvertRequest<'_>,
        progress: &mut dyn FnMut(f32),
    ) -> Result<()> {
        let args = Self::convert_args(request, true);
        let mut child = Command::new(&self.config.program)
            .args(&args)
            .arg(request.source)
            .arg(request.destination)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            follow_progress(stdout, progress);
        }

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: self.command_line(&args),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

/// Report progress from `stream` until it closes.
///
/// If the frames cannot be read the rest of the stream is still drained, so
/// qemu-img never writes into a closed pipe.
fn follow_progress(mut stream: impl Read, progress: &mut dyn FnMut(f32)) {
    if let Err(e) = read_progress(&mut stream, progress) {
        debug!(error = %e, "progress output unavailable, continuing silently");
        if let Err(e) = io::copy(&mut stream, &mut io::sink()) {
            debug!(error = %e, "failed to drain progress output");
        }
    }
}

/// Feed every progress frame found on `stream` to `progress`
fn read_progress(stream: impl Read, progress: &mut dyn FnMut(f32)) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();
    loop {
        frame.clear();
        if reader.read_until(b'\r', &mut frame)? == 0 {
            return Ok(());
        }
        for line in String::from_utf8_lossy(&frame).split(['\r', '\n']) {
            if let Some(percent) = parse_progress(line) {
                progress(percent);
            }
        }
    }
}

/// Parse one `qemu-img -p` frame such as `    (42.00/100%)`
pub fn parse_progress(frame: &str) -> Option<f32> {
    let inner = frame.trim().strip_prefix('(')?.strip_suffix(')')?;
    let (done, total) = inner.split_once('/')?;
    if total.trim() != "100%" {
        return None;
    }
    let percent: f32 = done.trim().parse().ok()?;
    Some(percent.clamp(0.0, 100.0))
}

impl ImageTool for QemuImgTool {
    fn probe_format(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.config.program)
            .args(["info", "--output=json"])
            .arg(path)
            .output()?;

        if !output.status.success() {
            return Err(Error::Probe {
                path: path.to_path_buf(),
                cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let info: QemuImgInfo = serde_json::from_slice(&output.stdout)?;
        Ok(info.format)
    }

    fn convert(
        &self,
        request: &ConvertRequest<'_>,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<()> {
        info!(
            src = %request.source.display(),
            dst = %request.destination.display(),
            from = %request.source_format,
            to = %request.destination_format,
            "Converting disk image"
        );

        if let Some(progress) = progress {
            return self.convert_with_progress(request, progress);
        }

        let args = Self::convert_args(request, false);
        let output = Command::new(&self.config.program)
            .args(&args)
            .arg(request.source)
            .arg(request.destination)
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: self.command_line(&args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
