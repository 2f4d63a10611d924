//! Capture process backends.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::utils::process::capture_command;

/// Builds the command that captures one source into one file.
///
/// The process must report progress on stderr in ffmpeg's stats format and
/// treat a `q` on stdin as a request to finish the file and exit.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    fn command(&self, source: &str, output: &Path) -> Command;
}

/// ffmpeg remuxing the source without re-encoding.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg_path: PathBuf,
    input_args: Vec<String>,
    output_args: Vec<String>,
}

impl FfmpegBackend {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }

    /// Extra arguments placed before `-i`.
    pub fn with_input_args(mut self, args: Vec<String>) -> Self {
        self.input_args = args;
        self
    }

    /// Extra arguments placed before the output path.
    pub fn with_output_args(mut self, args: Vec<String>) -> Self {
        self.output_args = args;
        self
    }

    /// Full argument list for one capture.
    pub fn args(&self, source: &str, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "info", "-stats", "-y"]
            .map(String::from)
            .to_vec();
        args.extend(self.input_args.iter().cloned());
        args.extend(["-i".to_string(), source.to_string()]);
        args.extend(["-c", "copy"].map(String::from));
        args.extend(self.output_args.iter().cloned());
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl CaptureBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn command(&self, source: &str, output: &Path) -> Command {
        let mut cmd = capture_command(&self.ffmpeg_path);
        // Force consistent output
        cmd.env("LC_ALL", "C").args(self.args(source, output));
        cmd
    }
}
