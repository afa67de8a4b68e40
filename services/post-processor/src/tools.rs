//! External media tools: HDR tone mapping, text overlay and video encoding.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use timelapse_common::config::ProcessingConfig;
use timelapse_common::{ExternalCommand, ExternalToolError};

/// Operations the post-processor needs from outside tools. Every method
/// writes exactly one output file or fails.
#[async_trait]
pub trait FrameTools: Send + Sync {
    /// Merge a bracket (ordered by exposure) into one tone-mapped image.
    async fn hdr_merge(
        &self,
        method: &str,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<(), ExternalToolError>;

    /// Draw `text` in the top-left corner of `input`.
    async fn overlay_text(
        &self,
        input: &Path,
        text: &str,
        output: &Path,
    ) -> Result<(), ExternalToolError>;

    /// Encode numbered frames (`frame_%06d.bmp` style pattern) into a video.
    async fn encode_video(
        &self,
        frame_pattern: &Path,
        frame_rate: u32,
        output: &Path,
    ) -> Result<(), ExternalToolError>;
}

/// `luminance-hdr-cli` and `ffmpeg` on the local machine.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    hdr_command: String,
    ffmpeg_command: String,
    font_size: u32,
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            hdr_command: config.hdr_command.clone(),
            ffmpeg_command: config.ffmpeg_command.clone(),
            font_size: config.overlay_font_size,
            timeout: config.tool_timeout(),
        }
    }

    fn ffmpeg(&self) -> ExternalCommand {
        ExternalCommand::new(&self.ffmpeg_command)
            .args(["-y", "-loglevel", "error"])
            .timeout(self.timeout)
    }

    fn drawtext_filter(&self, text_file: &Path) -> String {
        format!(
            "drawtext=textfile={}:expansion=none:x=10:y=10:fontsize={}:fontcolor=white:borderw=2:bordercolor=black",
            quote_filter_value(&text_file.to_string_lossy()),
            self.font_size
        )
    }
}

/// Quote a value for an FFmpeg filtergraph option.
fn quote_filter_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl FrameTools for ToolRunner {
    async fn hdr_merge(
        &self,
        method: &str,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<(), ExternalToolError> {
        ExternalCommand::new(&self.hdr_command)
            .option("--tmo", method)
            .option("-o", output)
            .args(inputs)
            .timeout(self.timeout)
            .run()
            .await
    }

    async fn overlay_text(
        &self,
        input: &Path,
        text: &str,
        output: &Path,
    ) -> Result<(), ExternalToolError> {
        // drawtext reads the caption from a file so it needs no escaping
        let mut text_file = output.as_os_str().to_owned();
        text_file.push(".txt");
        let text_file = PathBuf::from(text_file);
        tokio::fs::write(&text_file, text)
            .await
            .map_err(|source| ExternalToolError::Io {
                program: self.ffmpeg_command.clone(),
                source,
            })?;

        let result = self
            .ffmpeg()
            .option("-i", input)
            .option("-vf", self.drawtext_filter(&text_file))
            .option("-frames:v", "1")
            .path(output)
            .run()
            .await;

        let _ = tokio::fs::remove_file(&text_file).await;
        result
    }

    async fn encode_video(
        &self,
        frame_pattern: &Path,
        frame_rate: u32,
        output: &Path,
    ) -> Result<(), ExternalToolError> {
        self.ffmpeg()
            .option("-framerate", frame_rate.to_string())
            .option("-i", frame_pattern)
            .option("-c:v", "libx264")
            .option("-pix_fmt", "yuv420p")
            // libx264 needs even dimensions
            .option("-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2")
            .path(output)
            .run()
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use parking_lot::Mutex;

    /// Writes real BMP files of a fixed size and records every call.
    pub(crate) struct FakeTools {
        pub width: u32,
        pub height: u32,
        pub hdr_calls: Mutex<Vec<(String, Vec<PathBuf>)>>,
        pub overlay_calls: Mutex<Vec<(PathBuf, String)>>,
        /// Contents of the staged frames seen by each encode call
        pub encoded: Mutex<Vec<Vec<Vec<u8>>>>,
        pub fail_hdr_method: Option<String>,
        /// HDR merge reports success without writing its output
        pub hdr_writes_nothing: bool,
    }

    impl FakeTools {
        pub(crate) fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                hdr_calls: Mutex::new(Vec::new()),
                overlay_calls: Mutex::new(Vec::new()),
                encoded: Mutex::new(Vec::new()),
                fail_hdr_method: None,
                hdr_writes_nothing: false,
            }
        }

        fn write_bmp(&self, path: &Path, shade: u8) -> Result<(), ExternalToolError> {
            RgbImage::from_pixel(self.width, self.height, Rgb([shade, 0, 0]))
                .save_with_format(path, image::ImageFormat::Bmp)
                .map_err(|e| ExternalToolError::Io {
                    program: "fake".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                })
        }
    }

    #[async_trait]
    impl FrameTools for FakeTools {
        async fn hdr_merge(
            &self,
            method: &str,
            inputs: &[PathBuf],
            output: &Path,
        ) -> Result<(), ExternalToolError> {
            if self.fail_hdr_method.as_deref() == Some(method) {
                return Err(ExternalToolError::Failed {
                    program: "luminance-hdr-cli".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "cannot align images".to_string(),
                });
            }
            self.hdr_calls
                .lock()
                .push((method.to_string(), inputs.to_vec()));
            if self.hdr_writes_nothing {
                return Ok(());
            }
            self.write_bmp(output, 0)
        }

        async fn overlay_text(
            &self,
            input: &Path,
            text: &str,
            output: &Path,
        ) -> Result<(), ExternalToolError> {
            let shade = {
                let mut calls = self.overlay_calls.lock();
                calls.push((input.to_path_buf(), text.to_string()));
                calls.len() as u8
            };
            self.write_bmp(output, shade)
        }

        async fn encode_video(
            &self,
            frame_pattern: &Path,
            _frame_rate: u32,
            output: &Path,
        ) -> Result<(), ExternalToolError> {
            let dir = frame_pattern.parent().unwrap();
            let mut names: Vec<_> = std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            names.sort();
            let frames = names.iter().map(|p| std::fs::read(p).unwrap()).collect();
            self.encoded.lock().push(frames);
            std::fs::write(output, b"mp4").unwrap();
            Ok(())
        }
    }

    #[test]
    fn test_quote_filter_value() {
        assert_eq!(quote_filter_value("/tmp/a.txt"), "'/tmp/a.txt'");
        assert_eq!(quote_filter_value("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_drawtext_filter() {
        let runner = ToolRunner::new(&ProcessingConfig::default());
        assert_eq!(
            runner.drawtext_filter(Path::new("/p/img.partial.bmp.txt")),
            "drawtext=textfile='/p/img.partial.bmp.txt':expansion=none:x=10:y=10:fontsize=16:fontcolor=white:borderw=2:bordercolor=black"
        );
    }
}
