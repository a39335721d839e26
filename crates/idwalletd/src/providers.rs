//! OCR and face-detection providers backed by external commands.
//!
//! Each call encodes the upright frame as PNG, pipes it to the configured
//! program on stdin and parses its stdout. The face detector additionally
//! receives its options as JSON in `IDWALLET_DETECTOR_OPTIONS`.

use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

use idwallet_core::{
    DetectedFace, DetectorOptions, FaceDetectionProvider, OcrProvider, ProviderError,
    RecognizedText,
};
use image::{ImageFormat, RgbImage};

use crate::engine::{ProviderFactory, Providers};

/// A program plus its arguments, parsed from a whitespace-separated command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    fn run(&self, input: &[u8], envs: &[(&str, String)]) -> Result<Vec<u8>, ProviderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProviderError::Failed(format!("{}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Failed("child stdin unavailable".into()))?;

        // Write on a separate thread so a chatty child cannot fill its stdout
        // pipe while we are still blocked writing stdin.
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(input));
            let output = child.wait_with_output();
            // A child that exits without reading all input is not an error.
            let _ = writer.join();
            output
        })
        .map_err(|e| ProviderError::Failed(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ProviderError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| ProviderError::Failed(format!("png encode: {e}")))?;
    Ok(buf.into_inner())
}

/// OCR through a command such as `tesseract stdin stdout`.
pub struct CommandOcr {
    command: CommandLine,
}

impl CommandOcr {
    pub fn new(command: CommandLine) -> Self {
        Self { command }
    }
}

impl OcrProvider for CommandOcr {
    fn process(&mut self, image: &RgbImage) -> Result<RecognizedText, ProviderError> {
        let png = encode_png(image)?;
        let stdout = self.command.run(&png, &[])?;
        let text = String::from_utf8_lossy(&stdout).into_owned();
        tracing::trace!(chars = text.len(), "ocr text received");
        Ok(RecognizedText::new(text))
    }
}

/// Face detection through a command that prints a JSON array of faces.
pub struct CommandFaceDetector {
    command: CommandLine,
}

impl CommandFaceDetector {
    pub fn new(command: CommandLine) -> Self {
        Self { command }
    }
}

impl FaceDetectionProvider for CommandFaceDetector {
    fn process(
        &mut self,
        image: &RgbImage,
        options: &DetectorOptions,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        let png = encode_png(image)?;
        let options =
            serde_json::to_string(options).map_err(|e| ProviderError::Failed(e.to_string()))?;
        let stdout = self
            .command
            .run(&png, &[("IDWALLET_DETECTOR_OPTIONS", options)])?;
        serde_json::from_slice(&stdout).map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

/// Builds a fresh pair of command providers for every session.
pub struct CommandProviders {
    pub ocr: CommandLine,
    pub faces: CommandLine,
}

impl ProviderFactory for CommandProviders {
    fn create(&self) -> Providers {
        Providers {
            ocr: Box::new(CommandOcr::new(self.ocr.clone())),
            faces: Box::new(CommandFaceDetector::new(self.faces.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idwallet_core::LandmarkKind;

    fn sh(script: &str) -> CommandLine {
        CommandLine {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn image() -> RgbImage {
        RgbImage::from_pixel(8, 6, image::Rgb([120, 120, 120]))
    }

    #[test]
    fn test_parse_command_line() {
        let cmd = CommandLine::parse("  tesseract stdin   stdout ").unwrap();
        assert_eq!(cmd.program, "tesseract");
        assert_eq!(cmd.args, vec!["stdin", "stdout"]);
        assert!(CommandLine::parse("   ").is_none());
    }

    #[test]
    fn test_ocr_reads_stdout() {
        let mut ocr = CommandOcr::new(sh("cat >/dev/null; echo 'AADHAAR 2345 6789 0124'"));
        let text = ocr.process(&image()).unwrap();
        assert!(text.text.contains("2345 6789 0124"));
    }

    #[test]
    fn test_ocr_receives_png() {
        // PNG signature starts with 0x89 'P' 'N' 'G'
        let mut ocr = CommandOcr::new(sh("head -c 4 | tail -c 3"));
        let text = ocr.process(&image()).unwrap();
        assert_eq!(text.text, "PNG");
    }

    #[test]
    fn test_failing_command_is_provider_error() {
        let mut ocr = CommandOcr::new(sh("cat >/dev/null; echo boom >&2; exit 3"));
        let err = ocr.process(&image()).unwrap_err();
        assert!(matches!(err, ProviderError::Failed(msg) if msg.contains("boom")));
    }

    #[test]
    fn test_missing_program_is_provider_error() {
        let mut ocr = CommandOcr::new(CommandLine::parse("/nonexistent/idwallet-ocr").unwrap());
        assert!(matches!(
            ocr.process(&image()),
            Err(ProviderError::Failed(_))
        ));
    }

    #[test]
    fn test_face_detector_parses_json() {
        let json = r#"[{"bounding_box":{"x":1.0,"y":2.0,"width":3.0,"height":4.0},"landmarks":[["left_eye",{"x":1.5,"y":2.5}]],"left_eye_open_probability":0.9}]"#;
        let mut detector = CommandFaceDetector::new(sh(&format!("cat >/dev/null; printf '%s' '{json}'")));
        let faces = detector
            .process(&image(), &DetectorOptions::default())
            .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bounding_box.width, 3.0);
        assert_eq!(faces[0].landmarks[0].0, LandmarkKind::LeftEye);
        assert_eq!(faces[0].left_eye_open_probability, Some(0.9));
    }

    #[test]
    fn test_face_detector_passes_options() {
        let mut detector = CommandFaceDetector::new(sh(
            "cat >/dev/null; case \"$IDWALLET_DETECTOR_OPTIONS\" in *accurate*) echo '[]';; *) exit 1;; esac",
        ));
        let faces = detector
            .process(&image(), &DetectorOptions::default())
            .unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_face_detector_rejects_garbage() {
        let mut detector = CommandFaceDetector::new(sh("cat >/dev/null; echo 'not json'"));
        assert!(matches!(
            detector.process(&image(), &DetectorOptions::default()),
            Err(ProviderError::Malformed(_))
        ));
    }
}
