use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser};
use video_ingest::Modality;
use vision::pipeline::{
    DEFAULT_DESTINATION, DetectorConfig, EncoderSettings, OutputConfig, OutputMode,
    PipelineConfig, SourceSelection, TelemetryOptions,
};

#[derive(Debug, Parser)]
#[command(
    name = "depthcam",
    version,
    about = "Capture depth camera frames, annotate detections and stream them through ffmpeg"
)]
pub struct Cli {
    #[command(flatten)]
    pub args: CliArgs,
}

#[derive(Debug, Args)]
pub struct CliArgs {
    /// Output destination: host:port when streaming, path pattern for PNGs.
    #[arg(short = 'd', long = "destination", value_name = "DEST", default_value = DEFAULT_DESTINATION)]
    pub destination: String,
    /// Stop after reading this many frames (also caps the output).
    #[arg(short = 'n', long = "frames", value_name = "N", allow_negative_numbers = true)]
    pub frames: Option<i64>,
    /// Send frames to the encoder.
    #[arg(short = 'o', long = "output", action = clap::ArgAction::SetTrue)]
    pub output: bool,
    /// Write a PNG sequence instead of a video stream.
    #[arg(short = 'p', long = "png", action = clap::ArgAction::SetTrue)]
    pub png: bool,

    /// `synthetic`, a device index or path, or any URI ffmpeg can open.
    #[arg(long = "source", value_name = "URI", default_value = "synthetic")]
    pub source: String,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: u32,
    /// Requested capture rate.
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<u32>,
    /// Modalities to capture; the first one is sent to the output.
    #[arg(long = "modality", value_name = "NAME", value_delimiter = ',', default_value = "color")]
    pub modality: Vec<String>,

    /// TorchScript detection model.
    #[arg(long = "model", value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// File listing the model's output layer types, one per line.
    #[arg(long = "model-config", value_name = "PATH")]
    pub model_config: Option<PathBuf>,
    /// Class name table, one name per line.
    #[arg(long = "classes", value_name = "PATH")]
    pub classes: Option<PathBuf>,
    /// Output layer type when no model config is given.
    #[arg(long = "output-layer", value_name = "KIND")]
    pub output_layer: Option<String>,
    /// Side of the square detector input.
    #[arg(long = "input-size", value_name = "PX")]
    pub input_size: Option<u32>,
    /// Pixel scale applied before inference.
    #[arg(long = "scale", value_name = "FACTOR")]
    pub scale: Option<f32>,
    /// Minimum detection confidence.
    #[arg(long = "conf-threshold", value_name = "CONF")]
    pub conf_threshold: Option<f32>,
    /// IoU above which overlapping boxes are suppressed.
    #[arg(long = "nms-threshold", value_name = "IOU")]
    pub nms_threshold: Option<f32>,
    /// JSON document with detector settings; flags above override it.
    #[arg(long = "detector-config", value_name = "PATH")]
    pub detector_config: Option<PathBuf>,

    /// Encoder binary.
    #[arg(long = "encoder", value_name = "BIN")]
    pub encoder: Option<String>,
    /// Video codec used when streaming.
    #[arg(long = "codec", value_name = "CODEC")]
    pub codec: Option<String>,
    /// Where the encoder writes the SDP description.
    #[arg(long = "sdp-file", value_name = "PATH")]
    pub sdp_file: Option<PathBuf>,

    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Write a Prometheus metrics snapshot on shutdown.
    #[arg(long = "metrics-out", value_name = "PATH")]
    pub metrics_out: Option<PathBuf>,
}

impl CliArgs {
    fn wants_detector(&self) -> bool {
        self.model.is_some() || self.detector_config.is_some() || self.classes.is_some()
    }

    fn detector(&self) -> Result<Option<DetectorConfig>> {
        if !self.wants_detector() {
            return Ok(None);
        }
        let mut detector = match &self.detector_config {
            Some(path) => DetectorConfig::from_json_file(path)?,
            None => DetectorConfig::default(),
        };
        if let Some(model) = &self.model {
            detector.model = Some(model.clone());
        }
        if let Some(model_config) = &self.model_config {
            detector.model_config = Some(model_config.clone());
        }
        if let Some(classes) = &self.classes {
            detector.classes = Some(classes.clone());
        }
        if let Some(output_layer) = &self.output_layer {
            detector.output_layer = output_layer.clone();
        }
        if let Some(input_size) = self.input_size {
            detector.input_size = input_size;
        }
        if let Some(scale) = self.scale {
            detector.scale = scale;
        }
        if let Some(conf) = self.conf_threshold {
            detector.conf_threshold = conf;
        }
        if let Some(nms) = self.nms_threshold {
            detector.nms_threshold = nms;
        }
        Ok(Some(detector))
    }
}

impl TryFrom<CliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self> {
        let modalities = args
            .modality
            .iter()
            .map(|name| {
                name.parse::<Modality>()
                    .with_context(|| format!("--modality {name:?} is not a known modality"))
            })
            .collect::<Result<Vec<_>>>()?;
        let Some(&primary) = modalities.first() else {
            bail!("--modality needs at least one value");
        };

        // Zero or negative counts mean "until interrupted".
        let frame_limit = args.frames.filter(|n| *n > 0).map(|n| n as u64);

        let detector = args.detector()?;

        let output = args.output.then(|| {
            let defaults = EncoderSettings::default();
            OutputConfig {
                modality: primary,
                mode: if args.png {
                    OutputMode::Sequence
                } else {
                    OutputMode::Stream
                },
                destination: args.destination.clone(),
                frame_limit,
                encoder: EncoderSettings {
                    binary: args.encoder.clone().unwrap_or(defaults.binary),
                    codec: args.codec.clone().unwrap_or(defaults.codec),
                    sdp_file: args.sdp_file.clone().unwrap_or(defaults.sdp_file),
                },
            }
        });

        let config = PipelineConfig {
            source: SourceSelection::from_arg(&args.source),
            width: args.width,
            height: args.height,
            fps: args.fps,
            modalities,
            frame_limit,
            output,
            detector,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_out: args.metrics_out,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(argv: &[&str]) -> Result<PipelineConfig> {
        let mut full = vec!["depthcam"];
        full.extend_from_slice(argv);
        let cli = Cli::try_parse_from(full)?;
        PipelineConfig::try_from(cli.args)
    }

    #[test]
    fn defaults_run_synthetic_without_side_effects() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.source, SourceSelection::Synthetic);
        assert_eq!(config.frame_limit, None);
        assert!(config.output.is_none());
        assert!(config.detector.is_none());
        assert_eq!(config.modalities, vec![Modality::Color]);
    }

    #[test]
    fn output_flags_build_stream_config() {
        let config = parse(&["-o", "-n", "25", "-d", "10.1.1.1:9000"]).unwrap();
        let output = config.output.unwrap();
        assert_eq!(output.mode, OutputMode::Stream);
        assert_eq!(output.destination, "10.1.1.1:9000");
        assert_eq!(output.frame_limit, Some(25));
        assert_eq!(config.frame_limit, Some(25));
        assert_eq!(output.encoder, EncoderSettings::default());
    }

    #[test]
    fn png_flag_switches_to_sequence() {
        let config = parse(&["-o", "-p", "-d", "/tmp/frame_%04d.png"]).unwrap();
        assert_eq!(config.output.unwrap().mode, OutputMode::Sequence);
    }

    #[test]
    fn default_destination_is_used() {
        let config = parse(&["-o"]).unwrap();
        assert_eq!(config.output.unwrap().destination, DEFAULT_DESTINATION);
    }

    #[test]
    fn non_positive_frame_count_is_unbounded() {
        assert_eq!(parse(&["-n", "-1"]).unwrap().frame_limit, None);
        assert_eq!(parse(&["-n", "0"]).unwrap().frame_limit, None);
    }

    #[test]
    fn unknown_modality_is_rejected() {
        assert!(parse(&["--modality", "thermal"]).is_err());
    }

    #[test]
    fn several_modalities_can_be_captured() {
        assert!(parse(&["-o", "--modality", "color,depth"]).is_ok());
        let config = parse(&["--modality", "color,depth"]).unwrap();
        assert_eq!(config.modalities, vec![Modality::Color, Modality::Depth]);
    }

    #[test]
    fn detector_flags_override_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"input_size": 320, "conf_threshold": 0.3, "output_layer": "Region"}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = parse(&["--detector-config", &path, "--conf-threshold", "0.6"]).unwrap();
        let detector = config.detector.unwrap();
        assert_eq!(detector.input_size, 320);
        assert_eq!(detector.conf_threshold, 0.6);
        assert_eq!(detector.output_layer, "Region");
        assert_eq!(detector.nms_threshold, 0.4);
    }

    #[test]
    fn model_flag_enables_detector() {
        let config = parse(&["--model", "net.pt", "--input-size", "416"]).unwrap();
        let detector = config.detector.unwrap();
        assert_eq!(detector.model, Some(PathBuf::from("net.pt")));
        assert_eq!(detector.input_size, 416);
    }

    #[test]
    fn invalid_threshold_fails_validation() {
        assert!(parse(&["--model", "net.pt", "--nms-threshold", "1.5"]).is_err());
    }

    #[test]
    fn device_source_is_kept_verbatim() {
        let config = parse(&["--source", "/dev/video2", "--fps", "30"]).unwrap();
        assert_eq!(config.source, SourceSelection::Device("/dev/video2".into()));
        assert_eq!(config.fps, Some(30));
    }
}
