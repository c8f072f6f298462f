use serde::{Deserialize, Serialize};
use crate::error::ConvertError;

/// Point-in-time encoding progress.
///
/// `Progress::default()` is the idle snapshot: no conversion is running, one
/// just finished, or one failed. Observers cannot tell these apart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// File name of the input being converted, empty when idle
    pub input_file: String,
    pub frame: u64,
    pub fps: f64,
    /// Output bitrate in kbit/s
    pub bitrate_kbps: f64,
    /// Bytes written to the output so far
    pub total_size: u64,
    /// Position in the output stream in microseconds
    pub out_time_us: i64,
    /// Position in the output stream as `HH:MM:SS.micro`
    pub out_time: String,
    pub dup_frames: u64,
    pub drop_frames: u64,
    /// Encoding speed relative to realtime
    pub speed: f64,
    /// 0-100, only meaningful when the input duration is known
    pub percent_complete: f64,
}

impl Progress {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Incremental parser for ffmpeg's `-progress` output.
///
/// ffmpeg writes `key=value` lines and terminates each block with
/// `progress=continue` or `progress=end`; a snapshot is emitted per block.
#[derive(Debug, Default)]
pub struct ProgressParser {
    duration_us: Option<i64>,
    current: Progress,
}

impl ProgressParser {
    pub fn new(input_file: impl Into<String>) -> Self {
        Self {
            current: Progress { input_file: input_file.into(), ..Progress::default() },
            duration_us: None,
        }
    }

    /// Total input duration, used to compute `percent_complete`
    pub fn set_duration_secs(&mut self, secs: f64) {
        if secs.is_finite() && secs > 0.0 {
            self.duration_us = Some((secs * 1_000_000.0) as i64);
        }
    }

    /// Feed one line of ffmpeg output. Returns a snapshot at the end of each
    /// block. A malformed value is reported as `EngineParse` and the field
    /// keeps its previous value.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<Progress>, ConvertError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConvertError::EngineParse(format!("not a key=value line: {}", line)))?;
        let (key, value) = (key.trim(), value.trim());

        // ffmpeg reports N/A before the first frame is muxed
        if value == "N/A" {
            return Ok(None);
        }

        match key {
            "frame" => self.current.frame = parse_value(key, value)?,
            "fps" => self.current.fps = parse_value(key, value)?,
            "bitrate" => {
                self.current.bitrate_kbps = parse_value(key, value.trim_end_matches("kbits/s"))?
            }
            "total_size" => self.current.total_size = parse_value(key, value)?,
            "out_time_us" => {
                self.current.out_time_us = parse_value(key, value)?;
                self.current.percent_complete = self.percent(self.current.out_time_us);
            }
            "out_time" => self.current.out_time = value.to_string(),
            "dup_frames" => self.current.dup_frames = parse_value(key, value)?,
            "drop_frames" => self.current.drop_frames = parse_value(key, value)?,
            "speed" => self.current.speed = parse_value(key, value.trim_end_matches('x'))?,
            "progress" => {
                if value == "end" && self.duration_us.is_some() {
                    self.current.percent_complete = 100.0;
                }
                return Ok(Some(self.current.clone()));
            }
            // out_time_ms (really microseconds), stream_N_N_q and friends
            _ => {}
        }

        Ok(None)
    }

    fn percent(&self, out_time_us: i64) -> f64 {
        match self.duration_us {
            Some(total) if total > 0 && out_time_us > 0 => {
                (out_time_us as f64 / total as f64 * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConvertError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConvertError::EngineParse(format!("invalid value for {}: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BLOCK: &str = "frame=240\nfps=47.9\nstream_0_0_q=28.0\nbitrate=1843.2kbits/s\n\
total_size=2359296\nout_time_us=10000000\nout_time_ms=10000000\nout_time=00:00:10.000000\n\
dup_frames=1\ndrop_frames=0\nspeed=1.92x\nprogress=continue\n";

    fn feed_all(parser: &mut ProgressParser, text: &str) -> Vec<Progress> {
        text.lines().filter_map(|l| parser.feed_line(l).unwrap()).collect()
    }

    #[test]
    fn test_idle_snapshot() {
        assert!(Progress::idle().is_idle());
        let busy = Progress { frame: 1, ..Progress::default() };
        assert!(!busy.is_idle());
    }

    #[test]
    fn test_parses_full_block() {
        let mut parser = ProgressParser::new("movie.mkv");
        parser.set_duration_secs(40.0);

        let snapshots = feed_all(&mut parser, BLOCK);
        assert_eq!(snapshots.len(), 1);

        let p = &snapshots[0];
        assert_eq!(p.input_file, "movie.mkv");
        assert_eq!(p.frame, 240);
        assert!((p.fps - 47.9).abs() < f64::EPSILON);
        assert!((p.bitrate_kbps - 1843.2).abs() < 1e-9);
        assert_eq!(p.total_size, 2_359_296);
        assert_eq!(p.out_time_us, 10_000_000);
        assert_eq!(p.out_time, "00:00:10.000000");
        assert_eq!(p.dup_frames, 1);
        assert!((p.speed - 1.92).abs() < 1e-9);
        assert!((p.percent_complete - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_not_available_values_are_skipped() {
        let mut parser = ProgressParser::new("clip.mp4");
        let snapshots = feed_all(
            &mut parser,
            "frame=0\nbitrate=N/A\ntotal_size=N/A\nout_time_us=N/A\nspeed=N/A\nprogress=continue\n",
        );
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].bitrate_kbps, 0.0);
        assert_eq!(snapshots[0].percent_complete, 0.0);
    }

    #[test]
    fn test_malformed_value_is_parse_error_and_keeps_state() {
        let mut parser = ProgressParser::new("clip.mp4");
        parser.feed_line("frame=10").unwrap();

        let err = parser.feed_line("frame=ten").unwrap_err();
        assert!(matches!(err, ConvertError::EngineParse(_)));

        let err = parser.feed_line("garbage without separator").unwrap_err();
        assert!(matches!(err, ConvertError::EngineParse(_)));

        let p = parser.feed_line("progress=continue").unwrap().unwrap();
        assert_eq!(p.frame, 10);
    }

    #[test]
    fn test_end_block_reports_complete_when_duration_known() {
        let mut parser = ProgressParser::new("clip.mp4");
        parser.set_duration_secs(100.0);
        let p = feed_all(&mut parser, "out_time_us=99000000\nprogress=end\n").pop().unwrap();
        assert_eq!(p.percent_complete, 100.0);

        let mut parser = ProgressParser::new("clip.mp4");
        let p = feed_all(&mut parser, "out_time_us=99000000\nprogress=end\n").pop().unwrap();
        assert_eq!(p.percent_complete, 0.0);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let json = serde_json::to_value(Progress::idle()).unwrap();
        assert_eq!(json["frame"], 0);
        assert_eq!(json["input_file"], "");
        assert_eq!(json["percent_complete"], 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Percent complete never leaves the 0..=100 range, whatever ffmpeg reports
        #[test]
        fn test_percent_is_bounded(
            duration_secs in 0.1f64..100_000.0,
            out_time_us in -1_000_000i64..i64::MAX / 2,
        ) {
            let mut parser = ProgressParser::new("x.mp4");
            parser.set_duration_secs(duration_secs);
            parser.feed_line(&format!("out_time_us={}", out_time_us)).unwrap();
            let p = parser.feed_line("progress=continue").unwrap().unwrap();
            prop_assert!(p.percent_complete >= 0.0);
            prop_assert!(p.percent_complete <= 100.0);
        }

        /// Arbitrary junk never panics the parser
        #[test]
        fn test_arbitrary_lines_never_panic(line in ".*") {
            let mut parser = ProgressParser::new("x.mp4");
            let _ = parser.feed_line(&line);
        }
    }
}
