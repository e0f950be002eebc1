use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bip-play", version)]
pub struct Args {
    /// Path to an audio file
    #[arg(required_unless_present = "list_devices")]
    pub path: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Read-ahead queue size in seconds (clamped to 0.25..=4)
    #[arg(long, default_value_t = 1.0)]
    pub buffer_seconds: f64,

    /// Start position in seconds
    #[arg(long, default_value_t = 0.0)]
    pub start: f64,

    /// Stop after this many seconds of audio
    #[arg(long)]
    pub duration: Option<f64>,

    /// Play a short preview at --start instead of the whole file
    #[arg(long)]
    pub preview: bool,

    /// Linear output gain
    #[arg(long, default_value_t = 1.0)]
    pub gain: f32,

    /// Print the final player status as JSON
    #[arg(long)]
    pub stats: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_playback_flags() {
        let args = Args::try_parse_from([
            "bip-play",
            "song.flac",
            "--start",
            "12.5",
            "--duration",
            "3",
            "--gain",
            "0.5",
            "--stats",
        ])
        .unwrap();
        assert_eq!(args.path, Some(PathBuf::from("song.flac")));
        assert_eq!(args.start, 12.5);
        assert_eq!(args.duration, Some(3.0));
        assert_eq!(args.gain, 0.5);
        assert!(args.stats);
        assert!(!args.preview);
        assert_eq!(args.buffer_seconds, 1.0);
    }

    #[test]
    fn list_devices_needs_no_path() {
        let args = Args::try_parse_from(["bip-play", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.path.is_none());
    }

    #[test]
    fn path_required_for_playback() {
        assert!(Args::try_parse_from(["bip-play", "--stats"]).is_err());
    }
}
