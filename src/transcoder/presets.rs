//! Fixed encoder presets per target height.

/// One quality tier. The scaler fits the source inside `width`x`height`
/// preserving aspect ratio, then pads the short axis with black to hit the
/// exact target dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPreset {
    pub height: i64,
    pub width: i64,
    pub video_bitrate_k: u32,
    pub audio_bitrate_k: u32,
    pub audio_sample_rate: u32,
}

pub const PRESETS: [QualityPreset; 3] = [
    QualityPreset {
        height: 480,
        width: 854,
        video_bitrate_k: 1000,
        audio_bitrate_k: 128,
        audio_sample_rate: 44_100,
    },
    QualityPreset {
        height: 720,
        width: 1280,
        video_bitrate_k: 2500,
        audio_bitrate_k: 192,
        audio_sample_rate: 44_100,
    },
    QualityPreset {
        height: 1080,
        width: 1920,
        video_bitrate_k: 5000,
        audio_bitrate_k: 256,
        audio_sample_rate: 44_100,
    },
];

pub fn preset_for(quality: i64) -> Option<&'static QualityPreset> {
    PRESETS.iter().find(|p| p.height == quality)
}

pub fn is_supported(quality: i64) -> bool {
    preset_for(quality).is_some()
}

pub fn supported_qualities() -> Vec<i64> {
    PRESETS.iter().map(|p| p.height).collect()
}

impl QualityPreset {
    /// Fit-and-pad filter: scale down to fit, pad the remainder with black,
    /// centered.
    pub fn scale_filter(&self) -> String {
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            w = self.width,
            h = self.height
        )
    }

    /// Full ffmpeg argument list for transcoding `input` into `output`.
    /// MP4 with faststart; peak bitrate equals target, VBV buffer is twice
    /// the target; progress telemetry on stdout.
    pub fn ffmpeg_args(&self, input: &str, output: &str) -> Vec<String> {
        let video_bitrate = format!("{}k", self.video_bitrate_k);
        let bufsize = format!("{}k", self.video_bitrate_k * 2);
        let audio_bitrate = format!("{}k", self.audio_bitrate_k);

        vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string(),
            // Video settings
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-vf".to_string(),
            self.scale_filter(),
            "-b:v".to_string(),
            video_bitrate.clone(),
            "-maxrate".to_string(),
            video_bitrate,
            "-bufsize".to_string(),
            bufsize,
            // Audio settings
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            audio_bitrate,
            "-ar".to_string(),
            self.audio_sample_rate.to_string(),
            // Output format
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            // Progress output
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
            output.to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_lookup() {
        assert!(is_supported(480));
        assert!(is_supported(720));
        assert!(is_supported(1080));
        assert!(!is_supported(360));
        assert!(!is_supported(2160));
        assert_eq!(supported_qualities(), vec![480, 720, 1080]);
    }

    #[test]
    fn preset_parameters_match_the_tier_table() {
        let p720 = preset_for(720).unwrap();
        assert_eq!(p720.width, 1280);
        assert_eq!(p720.video_bitrate_k, 2500);
        assert_eq!(p720.audio_bitrate_k, 192);
    }

    #[test]
    fn scale_filter_fits_and_pads() {
        let p = preset_for(480).unwrap();
        assert_eq!(
            p.scale_filter(),
            "scale=854:480:force_original_aspect_ratio=decrease,pad=854:480:(ow-iw)/2:(oh-ih)/2"
        );
    }

    #[test]
    fn ffmpeg_args_carry_vbv_and_faststart() {
        let p = preset_for(1080).unwrap();
        let args = p.ffmpeg_args("in.mkv", "out.mp4");
        let joined = args.join(" ");
        assert!(joined.contains("-b:v 5000k"));
        assert!(joined.contains("-maxrate 5000k"));
        assert!(joined.contains("-bufsize 10000k"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.contains("-progress pipe:1"));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }
}
