//! Settings file of the accelerated stream pipeline.
//!
//! Plain `key=value` lines next to the executable; the channel takes a
//! snapshot at construction and at reset, so nothing reads the file while
//! the pipeline runs.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const CONFIG_FILE_NAME: &str = "mirador_stream.config";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    /// <0 disables the pipeline, 0 uses the in-band path, >0 selects the
    /// sidecar port (absolute above 1000, else an offset on the main port).
    pub stream_port: i32,
    pub stream_on_movie_detection: i32,
    pub on_variation_capture: i32,
    pub max_sampling_fps: i32,
    /// 1 bypasses audio synchronisation for lower latency.
    pub audio_sync_not: i32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            stream_port: 0,
            stream_on_movie_detection: 0,
            on_variation_capture: 1,
            max_sampling_fps: 30,
            audio_sync_not: 0,
        }
    }
}

const KEYS: [&str; 5] = [
    "stream_port",
    "stream_onMovieDetection",
    "on_variation_capture",
    "max_sampling_fps",
    "audio_sync_not",
];

impl StreamSettings {
    /// `opt/mirador_stream.config` next to the executable, falling back to
    /// the working directory.
    pub fn default_path() -> PathBuf {
        let base = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        base.join("opt").join(CONFIG_FILE_NAME)
    }

    /// Reads the settings file, writing a commented template with the
    /// defaults first if it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let defaults = Self::default();
            fs::write(path, defaults.template())
                .with_context(|| format!("writing {}", path.display()))?;
            log::info!("wrote default stream settings to {}", path.display());
            return Ok(defaults);
        }

        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let settings = Self::parse(&text);
        log::info!(
            "stream settings: port {}, on_movie_detection {}, on_variation_capture {}, \
             max_sampling_fps {}, audio_sync_not {}",
            settings.stream_port,
            settings.stream_on_movie_detection,
            settings.on_variation_capture,
            settings.max_sampling_fps,
            settings.audio_sync_not
        );
        Ok(settings)
    }

    fn parse(text: &str) -> Self {
        let mut settings = Self::default();
        for line in text.lines() {
            let line = line.trim();
            for key in KEYS {
                if let Some(rest) = line.strip_prefix(key) {
                    let value = rest
                        .trim_start_matches([' ', '\t', '='])
                        .split([' ', '\t'])
                        .next()
                        .unwrap_or("");
                    if let Ok(value) = value.parse::<i32>() {
                        match key {
                            "stream_port" => settings.stream_port = value,
                            "stream_onMovieDetection" => {
                                settings.stream_on_movie_detection = value
                            }
                            "on_variation_capture" => settings.on_variation_capture = value,
                            "max_sampling_fps" => settings.max_sampling_fps = value,
                            _ => settings.audio_sync_not = value,
                        }
                    }
                    break;
                }
            }
        }
        settings
    }

    fn template(&self) -> String {
        format!(
            "# If value is <0, the accelerated stream path is disabled.\n\
             # if stream_port=0, the combined display channel is used.\n\
             # if stream_port>1000, use stream_port as the stream connection port\n\
             # else stream_port+main port is used for the stream connection\n\
             stream_port={}\n\
             # turn on stream encoding only when a movie is detected\n\
             stream_onMovieDetection={}\n\
             # if 0, static capture at max_sampling_fps, else capture on screen variation\n\
             on_variation_capture={}\n\
             # cap on the server sampling rate\n\
             max_sampling_fps={}\n\
             # if 1, do not delay video to sync with audio (lower delay)\n\
             audio_sync_not={}\n",
            self.stream_port,
            self.stream_on_movie_detection,
            self.on_variation_capture,
            self.max_sampling_fps,
            self.audio_sync_not
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_path(name: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        env::temp_dir().join(format!(
            "mirador-config-{}-{}-{}",
            std::process::id(),
            seq,
            name
        ))
    }

    #[test]
    fn missing_file_gets_defaults_written() {
        let path = scratch_path("missing").join(CONFIG_FILE_NAME);
        let settings = StreamSettings::load_or_create(&path).unwrap();
        assert_eq!(settings, StreamSettings::default());
        assert!(path.exists());
        // A second load round-trips the template.
        let again = StreamSettings::load_or_create(&path).unwrap();
        assert_eq!(again, settings);
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn parse_trims_and_ignores_unknown_lines() {
        let settings = StreamSettings::parse(
            "  stream_port = 5901  \n\
             unrelated garbage\n\
             audio_sync_not=1\n\
             max_sampling_fps\t=\t24\n",
        );
        assert_eq!(settings.stream_port, 5901);
        assert_eq!(settings.audio_sync_not, 1);
        assert_eq!(settings.max_sampling_fps, 24);
        assert_eq!(settings.on_variation_capture, 1);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let settings = StreamSettings::parse("stream_port=yes\n");
        assert_eq!(settings.stream_port, 0);
    }
}
