use std::{fmt, str::FromStr};

use thiserror::Error;

/// Output formats the converter accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Mp3,
    Wav,
    Ogg,
    Flac,
    Aiff,
    Aac,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported format: {0}")]
pub struct UnsupportedFormat(pub String);

impl TargetFormat {
    pub const ALL: [TargetFormat; 6] = [
        TargetFormat::Mp3,
        TargetFormat::Wav,
        TargetFormat::Ogg,
        TargetFormat::Flac,
        TargetFormat::Aiff,
        TargetFormat::Aac,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "mp3",
            TargetFormat::Wav => "wav",
            TargetFormat::Ogg => "ogg",
            TargetFormat::Flac => "flac",
            TargetFormat::Aiff => "aiff",
            TargetFormat::Aac => "aac",
        }
    }

    pub fn codec(&self) -> &'static str {
        codec_for(self.as_str())
    }

    pub fn media_type(&self) -> String {
        format!("audio/{}", self.as_str())
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetFormat {
    type Err = UnsupportedFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim().to_ascii_lowercase();
        TargetFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == id)
            .ok_or_else(|| UnsupportedFormat(s.to_string()))
    }
}

/// Encoder name for a format id. Ids without a curated codec are passed
/// through as the codec name.
pub fn codec_for(format_id: &str) -> &str {
    match format_id {
        "mp3" => "libmp3lame",
        "aac" => "aac",
        "ogg" => "libvorbis",
        "flac" => "flac",
        "wav" => "pcm_s16le",
        "aiff" => "pcm_s16be",
        other => other,
    }
}

/// File extension (without dot) for a declared media type, or "" when the
/// type is unknown and the engine has to detect the container itself.
pub fn extension_for(media_type: &str) -> &'static str {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" => "ogg",
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/aiff" | "audio/x-aiff" => "aiff",
        "audio/aac" | "audio/x-aac" => "aac",
        _ => "",
    }
}

pub fn input_file_name(media_type: &str) -> String {
    match extension_for(media_type) {
        "" => "input".to_string(),
        ext => format!("input.{ext}"),
    }
}

pub fn output_file_name(format_id: &str) -> String {
    format!("output.{format_id}")
}
