use std::path::Path;

use crate::format::{output_file_name, TargetFormat};

/// Audio payload as received from a caller.
#[derive(Clone, Debug)]
pub struct InputAsset {
    data: Vec<u8>,
    media_type: String,
    file_name: Option<String>,
}

impl InputAsset {
    pub fn new(data: Vec<u8>, media_type: impl Into<String>, file_name: Option<String>) -> Self {
        Self {
            data,
            media_type: media_type.into(),
            file_name: file_name.filter(|n| !n.is_empty()),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }
}

/// Converted audio, only ever produced from a completed conversion.
#[derive(Clone, Debug)]
pub struct OutputAsset {
    data: Vec<u8>,
    format: TargetFormat,
}

impl OutputAsset {
    pub(crate) fn new(data: Vec<u8>, format: TargetFormat) -> Self {
        Self { data, format }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn format(&self) -> TargetFormat {
        self.format
    }

    pub fn media_type(&self) -> String {
        self.format.media_type()
    }

    /// Name for the converted file: the original stem with the new extension.
    pub fn file_name_for(&self, original: Option<&str>) -> String {
        let stem = original
            .and_then(|n| Path::new(n).file_stem())
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty());
        match stem {
            Some(stem) => format!("{stem}.{}", self.format),
            None => output_file_name(self.format.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_file_name() {
        let out = OutputAsset::new(vec![1, 2], TargetFormat::Flac);
        assert_eq!(out.file_name_for(Some("song.mp3")), "song.flac");
        assert_eq!(out.file_name_for(Some("dir/take.2.wav")), "take.2.flac");
        assert_eq!(out.file_name_for(None), "output.flac");
        assert_eq!(out.media_type(), "audio/flac");
    }

    #[test]
    fn test_empty_input_name_is_none() {
        let asset = InputAsset::new(vec![], "audio/wav", Some(String::new()));
        assert_eq!(asset.file_name(), None);
    }
}
