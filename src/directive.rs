//! Builds the ffmpeg argument list for one conversion.
//!
//! Shape of the result:
//! `-i <input> -map_metadata 0 -map 0:a [-map 0:v] -c:a <codec> [-c:v copy] <flags...> output.<id>`

use crate::format::{codec_for, output_file_name, TargetFormat};

const AAC_BITRATE: &str = "192k";
const FLAC_COMPRESSION_LEVEL: &str = "12";
const OGG_QUALITY: &str = "6";

pub fn build(format: TargetFormat, input_name: &str, has_secondary: bool) -> Vec<String> {
    build_for_id(format.as_str(), input_name, has_secondary)
}

/// Same as [`build`] for a raw format id. Ids outside the curated table get
/// the codec default tail.
pub fn build_for_id(format_id: &str, input_name: &str, has_secondary: bool) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        input_name.to_string(),
        "-map_metadata".to_string(),
        "0".to_string(),
        "-map".to_string(),
        "0:a".to_string(),
    ];
    if has_secondary {
        args.extend(["-map".to_string(), "0:v".to_string()]);
    }

    args.extend(["-c:a".to_string(), codec_for(format_id).to_string()]);

    // attached pictures are copied, never re-encoded
    if has_secondary || format_id == "aiff" {
        args.extend(["-c:v".to_string(), "copy".to_string()]);
    }

    args.extend(format_flags(format_id).into_iter().map(str::to_string));
    args.push(output_file_name(format_id));
    args
}

fn format_flags(format_id: &str) -> Vec<&'static str> {
    // aiff keeps the source rate and layout
    if format_id == "aiff" {
        return vec!["-write_id3v2", "1"];
    }
    let mut flags = vec!["-ar", "44100", "-ac", "2"];
    match format_id {
        "mp3" => flags.extend(["-id3v2_version", "3", "-write_id3v1", "1"]),
        "wav" => flags.extend(["-rf64", "auto"]),
        "flac" => flags.extend(["-compression_level", FLAC_COMPRESSION_LEVEL]),
        "ogg" => flags.extend(["-q:a", OGG_QUALITY]),
        "aac" => flags.extend(["-b:a", AAC_BITRATE, "-f", "adts"]),
        _ => {}
    }
    flags
}
