pub mod proto_audio_converter {
    tonic::include_proto!("audio_converter.v1");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("audio_converter_descriptor");
}

pub mod asset;
pub mod auth;
pub mod converter;
pub mod directive;
pub mod engine;
pub mod format;
pub mod inspect;
pub mod otel;
pub mod relay;
pub mod service;
pub mod store;

pub const SERVICE_NAME: &str = "audio-format-converter";
