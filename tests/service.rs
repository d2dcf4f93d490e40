use std::sync::Arc;

use audio_format_converter::{
    auth::Identity,
    converter::Converter,
    engine::ScriptedEngine,
    proto_audio_converter::{
        audio_converter_server::AudioConverter, ClearFilesInput, ConvertInput, ListFilesInput,
    },
    service::Service,
    store::FileStore,
};
use tonic::{Code, Request};

async fn service(load: bool) -> (Service, Arc<FileStore>) {
    let converter = Arc::new(Converter::new(Arc::new(ScriptedEngine::new())));
    if load {
        converter.load(None).await.unwrap();
    }
    let store = Arc::new(FileStore::in_memory());
    (Service::new(converter, store.clone()), store)
}

fn input(format: &str) -> Request<ConvertInput> {
    let mut req = Request::new(ConvertInput {
        data: b"RIFF audio".to_vec(),
        media_type: "audio/wav".to_string(),
        file_name: "take.wav".to_string(),
        format: format.to_string(),
    });
    req.extensions_mut().insert(Identity {
        username: "ann".to_string(),
    });
    req
}

#[tokio::test]
async fn test_convert_records_file() {
    let (svc, store) = service(true).await;
    let reply = svc.convert(input("flac")).await.unwrap().into_inner();
    assert_eq!(reply.media_type, "audio/flac");
    assert_eq!(reply.file_name, "take.flac");
    assert_eq!(reply.data, b"RIFF audio");

    let records = store.list().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, reply.id);
    assert!(records[0].converted);

    let files = svc
        .list_files(Request::new(ListFilesInput {}))
        .await
        .unwrap()
        .into_inner()
        .files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "take.flac");
    assert_eq!(files[0].size, 10);
}

#[tokio::test]
async fn test_convert_error_codes() {
    let (svc, store) = service(true).await;
    let err = svc.convert(input("xyz")).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("xyz"));
    assert!(store.list().await.is_empty());

    let (svc, _store) = service(false).await;
    let err = svc.convert(input("mp3")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
async fn test_clear_files() {
    let (svc, store) = service(true).await;
    svc.convert(input("mp3")).await.unwrap();
    svc.convert(input("ogg")).await.unwrap();
    let removed = svc
        .clear_files(Request::new(ClearFilesInput {}))
        .await
        .unwrap()
        .into_inner()
        .removed;
    assert_eq!(removed, 2);
    assert!(store.list().await.is_empty());
}
