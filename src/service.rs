use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{instrument, Instrument};

use crate::{
    asset::InputAsset,
    auth::Identity,
    converter::{ConvertError, Converter},
    format::TargetFormat,
    otel::request_span,
    proto_audio_converter::{
        self, audio_converter_server::AudioConverter, stream_convert_input::Payload as InPayload,
        stream_convert_reply::Payload as OutPayload, ClearFilesInput, ClearFilesReply,
        ConvertInput, ConvertReply, InitialMetadata, ListFilesInput, ListFilesReply,
        StreamConvertInput, StreamConvertReply,
    },
    relay::{ConversionEvent, ConversionObserver},
    store::{FileRecord, FileStore, StoreError},
};

const CHUNK_SIZE: usize = 64 * 1024;

type ReplySender = mpsc::Sender<Result<StreamConvertReply, Status>>;

pub struct Service {
    converter: Arc<Converter>,
    store: Arc<FileStore>,
}

impl Service {
    pub fn new(converter: Arc<Converter>, store: Arc<FileStore>) -> Self {
        tracing::info!("new service");
        Self { converter, store }
    }
}

#[derive(Debug, Error)]
pub enum SrvError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<SrvError> for Status {
    fn from(err: SrvError) -> Self {
        match err {
            SrvError::InvalidArgument(msg) => Status::invalid_argument(msg),
            SrvError::Convert(e) => match e {
                ConvertError::UnsupportedFormat(_) => Status::invalid_argument(e.to_string()),
                ConvertError::EngineNotLoaded | ConvertError::EngineLoad(_) => {
                    Status::unavailable(e.to_string())
                }
                ConvertError::Timeout(_) => Status::deadline_exceeded(e.to_string()),
                ConvertError::Conversion(_) => Status::internal(format!("error: {}", e)),
            },
            SrvError::Store(e) => Status::internal(format!("store error: {}", e)),
            SrvError::Other(e) => Status::internal(format!("error: {}", e)),
        }
    }
}

fn user_of<T>(request: &Request<T>) -> String {
    request
        .extensions()
        .get::<Identity>()
        .map(|i| i.username.clone())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Records the upload, converts it and records the result.
#[instrument(skip(converter, store, asset, observer))]
async fn convert_and_record(
    converter: &Converter,
    store: &FileStore,
    asset: InputAsset,
    format: &str,
    observer: Option<Arc<dyn ConversionObserver>>,
) -> Result<FileRecord, SrvError> {
    // rejected formats leave no upload record behind
    format.parse::<TargetFormat>().map_err(ConvertError::from)?;
    let uploaded = FileRecord::uploaded(&asset);
    store.add(uploaded.clone()).await?;
    let output = converter.convert(&asset, format, observer).await?;
    let converted = uploaded.converted_to(&output);
    store.update(converted.clone()).await?;
    tracing::info!(id = converted.id, name = converted.name, "recorded");
    Ok(converted)
}

#[tonic::async_trait]
impl AudioConverter for Service {
    async fn convert(
        &self,
        request: Request<ConvertInput>,
    ) -> Result<Response<ConvertReply>, Status> {
        tracing::trace!(metadata = ?request.metadata(), "Received request");
        let span = request_span(request.metadata().as_ref(), "Convert");
        let user = user_of(&request);

        async move {
            let req = request.into_inner();
            tracing::info!(
                user,
                len = req.data.len(),
                format = req.format,
                media_type = req.media_type,
                "input"
            );
            let asset = InputAsset::new(req.data, req.media_type, Some(req.file_name));
            match convert_and_record(&self.converter, &self.store, asset, &req.format, None).await
            {
                Ok(record) => Ok(Response::new(ConvertReply {
                    id: record.id,
                    data: record.payload,
                    media_type: record.media_type,
                    file_name: record.name,
                })),
                Err(e) => {
                    tracing::error!(error = ?e, "convert error");
                    Err(e.into())
                }
            }
        }
        .instrument(span)
        .await
    }

    type ConvertStreamStream = ReceiverStream<Result<StreamConvertReply, Status>>;

    async fn convert_stream(
        &self,
        request: Request<Streaming<StreamConvertInput>>,
    ) -> Result<Response<Self::ConvertStreamStream>, Status> {
        tracing::trace!(metadata = ?request.metadata(), "Received requests");
        let span = request_span(request.metadata().as_ref(), "ConvertStream");
        let user = user_of(&request);
        let mut input_stream = request.into_inner();

        let (tx, rx) = mpsc::channel(10);
        let converter = self.converter.clone();
        let store = self.store.clone();
        tokio::spawn(
            async move {
                tracing::info!(user, "streaming conversion");
                if let Err(e) = stream_convert(&converter, &store, &mut input_stream, &tx).await {
                    tracing::error!(error = %e, "Error in convert_stream");
                    let _ = tx.send(Err(e.into())).await;
                }
            }
            .instrument(span),
        );

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    #[instrument(skip_all)]
    async fn list_files(
        &self,
        _request: Request<ListFilesInput>,
    ) -> Result<Response<ListFilesReply>, Status> {
        let files = self
            .store
            .list()
            .await
            .into_iter()
            .map(|r| proto_audio_converter::FileRecord {
                id: r.id,
                name: r.name,
                size: r.size,
                media_type: r.media_type,
                last_modified: r.last_modified,
                converted: r.converted,
            })
            .collect::<Vec<_>>();
        tracing::debug!(files = files.len(), "list");
        Ok(Response::new(ListFilesReply { files }))
    }

    #[instrument(skip_all)]
    async fn clear_files(
        &self,
        _request: Request<ClearFilesInput>,
    ) -> Result<Response<ClearFilesReply>, Status> {
        let removed = self.store.clear().await.map_err(SrvError::from)?;
        Ok(Response::new(ClearFilesReply {
            removed: removed as u32,
        }))
    }
}

#[instrument(name = "receiving file", skip_all)]
async fn receive_input<S>(input: &mut S) -> Result<(InitialMetadata, Vec<u8>), SrvError>
where
    S: Stream<Item = Result<StreamConvertInput, Status>> + Unpin,
{
    let mut metadata = None;
    let mut data = Vec::new();
    while let Some(message) = input.next().await {
        match message.context("read input stream")?.payload {
            Some(InPayload::Metadata(meta)) => {
                tracing::info!(format = meta.format, media_type = meta.media_type, "metadata");
                metadata = Some(meta);
            }
            Some(InPayload::Chunk(chunk)) => {
                tracing::trace!(len = chunk.len(), "chunk");
                data.extend_from_slice(&chunk);
            }
            None => {
                return Err(SrvError::InvalidArgument(
                    "No payload in StreamConvertInput".to_string(),
                ));
            }
        }
    }
    let metadata =
        metadata.ok_or_else(|| SrvError::InvalidArgument("No format provided".to_string()))?;
    tracing::debug!(len = data.len(), "received file");
    Ok((metadata, data))
}

async fn send(tx: &ReplySender, payload: OutPayload) -> Result<(), SrvError> {
    tx.send(Ok(StreamConvertReply {
        payload: Some(payload),
    }))
    .await
    .context("can't send")?;
    Ok(())
}

async fn send_event(tx: &ReplySender, event: ConversionEvent) -> Result<(), SrvError> {
    let payload = match event {
        ConversionEvent::Progress(percent) => OutPayload::Progress(u32::from(percent)),
        ConversionEvent::Log(line) => OutPayload::Log(line),
    };
    send(tx, payload).await
}

async fn stream_convert<S>(
    converter: &Converter,
    store: &FileStore,
    input: &mut S,
    tx: &ReplySender,
) -> Result<(), SrvError>
where
    S: Stream<Item = Result<StreamConvertInput, Status>> + Unpin,
{
    let (metadata, data) = receive_input(input).await?;
    let asset = InputAsset::new(data, metadata.media_type, Some(metadata.file_name));

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let observer: Arc<dyn ConversionObserver> = Arc::new(events_tx);
    let conversion = convert_and_record(converter, store, asset, &metadata.format, Some(observer));
    tokio::pin!(conversion);

    let record = loop {
        tokio::select! {
            res = &mut conversion => break res?,
            Some(event) = events.recv() => send_event(tx, event).await?,
        }
    };
    while let Ok(event) = events.try_recv() {
        send_event(tx, event).await?;
    }

    tracing::debug!("Sending result");
    send(tx, OutPayload::MediaType(record.media_type)).await?;
    for chunk in record.payload.chunks(CHUNK_SIZE) {
        tracing::trace!(len = chunk.len(), "sending");
        send(tx, OutPayload::Chunk(chunk.to_vec())).await?;
    }
    tracing::debug!("Done");
    Ok(())
}
