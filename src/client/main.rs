use std::path::Path;

use anyhow::Context;
use audio_format_converter::{
    proto_audio_converter::{
        audio_converter_client::AudioConverterClient, stream_convert_input::Payload,
        stream_convert_reply::Payload as ReplyPayload, ClearFilesInput, ConvertInput,
        InitialMetadata, ListFilesInput, StreamConvertInput,
    },
    SERVICE_NAME,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tokio_stream::StreamExt;
use tonic::{
    metadata::{Ascii, MetadataValue},
    service::{interceptor::InterceptedService, Interceptor},
    transport::Channel,
    Request, Status,
};
use tonic_health::pb::{health_check_response, health_client::HealthClient, HealthCheckRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CHUNK_SIZE: usize = 64 * 1024;
const TRACE_PARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

#[derive(Parser, Debug, Clone)]
#[command(version = env!("CARGO_APP_VERSION"), name = SERVICE_NAME, about="Client for audio-format-converter",
    long_about = None)]
struct Args {
    /// GRPC port
    #[arg(short, long, env, default_value = "50051")]
    port: u16,
    /// User name
    #[arg(short, long, env, default_value = "admin")]
    user: String,
    /// Password
    #[arg(long, env, hide_env_values = true, default_value = "")]
    password: String,
    /// Input audio file
    #[arg(short = 'i', long, env, default_value = "1.wav")]
    file: String,
    /// Media type of the input file
    #[arg(short, long, env, default_value = "audio/wav")]
    media_type: String,
    /// Audio output format: mp3, wav, ogg, flac, aiff, aac
    #[arg(short, long, env, default_value = "mp3")]
    format: String,
    /// Stream file and print progress
    #[arg(short, long, env, default_value = "false")]
    stream: bool,
    /// Send n times
    #[arg(short, long, env, default_value = "1")]
    times: u32,
    /// List stored files and exit
    #[arg(long, default_value = "false")]
    list: bool,
    /// Remove stored files and exit
    #[arg(long, default_value = "false")]
    clear: bool,
}

#[derive(Clone)]
struct BasicAuth {
    value: MetadataValue<Ascii>,
}

impl BasicAuth {
    fn new(user: &str, password: &str) -> anyhow::Result<Self> {
        let token = STANDARD.encode(format!("{user}:{password}"));
        let value = format!("Basic {token}")
            .parse()
            .context("invalid credentials")?;
        Ok(Self { value })
    }
}

impl Interceptor for BasicAuth {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.value.clone());
        Ok(request)
    }
}

type Client = AudioConverterClient<InterceptedService<Channel, BasicAuth>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .init();
    let args = Args::parse();
    if let Err(e) = main_int(args).await {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn main_int(args: Args) -> anyhow::Result<()> {
    tracing::info!(name = SERVICE_NAME, "Starting GRPC client");
    tracing::info!(version = env!("CARGO_APP_VERSION"));
    tracing::info!(grpc_port = args.port);

    let auth = BasicAuth::new(&args.user, &args.password)?;
    let channel = Channel::from_shared(format!("http://[::]:{}", args.port))?
        .connect()
        .await?;

    let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(5);
    Retry::spawn(strategy, || check_health(channel.clone(), auth.clone())).await?;

    let mut client = AudioConverterClient::with_interceptor(channel, auth);
    if args.list {
        return list_files(&mut client).await;
    }
    if args.clear {
        let removed = client.clear_files(ClearFilesInput {}).await?.into_inner().removed;
        tracing::info!(removed, "cleared");
        return Ok(());
    }

    tracing::info!(file = args.file);
    tracing::info!(format = args.format);
    let audio = std::fs::read(&args.file).with_context(|| format!("read file: {}", args.file))?;
    for _i in 0..args.times {
        transcode(&args, client.clone(), audio.clone()).await?;
    }
    Ok(())
}

async fn list_files(client: &mut Client) -> anyhow::Result<()> {
    let files = client.list_files(ListFilesInput {}).await?.into_inner().files;
    for f in files {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            f.id,
            f.name,
            f.media_type,
            f.size,
            if f.converted { "converted" } else { "uploaded" }
        );
    }
    Ok(())
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn output_name(path: &str, format: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    format!("{}.{}", stem, format.trim().to_ascii_lowercase())
}

async fn transcode(args: &Args, client: Client, audio: Vec<u8>) -> anyhow::Result<()> {
    let (data, output_file) = if args.stream {
        tracing::info!("streaming");
        let data = stream_file(client, audio, args)
            .await
            .with_context(|| format!("stream file: {}", args.file))?;
        (data, output_name(&args.file, &args.format))
    } else {
        tracing::info!("simple sync call");
        simple_call(client, audio, args)
            .await
            .with_context(|| format!("simple call file: {}", args.file))?
    };

    tracing::info!(output_file, len = data.len(), "saving...");
    let mut file = tokio::fs::File::create(&output_file)
        .await
        .with_context(|| format!("failed to create file: {}", output_file))?;
    file.write_all(&data)
        .await
        .with_context(|| format!("failed to write file: {}", output_file))?;
    Ok(())
}

async fn stream_file(mut client: Client, audio: Vec<u8>, args: &Args) -> anyhow::Result<Vec<u8>> {
    let (tx, rx) = tokio::sync::mpsc::channel(10);
    let input_stream = tokio_stream::wrappers::ReceiverStream::new(rx);

    let metadata = InitialMetadata {
        media_type: args.media_type.clone(),
        file_name: file_name(&args.file),
        format: args.format.clone(),
    };
    tokio::spawn(async move {
        let metadata = StreamConvertInput {
            payload: Some(Payload::Metadata(metadata)),
        };
        if tx.send(metadata).await.is_err() {
            tracing::error!("Failed to send metadata");
            return;
        }
        for chunk in audio.chunks(CHUNK_SIZE) {
            let chunk = StreamConvertInput {
                payload: Some(Payload::Chunk(chunk.to_vec())),
            };
            if tx.send(chunk).await.is_err() {
                tracing::error!("Failed to send audio chunk");
                return;
            }
        }
    });

    let mut request = Request::new(input_stream);
    request
        .metadata_mut()
        .insert("traceparent", MetadataValue::from_static(TRACE_PARENT));
    let mut response_stream = client.convert_stream(request).await?.into_inner();

    let mut converted_audio = Vec::new();
    while let Some(response) = response_stream.next().await {
        match response?.payload {
            Some(ReplyPayload::Progress(p)) => println!("progress: {p}%"),
            Some(ReplyPayload::Log(line)) => tracing::debug!(target: "ffmpeg", "{}", line),
            Some(ReplyPayload::MediaType(media_type)) => tracing::info!(media_type, "result"),
            Some(ReplyPayload::Chunk(chunk)) => converted_audio.extend(chunk),
            None => tracing::warn!("empty reply"),
        }
    }
    Ok(converted_audio)
}

async fn simple_call(
    mut client: Client,
    audio: Vec<u8>,
    args: &Args,
) -> anyhow::Result<(Vec<u8>, String)> {
    let mut request = Request::new(ConvertInput {
        data: audio,
        media_type: args.media_type.clone(),
        file_name: file_name(&args.file),
        format: args.format.clone(),
    });
    tracing::info!(message = "Sending request");
    request
        .metadata_mut()
        .insert("traceparent", MetadataValue::from_static(TRACE_PARENT));
    let reply = client.convert(request).await?.into_inner();
    tracing::info!(id = reply.id, media_type = reply.media_type, "converted");
    Ok((reply.data, reply.file_name))
}

async fn check_health(channel: Channel, auth: BasicAuth) -> anyhow::Result<()> {
    let mut client = HealthClient::with_interceptor(channel, auth);
    let health_request = Request::new(HealthCheckRequest {
        service: "".to_string(),
    });

    let result = client.check(health_request).await?;
    let response = result.get_ref();
    tracing::info!(status = response.status, "got a response.");
    if response.status != health_check_response::ServingStatus::Serving as i32 {
        return Err(anyhow::anyhow!("Service is not healthy"));
    }
    Ok(())
}
