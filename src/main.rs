use std::{path::PathBuf, sync::Arc, time::Duration};

use audio_format_converter::{
    auth::{BasicAuthLayer, CredentialStore},
    converter::Converter,
    engine::{FfmpegProcess, ProcessConfig},
    otel,
    proto_audio_converter::{self, audio_converter_server::AudioConverterServer},
    relay::{ConversionEvent, ConversionObserver},
    service::Service,
    store::FileStore,
    SERVICE_NAME,
};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[command(version = env!("CARGO_APP_VERSION"), name = SERVICE_NAME, about="Service for audio conversion to MP3, WAV, OGG, FLAC, AIFF, AAC",
    long_about = None)]
struct Args {
    /// GRPC server port
    #[arg(long, env, default_value = "50051")]
    port: u16,
    /// ffmpeg binary
    #[arg(long, env, default_value = "ffmpeg")]
    ffmpeg_path: PathBuf,
    /// Max seconds for one conversion
    #[arg(long, env, default_value = "300")]
    convert_timeout_secs: u64,
    /// File records JSON
    #[arg(long, env, default_value = "files.json")]
    store_path: PathBuf,
    /// Accepted users, JSON: [{"username": "...", "password": "..."}]
    #[arg(long, env, hide_env_values = true)]
    users: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let _guard = otel::init_tracing()?;
    let args = Args::parse();
    if let Err(e) = main_int(args).await {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn main_int(args: Args) -> anyhow::Result<()> {
    tracing::info!(name = SERVICE_NAME, "Starting GRPC service");
    tracing::info!(version = env!("CARGO_APP_VERSION"));
    tracing::info!(port = args.port);
    tracing::info!(ffmpeg = ?args.ffmpeg_path, timeout = args.convert_timeout_secs);

    let credentials = CredentialStore::from_json(&args.users)?;
    if credentials.is_empty() {
        tracing::warn!("no users configured, every call will be rejected");
    }
    tracing::info!(users = credentials.len());

    let cancel_token = CancellationToken::new();
    let ct = cancel_token.clone();
    let mut int_stream = signal(SignalKind::interrupt())?;
    let mut term_stream = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = int_stream.recv() => tracing::info!("Exit event int"),
            _ = term_stream.recv() => tracing::info!("Exit event term"),
        }
        tracing::debug!("sending exit event");
        ct.cancel();
    });

    let address: std::net::SocketAddr = format!("[::]:{}", args.port).parse()?;
    tracing::info!(address = format!("{:?}", address), "address");

    let engine = FfmpegProcess::new(ProcessConfig {
        ffmpeg_path: args.ffmpeg_path,
    });
    let converter = Arc::new(Converter::with_timeout(
        Arc::new(engine),
        Duration::from_secs(args.convert_timeout_secs),
    ));
    let engine_log: Arc<dyn ConversionObserver> = Arc::new(|event: ConversionEvent| {
        if let ConversionEvent::Log(line) = event {
            tracing::debug!(target: "ffmpeg", "{}", line);
        }
    });
    let loaded = match converter.load(Some(engine_log.clone())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "engine is not available, will retry");
            false
        }
    };

    let store = Arc::new(FileStore::open(&args.store_path).await?);
    let loader = converter.clone();
    let service = Service::new(converter, store);
    let grpc_service = AudioConverterServer::new(service);
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto_audio_converter::FILE_DESCRIPTOR_SET)
        .build_v1alpha()?;
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    if loaded {
        health_reporter
            .set_serving::<AudioConverterServer<Service>>()
            .await;
    } else {
        health_reporter
            .set_not_serving::<AudioConverterServer<Service>>()
            .await;
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(30))
            .map(jitter);
        let ct = cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = loader.load_retrying(strategy, Some(engine_log)) => match res {
                    Ok(()) => {
                        tracing::info!("engine loaded on retry");
                        health_reporter
                            .set_serving::<AudioConverterServer<Service>>()
                            .await;
                    }
                    Err(e) => tracing::error!(error = %e, "engine load retries exhausted"),
                },
                _ = ct.cancelled() => tracing::debug!("engine load retry stopped"),
            }
        });
    }

    let layer = ServiceBuilder::new()
        .layer(TraceLayer::new_for_grpc())
        .layer(BasicAuthLayer::new(credentials))
        .into_inner();

    let ct = cancel_token.clone();
    let grpc_server = Server::builder()
        .layer(layer)
        .add_service(reflection_service)
        .add_service(health_service)
        .add_service(grpc_service)
        .serve_with_shutdown(address, async move {
            ct.cancelled().await;
        });

    grpc_server.await?;

    tracing::info!("Service stopped");
    Ok(())
}
