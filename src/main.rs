use anyhow::Result;
use serenity::model::id::{GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use music_pipeline::{
    audio::{AudioPlayer, FrameSink, PcmFileSink, PlayerConfig, PlayerManager, SourceBackend, TrackInfo},
    config::Config,
    sources::{FfmpegTranscoder, HttpFetcher, SmartResolver, YtDlpResolver},
    storage::JsonStorage,
};

/// Guild usado por la demo de línea de comandos
const CLI_GUILD: u64 = 1;

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("music_pipeline=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Music Pipeline v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return runtime.block_on(health_check(&config));
    }

    info!("{}", config.summary());
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let references: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| !arg.starts_with("--"))
        .collect();
    if references.is_empty() {
        anyhow::bail!("Uso: music-pipeline <url o búsqueda>...");
    }

    // Inicializar almacenamiento JSON
    let settings = Arc::new(JsonStorage::new(config.data_dir.clone(), config.default_volume).await?);

    let resolver = Arc::new(SmartResolver::with_defaults(
        &config.ytdlp_path,
        Duration::from_secs(config.resolve_cache_ttl),
    ));
    let backend = Arc::new(SourceBackend::new(
        resolver.clone(),
        Arc::new(HttpFetcher::new()?),
        Arc::new(FfmpegTranscoder::new(&config.ffmpeg_path)),
        Duration::from_secs(config.read_ahead_seconds),
    ));

    // Limpieza periódica del cache de resoluciones
    let cache_resolver = resolver.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            cache_resolver.cache().cleanup_old_entries();
        }
    });

    let manager = PlayerManager::new(PlayerConfig::from_config(&config), settings, backend);
    let guild_id = GuildId::new(CLI_GUILD);
    let player = manager.get_or_create(guild_id).await?;

    for reference in &references {
        let info = TrackInfo::new(reference.as_str(), reference.as_str(), UserId::new(1));
        if let Err(e) = player.enqueue(manager.create_source(reference.as_str(), info)) {
            warn!("⚠️ No se pudo encolar {}: {}", reference, e);
        }
    }

    let sink: Arc<dyn FrameSink> = Arc::new(PcmFileSink::create(&config.output_path).await?);
    let playback = tokio::spawn(player.clone().run(sink));

    wait_until_drained(&player).await;
    manager.shutdown_all();

    match playback.await? {
        Ok(()) => {
            info!("✅ Reproducción terminada: {}", config.output_path.display());
            Ok(())
        }
        Err(e) => {
            error!("❌ Error en la reproducción: {}", e);
            Err(e.into())
        }
    }
}

/// Espera a que la cola se vacíe o a Ctrl+C.
async fn wait_until_drained(player: &AudioPlayer) {
    let mut poll = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Error al registrar Ctrl+C: {}", e);
                }
                info!("⚠️ Señal de shutdown recibida, cerrando...");
                return;
            }
            _ = poll.tick() => {
                if player.is_idle() {
                    return;
                }
                if let Some(current) = player.now_playing() {
                    if let Some(remaining) = current.remaining() {
                        debug!(
                            "🎶 {}: quedan {}",
                            current.info().title,
                            humantime::format_duration(Duration::from_secs(remaining.as_secs()))
                        );
                    }
                }
            }
        }
    }
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = YtDlpResolver::new(&config.ytdlp_path).version().await;
    let ffmpeg = FfmpegTranscoder::new(&config.ffmpeg_path).version().await;

    match (yt_dlp, ffmpeg) {
        (Ok(yt_dlp), Ok(ffmpeg)) => {
            info!("yt-dlp {} / {}", yt_dlp, ffmpeg);
            println!("OK");
            Ok(())
        }
        (yt_dlp, ffmpeg) => {
            if let Err(e) = yt_dlp {
                error!("❌ yt-dlp: {:#}", e);
            }
            if let Err(e) = ffmpeg {
                error!("❌ ffmpeg: {:#}", e);
            }
            anyhow::bail!("Dependencias faltantes");
        }
    }
}
