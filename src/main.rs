//! termtune - play files through mpv with a persistent queue.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use termtune::{
  AppConfig, EventOutcome, LocalProvider, MpvClient, PersistHandle, Player, QueueStore,
};

/// Play audio files through mpv, resuming the saved queue.
#[derive(Parser, Debug)]
#[command(name = "termtune")]
#[command(version, about, long_about = None)]
struct Args {
  /// Config file (default: <config_dir>/termtune/config.json).
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Discard the saved queue and start empty.
  #[arg(long)]
  fresh: bool,

  /// Files appended to the queue.
  #[arg(trailing_var_arg = true)]
  files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let args = Args::parse();

  let config_path = match args.config {
    Some(path) => path,
    None => AppConfig::default_path()?,
  };
  let config = AppConfig::load(&config_path)?;

  let mut clog = colog::default_builder();
  clog.filter(None, config.log_level());
  if let Ok(filters) = std::env::var("RUST_LOG") {
    clog.parse_filters(&filters);
  }
  clog.init();

  if !config_path.exists() {
    log::info!("Writing default config. path={}", config_path.display());
    if let Err(e) = config.save(&config_path) {
      log::warn!("Failed to write default config: {}", e);
    }
  }

  if config.provider_id != LocalProvider::ID {
    log::warn!(
      "Provider {} is not available, using {}",
      config.provider_id,
      LocalProvider::ID
    );
  }

  let client = MpvClient::new(config.mpv_options());
  let mut player = Player::new(client.clone(), LocalProvider, config.profile_id.clone());

  match config.database_path() {
    Some(db_path) => match QueueStore::open(&db_path) {
      Ok(store) => {
        if !args.fresh {
          match store.load() {
            Ok(snapshot) => {
              player.restore(snapshot);
            }
            Err(e) => log::warn!("Failed to load saved queue: {}", e),
          }
        }
        player = player.with_persistence(PersistHandle::spawn(store));
        if args.fresh {
          player.discard_saved();
        }
      }
      Err(e) => log::warn!("Queue persistence disabled, cannot open {}: {}", db_path.display(), e),
    },
    None => log::warn!("Queue persistence disabled, no data directory"),
  }

  if !args.files.is_empty() {
    let tracks: Vec<_> = args.files.iter().map(|p| LocalProvider::track_for(p)).collect();
    log::info!("Adding {} files to the queue", tracks.len());
    player.enqueue(tracks)?;
  }

  if player.queue().is_empty() {
    log::info!("Queue is empty, nothing to play");
    player.flush();
    return Ok(());
  }

  let ctx = CancellationToken::new();
  let interrupt = ctx.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      log::info!("Interrupted, shutting down");
    }
    interrupt.cancel();
  });

  if let Err(e) = client.start(&ctx).await {
    player.flush();
    return Err(e.into());
  }
  let Some(events) = client.events() else {
    client.stop().await;
    player.flush();
    return Err("mpv event stream unavailable".into());
  };

  if let Err(e) = player.set_volume(config.initial_volume as f64).await {
    log::warn!("Failed to set initial volume: {}", e);
  }

  match player.play_current().await {
    Ok(track) => log::info!("Now playing: {}", track.display_name()),
    Err(e) => log::error!("Failed to start playback: {}", e),
  }

  loop {
    tokio::select! {
      _ = ctx.cancelled() => break,
      event = events.recv() => match event {
        Ok(event) => match player.handle_event(event).await {
          Ok(EventOutcome::Advanced(track)) => log::info!("Now playing: {}", track.display_name()),
          Ok(EventOutcome::Finished) => break,
          Ok(EventOutcome::Updated) => {}
          Err(e) => log::error!("Failed to advance: {}", e),
        },
        Err(_) => {
          log::error!("Connection to mpv lost");
          break;
        }
      }
    }
  }

  client.stop().await;
  player.flush();
  log::info!("Stopped with {} tracks in queue", player.queue().len());
  Ok(())
}
