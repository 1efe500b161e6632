use soundboard_engine::audio::device::{DeviceFactory, NullDeviceFactory};
use soundboard_engine::config::{OutputBackend, Settings};
use soundboard_engine::init_app_dirs;
use soundboard_engine::logging::init_tracing;
use soundboard_engine::ui::{Cli, Command, VoiceRow};
use soundboard_engine::{Engine, EngineContext, Sound, VoiceHandle};
use std::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const LOG_TARGET: &str = "soundboard_engine::main";

fn device_factory(settings: &Settings) -> Result<Arc<dyn DeviceFactory>, Box<dyn Error>> {
    match settings.output_backend {
        OutputBackend::Null => Ok(Arc::new(NullDeviceFactory)),
        #[cfg(feature = "alsa-backend")]
        OutputBackend::Alsa => Ok(Arc::new(soundboard_engine::audio::alsa_writer::AlsaDeviceFactory::new(
            &settings.alsa_device,
        ))),
        #[cfg(not(feature = "alsa-backend"))]
        OutputBackend::Alsa => Err("ALSA output requires building with the alsa-backend feature".into()),
    }
}

fn handle_for(handles: &[VoiceHandle], n: usize) -> Option<VoiceHandle> {
    handles.get(n.checked_sub(1)?).copied()
}

fn voice_rows(engine: &Engine) -> Vec<VoiceRow> {
    engine
        .handles()
        .into_iter()
        .filter_map(|handle| {
            let voice = engine.voice(handle).ok()?;
            Some(VoiceRow {
                handle,
                name: voice.sound().name.clone(),
                state: voice.state(),
                mode: voice.repress_mode(),
                duration_ms: voice.duration_ms(),
            })
        })
        .collect()
}

/// Prints warnings and errors a voice reports while the prompt is idle.
fn watch_voice(engine: &Engine, handle: VoiceHandle) {
    let Ok(mut events) = engine.subscribe(handle) else {
        return;
    };
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(soundboard_engine::player::VoiceEvent::Warning(message)) => eprintln!("[{}] {}", handle, message),
                Ok(soundboard_engine::player::VoiceEvent::Error(message)) => eprintln!("[{}] {}", handle, message),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse command-line arguments and initialize CLI
    let cli = Cli::new();
    let args = &cli.args;
    init_tracing(args.log_json);

    // Initialize application directories
    init_app_dirs()?;

    let config_path = args.config.clone().unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&config_path)?;
    args.apply_to(&mut settings);
    settings.validate()?;
    info!(target: LOG_TARGET, "Using {} output, buffer {} bytes per channel", settings.output_backend, settings.buffer_size);

    let engine = Engine::from_settings(EngineContext::with_devices(device_factory(&settings)?), &settings);

    for (index, path) in args.files.iter().enumerate() {
        let sound = Sound::from_path(index as u64 + 1, path);
        let handle = engine.create_voice(sound, settings.buffer_size).await?;
        watch_voice(&engine, handle);
    }

    cli.display_voices(&voice_rows(&engine));
    cli.display_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                cli.display_error(&e);
                continue;
            }
        };

        let handles = engine.handles();
        let voice = |n: usize| handle_for(&handles, n).ok_or_else(|| format!("no voice {}", n));
        let result: Result<(), Box<dyn Error>> = match command {
            Command::Quit => break,
            Command::List => {
                cli.display_voices(&voice_rows(&engine));
                Ok(())
            }
            Command::Toggle(n) => match voice(n) {
                Ok(handle) => engine.toggle_play(handle, None).await.map_err(Into::into),
                Err(e) => Err(e.into()),
            },
            Command::Mode(n, mode) => match voice(n) {
                Ok(handle) => engine.set_repress_mode(handle, mode).await.map_err(Into::into),
                Err(e) => Err(e.into()),
            },
            Command::Volume(n, volume) => match voice(n) {
                Ok(handle) => engine.set_volume(handle, volume).await.map_err(Into::into),
                Err(e) => Err(e.into()),
            },
            Command::Buffer(n, size) => match voice(n) {
                Ok(handle) => engine.change_buffer_size(handle, size).await.map_err(Into::into),
                Err(e) => Err(e.into()),
            },
            Command::Release(n) => match voice(n) {
                Ok(handle) => engine.release(handle).await.map_err(Into::into),
                Err(e) => Err(e.into()),
            },
        };

        if let Err(e) = result {
            warn!(target: LOG_TARGET, "Command '{}' failed: {}", line.trim(), e);
            cli.display_error(&*e);
        }
    }

    engine.shutdown().await;
    Ok(())
}
