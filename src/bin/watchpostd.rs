//! watchpostd - headless surveillance pipeline
//!
//! This daemon:
//! 1. Loads every configured detection model in the background
//! 2. Opens a camera or a recorded file
//! 3. Runs the active detectors on every frame and fires alerts (sound, log, snapshot, email)
//! 4. Prints detections, FPS and playback progress
//! 5. Accepts control commands on stdin (pause, resume, seek, mode, start, stop, quit)

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use std::collections::BTreeSet;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use watchpost::{
    CaptureState, CaptureUpdates, Category, DetectionMode, LoadEvent, Pipeline, SourceFactory,
    SourceOptions, VideoSourceHandle, WatchpostConfig,
};

#[path = "../ui.rs"]
mod ui;

const MAX_PROBED_CAMERAS: u32 = 5;
const UPDATE_POLL: Duration = Duration::from_millis(100);
const PREVIEW_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run the watchpost detection and alerting pipeline on a camera or video file"
)]
struct Args {
    /// Camera index to open (defaults to 0 when no --file is given)
    #[arg(long, conflicts_with = "file")]
    camera: Option<u32>,

    /// Video file, image directory, or stub:// clip to play
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Detection mode (indoor|outdoor|custom)
    #[arg(long)]
    mode: Option<DetectionMode>,

    /// Categories for custom mode, comma separated
    #[arg(long, value_delimiter = ',', value_name = "CATEGORY")]
    categories: Vec<Category>,

    /// Alert email recipient (empty disables email)
    #[arg(long, value_name = "ADDRESS")]
    email: Option<String>,

    /// Disable the alert sound
    #[arg(long)]
    no_sound: bool,

    /// List cameras that open successfully and exit
    #[arg(long)]
    probe: bool,

    /// Keep running after the source ends, waiting for stdin commands
    #[arg(long)]
    stay: bool,

    /// Write the latest annotated frame to this JPEG once per second
    #[arg(long, value_name = "PATH")]
    preview: Option<PathBuf>,

    /// Seconds to wait for the detection models before giving up
    #[arg(long, default_value_t = 300)]
    model_timeout_secs: u64,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

/// Operator command read from stdin.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Pause,
    Resume,
    Toggle,
    Seek(f64),
    Start(VideoSourceHandle),
    Stop,
    Mode(DetectionMode),
    Email(String),
    Sound(bool),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "p" | "toggle" => Command::Toggle,
        "seek" => Command::Seek(
            rest.trim_end_matches('%')
                .parse()
                .map_err(|_| anyhow!("seek expects a percentage, got '{}'", rest))?,
        ),
        "camera" => Command::Start(VideoSourceHandle::Camera(
            rest.parse()
                .map_err(|_| anyhow!("camera expects an index, got '{}'", rest))?,
        )),
        "file" | "open" => {
            if rest.is_empty() {
                return Err(anyhow!("{} expects a path", verb));
            }
            Command::Start(VideoSourceHandle::File(PathBuf::from(rest)))
        }
        "stop" => Command::Stop,
        "mode" => Command::Mode(rest.parse()?),
        "email" => Command::Email(rest.to_string()),
        "sound" => Command::Sound(match rest.to_ascii_lowercase().as_str() {
            "on" => true,
            "off" => false,
            other => return Err(anyhow!("sound expects on or off, got '{}'", other)),
        }),
        "status" => Command::Status,
        "q" | "quit" | "exit" => Command::Quit,
        other => return Err(anyhow!("unknown command '{}'", other)),
    };
    Ok(command)
}

fn spawn_command_reader() -> Result<Receiver<Command>> {
    let (tx, rx) = unbounded();
    std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(err) => eprintln!("{}", err),
                }
            }
        })
        .context("failed to spawn stdin command reader")?;
    Ok(rx)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let config = {
        let _stage = ui.stage("Load configuration");
        WatchpostConfig::load()?
    };

    if args.probe {
        let factory = SourceFactory::new(SourceOptions::from_settings(&config.capture));
        let cameras = {
            let _stage = ui.stage("Probe cameras");
            factory.probe_cameras(MAX_PROBED_CAMERAS)
        };
        if cameras.is_empty() {
            println!("no cameras found");
        }
        for index in cameras {
            println!("{}", VideoSourceHandle::Camera(index).label());
        }
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("error setting Ctrl-C handler")?;
    }

    let (mut pipeline, updates) = Pipeline::from_config(config)?;
    log::info!(
        "watchpostd running. logs in {}",
        pipeline.logbook().dir().display()
    );

    if !args.categories.is_empty() {
        pipeline.set_custom_categories(args.categories.iter().copied().collect::<BTreeSet<_>>());
    }
    if let Some(mode) = args.mode {
        pipeline.set_mode(mode);
    }
    if let Some(email) = args.email.as_deref() {
        pipeline.set_email_recipient(email);
    }
    if args.no_sound {
        pipeline.set_sound_enabled(false);
    }

    {
        let _stage = ui.stage("Load detection models");
        pipeline.load_models()?;
        let deadline = Instant::now() + Duration::from_secs(args.model_timeout_secs);
        let event = loop {
            if let Some(event) = pipeline.wait_for_models(UPDATE_POLL) {
                break event;
            }
            if shutdown.load(Ordering::SeqCst) {
                log::info!("shutdown requested while loading models");
                pipeline.shutdown();
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "detection models did not load within {}s",
                    args.model_timeout_secs
                ));
            }
        };
        match event {
            LoadEvent::Ready(categories) => {
                log::info!("models ready: {:?}", categories);
            }
            LoadEvent::Failed(message) => return Err(anyhow!(message)),
        }
    }

    let handle = match args.file.clone() {
        Some(path) => VideoSourceHandle::File(path),
        None => VideoSourceHandle::Camera(args.camera.unwrap_or(0)),
    };
    let info = {
        let _stage = ui.stage(&format!("Open {}", handle.label()));
        pipeline.start(&handle)?
    };
    let mut playback = info.seekable.then(|| ui.playback(&info.label()));

    let commands = spawn_command_reader()?;
    let mut session = Session {
        updates,
        preview: args.preview.clone(),
        last_preview: None,
        last_fps: 0.0,
    };

    'run: loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("shutdown signal received, stopping capture...");
            break;
        }

        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Quit => break 'run,
                Command::Start(handle) => match pipeline.start(&handle) {
                    Ok(info) => {
                        // Finish the old bar before drawing the new one.
                        drop(playback.take());
                        playback = info.seekable.then(|| ui.playback(&info.label()));
                    }
                    Err(err) => eprintln!("cannot open {}: {}", handle.label(), err),
                },
                Command::Pause => pipeline.pause(),
                Command::Resume => pipeline.resume(),
                Command::Toggle => {
                    let state = pipeline.toggle_pause();
                    eprintln!("capture {:?}", state);
                }
                Command::Seek(percent) => match pipeline.seek(percent) {
                    Some(index) => log::info!("seeking to frame {}", index),
                    None => eprintln!("source is not seekable"),
                },
                Command::Stop => {
                    pipeline.stop();
                    playback = None;
                }
                Command::Mode(mode) => pipeline.set_mode(mode),
                Command::Email(recipient) => pipeline.set_email_recipient(&recipient),
                Command::Sound(enabled) => pipeline.set_sound_enabled(enabled),
                Command::Status => print_status(&pipeline, session.last_fps),
            }
        }

        session.drain(playback.as_mut())?;

        if pipeline.capture_state() == CaptureState::Idle && !args.stay {
            log::info!("capture finished");
            break;
        }
    }

    drop(playback);
    pipeline.shutdown();
    Ok(())
}

/// Consumer side of the capture updates.
struct Session {
    updates: CaptureUpdates,
    preview: Option<PathBuf>,
    last_preview: Option<Instant>,
    last_fps: f32,
}

impl Session {
    fn drain(&mut self, mut playback: Option<&mut ui::Playback>) -> Result<()> {
        if let Some(labels) = self.updates.detections.try_latest() {
            let line = format!("detected: {}", labels.join(", "));
            match playback.as_deref() {
                Some(bar) => bar.println(&line),
                None => println!("{line}"),
            }
        }
        if let Some(fps) = self.updates.fps.try_latest() {
            self.last_fps = fps;
            if let Some(bar) = playback.as_deref() {
                bar.set_status(&format!("{:.1} fps", fps));
            }
        }
        if let Some(percent) = self.updates.progress.try_latest() {
            if let Some(bar) = playback.as_deref_mut() {
                bar.set_progress(percent);
            }
        }
        if let Some(frame) = self.updates.frames.recv_timeout(UPDATE_POLL) {
            if let Some(path) = &self.preview {
                let due = self
                    .last_preview
                    .map_or(true, |at| at.elapsed() >= PREVIEW_INTERVAL);
                if due {
                    frame
                        .save(path)
                        .with_context(|| format!("failed to write preview {}", path.display()))?;
                    self.last_preview = Some(Instant::now());
                }
            }
        }
        Ok(())
    }
}

fn print_status(pipeline: &Pipeline, fps: f32) {
    let settings = pipeline.settings();
    let active: Vec<&str> = settings.active.iter().map(|c| c.as_str()).collect();
    println!(
        "state={:?} source={} mode={:?} active=[{}] fps={:.1} sound={} email={}",
        pipeline.capture_state(),
        pipeline
            .source()
            .map(|info| info.label())
            .unwrap_or_else(|| "-".to_string()),
        pipeline.mode(),
        active.join(","),
        fps,
        if settings.sound_enabled { "on" } else { "off" },
        if settings.email_recipient.is_empty() {
            "-"
        } else {
            settings.email_recipient.as_str()
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_commands() {
        assert_eq!(parse_command("pause").unwrap(), Command::Pause);
        assert_eq!(parse_command("seek 42.5%").unwrap(), Command::Seek(42.5));
        assert_eq!(
            parse_command("camera 2").unwrap(),
            Command::Start(VideoSourceHandle::Camera(2))
        );
        assert_eq!(
            parse_command("open /srv/clips/lobby video.mp4").unwrap(),
            Command::Start(VideoSourceHandle::File(PathBuf::from(
                "/srv/clips/lobby video.mp4"
            )))
        );
        assert_eq!(
            parse_command("mode Indoor").unwrap(),
            Command::Mode(DetectionMode::Indoor)
        );
        assert_eq!(parse_command("sound off").unwrap(), Command::Sound(false));
        assert_eq!(parse_command("q").unwrap(), Command::Quit);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command("seek half").is_err());
        assert!(parse_command("open").is_err());
        assert!(parse_command("mode night").is_err());
        assert!(parse_command("dance").is_err());
    }
}
