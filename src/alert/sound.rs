use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};

/// Audible alert cue. `play` must return without waiting for playback to finish.
pub trait SoundCue: Send + Sync {
    fn play(&self) -> Result<()>;
}

/// ASCII BEL on stderr.
pub struct TerminalBell;

impl SoundCue for TerminalBell {
    fn play(&self) -> Result<()> {
        let mut err = std::io::stderr();
        err.write_all(b"\x07").context("failed to ring terminal bell")?;
        err.flush().context("failed to ring terminal bell")?;
        Ok(())
    }
}

/// Spawns an external player, e.g. `["paplay", "/usr/share/sounds/alert.oga"]`.
pub struct CommandSound {
    program: String,
    args: Vec<String>,
}

impl CommandSound {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("sound command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl SoundCue for CommandSound {
    fn play(&self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start sound player '{}'", self.program))?;
        // Reap the player off the caller's thread.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

pub struct SilentSound;

impl SoundCue for SilentSound {
    fn play(&self) -> Result<()> {
        Ok(())
    }
}

/// Player from config: the command when given, otherwise the terminal bell.
pub fn from_command(command: Option<&[String]>) -> Result<Box<dyn SoundCue>> {
    match command {
        Some(command) => Ok(Box::new(CommandSound::new(command)?)),
        None => Ok(Box::new(TerminalBell)),
    }
}
