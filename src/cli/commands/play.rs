//! Interactive playback command.

use std::io::BufRead;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::debug;

use crate::config;
use crate::error::{Error, Result, ResultExt};
use crate::player::{Player, PlayerError};

const HELP: &str = "Commands: [enter]/p pause-resume, s SECS seek, + / - volume, i info, q quit";

/// How often the loop checks for the end of the track.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One line of interactive input.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Toggle,
    Seek(f64),
    VolumeUp,
    VolumeDown,
    Info,
    Quit,
    Help,
}

fn parse_action(line: &str) -> Action {
    let line = line.trim();
    match line {
        "" | "p" | "space" => Action::Toggle,
        "+" => Action::VolumeUp,
        "-" => Action::VolumeDown,
        "i" => Action::Info,
        "q" | "quit" => Action::Quit,
        _ => match line.strip_prefix('s').map(str::trim).map(str::parse::<f64>) {
            Some(Ok(secs)) if secs >= 0.0 => Action::Seek(secs),
            _ => Action::Help,
        },
    }
}

/// Play a file until it ends or the user quits
pub fn cmd_play(path: &Path, volume: Option<f32>, start: Option<f64>) -> Result<()> {
    if !path.exists() {
        return Err(Error::not_found(path));
    }

    let player = Player::with_default_output(config::load());
    if let Some(volume) = volume {
        player.set_volume(volume);
    }

    player
        .load(path)
        .with_context(format!("Failed to load {}", path.display()))?;
    if let Some(secs) = start {
        player.seek(Duration::from_secs_f64(secs))?;
    }
    player.play()?;

    println!("Playing {}", path.display());
    println!("{}", HELP);

    let input = spawn_stdin_reader();
    let mut input_open = true;

    loop {
        if input_open {
            match input.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    if !handle_action(&player, parse_action(&line))? {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("stdin closed, playing to the end");
                    input_open = false;
                }
            }
        } else {
            thread::sleep(POLL_INTERVAL);
        }

        if player.has_ended()? {
            println!("Finished");
            break;
        }
    }

    player.close();
    Ok(())
}

/// Returns false when the user asked to quit.
fn handle_action(player: &Player, action: Action) -> Result<bool> {
    match action {
        Action::Toggle => {
            player.toggle()?;
            print_state(player);
        }
        Action::Seek(secs) => match player.seek(Duration::from_secs_f64(secs)) {
            Ok(()) => print_state(player),
            Err(PlayerError::SeekInProgress) => println!("Seek already in progress"),
            Err(e) => return Err(e.into()),
        },
        Action::VolumeUp => println!("Volume: {:.0}%", player.volume_up() * 100.0),
        Action::VolumeDown => println!("Volume: {:.0}%", player.volume_down() * 100.0),
        Action::Info => {
            print_state(player);
            println!("  {}", player.state().buffer_info());
        }
        Action::Quit => return Ok(false),
        Action::Help => println!("{}", HELP),
    }
    Ok(true)
}

fn print_state(player: &Player) {
    let state = player.state();
    println!(
        "[{:?}] {} / {} ({:.0}%)  volume {:.0}%",
        state.status,
        state.position_str(),
        state.duration_str(),
        state.position_fraction() * 100.0,
        state.volume * 100.0
    );
}

/// Forward stdin lines to a channel so the loop can also watch for the end.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("No interactive input: {}", e);
    }
    rx
}
