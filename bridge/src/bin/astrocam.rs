//! Astrocam console runner
//!
//! Drives the session engine at a fixed cadence against simulated hardware.
//! Commands are read from stdin, one per line:
//!
//! `s` shutter, `m` menu, `p` polar step, `n` next mode, `v` live/playback,
//! `r` rotate the simulated mount 30° in RA, `q` quit.
//!
//! Usage: `astrocam [DATA_DIR]` (defaults to `./astrocam-data`).

use anyhow::{Context, Result};
use astrocam_bridge::sim_devices::{
    SimulatedCamera, SimulatedGuidePort, SimulatedGuideStar, SimulatedSolver,
};
use astrocam_bridge::{init_logging, SettingsStorage};
use astrocam_sequencer::{
    EnginePorts, EngineStatus, FitsDirectory, InputEvent, NoticeLevel, SessionEngine,
    SkyPosition, SolveStatus, TickInput,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

enum Command {
    Input(InputEvent),
    RotateMount,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "s" => Some(Command::Input(InputEvent::Shutter)),
        "m" => Some(Command::Input(InputEvent::Menu)),
        "p" => Some(Command::Input(InputEvent::PrimaryAction)),
        "n" => Some(Command::Input(InputEvent::SecondaryAction)),
        "v" => Some(Command::Input(InputEvent::ModeToggle)),
        "r" => Some(Command::RotateMount),
        "q" => Some(Command::Quit),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("astrocam-data"));

    init_logging(Some(data_dir.join("logs"))).context("failed to initialize logging")?;
    tracing::info!("Astrocam {} starting in {}", astrocam_bridge::get_version(), data_dir.display());

    let storage = SettingsStorage::new(&data_dir).context("failed to open settings storage")?;
    let config = storage
        .load()
        .with_context(|| format!("failed to load {}", storage.path().display()))?;

    let output_dir = if config.capture.output_dir.is_absolute() {
        config.capture.output_dir.clone()
    } else {
        data_dir.join(&config.capture.output_dir)
    };

    let solver = Arc::new(SimulatedSolver::new(SkyPosition::new(37.95, 89.26)));
    let star = Arc::new(SimulatedGuideStar::new());
    let guiding = config.guide.enabled;
    let mut engine = SessionEngine::new(
        config,
        EnginePorts {
            camera: Arc::new(SimulatedCamera::default()),
            solver: solver.clone(),
            guide: Arc::new(SimulatedGuidePort::new(star.clone())),
            sink: Arc::new(FitsDirectory::new(output_dir)),
        },
        Handle::current(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_command(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None => eprintln!("unknown command {:?}", line.trim()),
            }
        }
    });

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut previous: Option<EngineStatus> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }

        let mut input = TickInput::default();
        let mut quit = false;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Input(event) => input.events.push(event),
                Command::RotateMount => solver.slew_ra(30.0),
                Command::Quit => quit = true,
            }
        }
        if guiding {
            input.guide_offset = Some(star.observe());
        }

        let status = engine.tick(input);
        report(&status, previous.as_ref());
        previous = Some(status);

        if quit {
            break;
        }
    }

    if engine.capture().in_flight_count() > 0 {
        tracing::warn!("Exiting with a frame still in flight");
    }
    tracing::info!("Astrocam stopped");
    Ok(())
}

fn report(status: &EngineStatus, previous: Option<&EngineStatus>) {
    for notice in &status.notices {
        match notice.level {
            NoticeLevel::Info => tracing::info!("{}", notice.message),
            NoticeLevel::Warning => tracing::warn!("{}", notice.message),
            NoticeLevel::Error => tracing::error!("{}", notice.message),
        }
    }

    let Some(prev) = previous else {
        return;
    };
    if prev.solve != status.solve {
        if let SolveStatus::Solved { solution, stale: false } = &status.solve {
            tracing::info!(
                "Solved RA {:.4} Dec {:.4} ({:.2}\"/px)",
                solution.ra_deg,
                solution.dec_deg,
                solution.pixel_scale_arcsec
            );
        }
    }
    if !Arc::ptr_eq(&prev.targets, &status.targets) {
        let names: Vec<&str> = status
            .targets
            .iter()
            .filter(|t| t.in_frame)
            .map(|t| t.alias.as_deref().unwrap_or(&t.name))
            .collect();
        if !names.is_empty() {
            tracing::info!("In view: {}", names.join(", "));
        }
    }
    if prev.correction != status.correction {
        if let Some(c) = &status.correction {
            tracing::info!(
                "Move star to RA {:.4} Dec {:.4} ({:.1}' at {:.0}°, axis error {:.1}')",
                c.target.ra_deg,
                c.target.dec_deg,
                c.magnitude_arcmin,
                c.direction_deg,
                c.axis_error_arcmin
            );
        }
    }
    if status.no_signal && !prev.no_signal {
        tracing::error!("NO SIGNAL");
    }
    if let Some(count) = status.saturated_count {
        if prev.saturated_count != Some(count) && count > 999 {
            tracing::debug!("Saturated pixels: 999+");
        }
    }
}
