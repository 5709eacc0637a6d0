use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use live_mentor::codec::AudioBuffer;
use live_mentor::config::FRAME_SIZE;
use live_mentor::live::WebSocketConnector;
use live_mentor::voice::{
    AudioCapture, AudioPlayback, CpalInput, CpalOutput, InputStream, OutputDevice,
    PLAYBACK_SAMPLE_RATE, SAMPLE_RATE, calculate_rms, samples_to_wav,
};
use live_mentor::{Config, Session, SessionState, SessionStatus};

/// Mentor - realtime voice conversations with an AI skills mentor
#[derive(Parser)]
#[command(name = "mentor", version, about)]
struct Cli {
    /// Live model to talk to
    #[arg(short, long, env = "MENTOR_MODEL")]
    model: Option<String>,

    /// Prebuilt voice for the mentor
    #[arg(long, env = "MENTOR_VOICE")]
    voice: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the recording as a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,live_mentor=info",
        1 => "info,live_mentor=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, output } => test_mic(duration, output).await,
            Command::TestSpeaker => test_speaker().await,
        };
    }

    let mut config = Config::load()?;
    if let Some(model) = cli.model {
        config.live.model = model;
    }
    if let Some(voice) = cli.voice {
        config.live.voice = voice;
    }

    let connector = WebSocketConnector::new(&config.live.endpoint, config.api_key()?)?;
    let mut session = Session::new(
        config.session_config(),
        Box::new(connector),
        Box::new(CpalInput),
        Box::new(CpalOutput),
    );

    // Stop on Ctrl-C
    let controller = session.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            controller.stop();
        }
    });

    // Render transitions while running; the final state is printed below
    let mut status = session.status();
    tokio::spawn(async move {
        let mut last_state = SessionState::Idle;
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if current.state != last_state && current.state != SessionState::Closed {
                last_state = current.state;
                render_status(&current);
            }
        }
    });

    let result = match session.start().await {
        Ok(()) => session.run().await,
        Err(e) => Err(e),
    };

    let status = session.current_status();
    render_status(&status);
    if status.dropped_frames > 0 {
        tracing::warn!(
            dropped = status.dropped_frames,
            "some server audio could not be decoded"
        );
    }

    result?;
    Ok(())
}

fn render_status(status: &SessionStatus) {
    match status.state {
        SessionState::Idle => {}
        SessionState::Connecting => {
            println!("Connecting... waking up your personal skills coach");
        }
        SessionState::Open => {
            println!("AI Mentor is live - go ahead, ask about your current project!");
        }
        SessionState::Closed => match &status.last_error {
            Some(error) => println!("Session ended: {error}"),
            None => println!("Session ended."),
        },
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::open(SAMPLE_RATE, FRAME_SIZE)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start(tx)?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    let mut recording = Vec::new();

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut second = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            second.extend(frame);
        }

        let energy = calculate_rms(&second);
        let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        if output.is_some() {
            recording.extend(second);
        }
    }

    capture.stop();

    if let Some(path) = output {
        let wav = samples_to_wav(&recording, SAMPLE_RATE)?;
        std::fs::write(&path, wav)?;
        println!("\nSaved {} samples to {}", recording.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a tone split into back-to-back buffers
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a continuous 440Hz tone for 2 seconds\n");

    let (tx, mut completions) = mpsc::unbounded_channel();
    let mut playback = AudioPlayback::open(PLAYBACK_SAMPLE_RATE, tx)?;

    let frequency = 440.0_f32;
    let chunk_secs = 0.25_f32;
    let chunks = 8;
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let chunk_len = (PLAYBACK_SAMPLE_RATE as f32 * chunk_secs) as usize;

    let mut cursor = 0.0_f64;
    for chunk in 0..chunks {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..chunk_len)
            .map(|i| {
                let t = (chunk * chunk_len + i) as f32 / PLAYBACK_SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();
        let buffer = AudioBuffer::mono(PLAYBACK_SAMPLE_RATE, samples)?;
        let start_at = playback.now().max(cursor);
        cursor = start_at + buffer.duration();
        playback.schedule(buffer, start_at)?;
    }

    println!(
        "Scheduled {chunks} buffers on {} channel(s) at {} Hz...",
        playback.channels(),
        playback.sample_rate()
    );

    let timeout = Duration::from_secs_f64(cursor + 1.0);
    let mut finished = 0;
    while finished < chunks {
        match tokio::time::timeout(timeout, completions.recv()).await {
            Ok(Some(_)) => finished += 1,
            _ => break,
        }
    }
    playback.close();

    println!("\n---");
    println!("If you heard one unbroken tone, gapless playback works!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}
