use std::io::{self, IsTerminal};
use std::panic;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use crossterm::execute;
use crossterm::terminal::{LeaveAlternateScreen, disable_raw_mode};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ascii_dream::ascii_renderer::TargetWidth;
use ascii_dream::config::Config;
use ascii_dream::display::TerminalDisplay;
use ascii_dream::generation::{AspectRatio, QualityTier};
use ascii_dream::prompt_evolution::Theme;
use ascii_dream::session::DreamSession;

fn cli() -> Command {
    Command::new("ascii-dream")
        .about("Endless AI-generated ASCII art in your terminal")
        .long_about(
            "ascii-dream prefetches images from a text-to-image backend while the current \
             frame is on screen, renders them as coloured ASCII art and drifts the prompt \
             through a themed journey one small change at a time",
        )
        .arg(Arg::new("prompt")
            .short('p')
            .long("prompt")
            .help("Custom prompt (static unless --evolve is given)")
            .value_name("TEXT")
            .num_args(1))
        .arg(Arg::new("journey")
            .short('j')
            .long("journey")
            .help("Journey theme: abstract, nature, cosmic, liquid, custom")
            .value_name("THEME")
            .num_args(1))
        .arg(Arg::new("evolve")
            .long("evolve")
            .help("Start from --prompt, then keep evolving along the journey")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("width")
            .short('w')
            .long("width")
            .help("Render width in columns, or \"auto\"")
            .value_name("COLS")
            .num_args(1))
        .arg(Arg::new("fps")
            .long("fps")
            .help("Display ticks per second (0.1 to 5)")
            .value_name("FPS")
            .value_parser(value_parser!(f64))
            .conflicts_with("speed"))
        .arg(Arg::new("speed")
            .short('s')
            .long("speed")
            .help("Seconds between frames (0.2 to 10)")
            .value_name("SECONDS")
            .value_parser(value_parser!(f64)))
        .arg(Arg::new("capacity")
            .long("capacity")
            .visible_alias("buffer")
            .help("Frames to prefetch ahead of the display")
            .value_name("N")
            .value_parser(value_parser!(usize)))
        .arg(Arg::new("no-prefill")
            .long("no-prefill")
            .help("Show the first frame as soon as it is ready instead of filling the buffer first")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("fast")
            .long("fast")
            .help("Fast quality tier (smaller images, quicker frames)")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("aspect-ratio")
            .long("aspect-ratio")
            .help("Image aspect ratio: 1:1, 16:9, 9:16, 4:3, 3:4")
            .value_name("RATIO")
            .num_args(1))
        .arg(Arg::new("no-color")
            .long("no-color")
            .help("Monochrome output")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("seed")
            .long("seed")
            .help("Seed for a reproducible prompt journey")
            .value_name("SEED")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new("endpoint")
            .long("endpoint")
            .help("Text-to-image HTTP endpoint")
            .value_name("URL")
            .num_args(1))
        .arg(Arg::new("mock")
            .long("mock")
            .help("Use the offline procedural backend")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("headless")
            .long("headless")
            .help("Print frames to stdout without taking over the terminal")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("max-frames")
            .long("max-frames")
            .help("Stop after this many frames (headless mode)")
            .value_name("N")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new("save-config")
            .long("save-config")
            .help("Save the effective settings as defaults")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("show-config")
            .long("show-config")
            .help("Show configuration information")
            .action(ArgAction::SetTrue))
}

/// Command-line flags override file and environment settings.
fn apply_overrides(config: &mut Config, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(prompt) = matches.get_one::<String>("prompt") {
        config.prompt = Some(prompt.clone());
    }
    if let Some(journey) = matches.get_one::<String>("journey") {
        config.journey = journey.parse::<Theme>()?;
    }
    if matches.get_flag("evolve") {
        config.evolve = true;
    }
    if let Some(width) = matches.get_one::<String>("width") {
        config.width = TargetWidth::parse(width)?;
    }
    if let Some(fps) = matches.get_one::<f64>("fps") {
        config.fps = *fps;
    }
    if let Some(seconds) = matches.get_one::<f64>("speed") {
        config.set_seconds_per_frame(*seconds)?;
    }
    if let Some(capacity) = matches.get_one::<usize>("capacity") {
        config.capacity = *capacity;
    }
    if matches.get_flag("no-prefill") {
        config.prefill = false;
    }
    if matches.get_flag("fast") {
        config.quality = QualityTier::Fast;
    }
    if let Some(ratio) = matches.get_one::<String>("aspect-ratio") {
        config.aspect_ratio = ratio.parse::<AspectRatio>()?;
    }
    if matches.get_flag("no-color") {
        config.color = false;
    }
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = Some(*seed);
    }
    if let Some(endpoint) = matches.get_one::<String>("endpoint") {
        config.endpoint = Some(endpoint.clone());
    }
    if matches.get_flag("mock") {
        config.use_mock = true;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they never land in the frame area.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let matches = cli().get_matches();

    if matches.get_flag("show-config") {
        Config::show_config_info()?;
        return Ok(());
    }

    let mut config = Config::load()?;
    apply_overrides(&mut config, &matches)?;
    config.validate()?;

    if matches.get_flag("save-config") {
        let path = config.save()?;
        println!("Settings saved to {}", path.display());
    }

    let session = DreamSession::new(config)?;
    let headless = matches.get_flag("headless") || !io::stdout().is_terminal();

    if headless {
        let max_frames = matches.get_one::<u64>("max-frames").copied();
        let mut display = TerminalDisplay::stdout();
        let summary = session.run_headless(&mut display, max_frames).await?;
        info!("Headless dream finished: {} shown, {} skipped", summary.shown, summary.skipped);
        return Ok(());
    }

    // Restore the terminal before a panic message is printed.
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        original_hook(panic_info);
    }));

    session.run_interactive().await?;
    Ok(())
}
