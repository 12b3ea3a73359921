use std::io::Write;
use std::path::PathBuf;

use ls8::{program, Console, Cpu, Status};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

/// LS-8 machine runner
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Program image to load and execute
    image: PathBuf,

    /// Maximum number of cycles to run before giving up
    #[clap(long)]
    fuel: Option<u64>,
}

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("LS8_LOG", "info")
        .write_style_or("LS8_LOG", "always");
    env_logger::init_from_env(env);

    let args = Args::parse();
    let text = std::fs::read_to_string(&args.image)
        .with_context(|| format!("failed to open {:?}", args.image))?;
    let image = program::parse_image(&text)
        .with_context(|| format!("failed to parse {:?}", args.image))?;

    let mut cpu = Cpu::new();
    cpu.load(&image).context("failed to load image")?;

    let mut console = Console::new();
    let start = std::time::Instant::now();
    let mut cycles = 0u64;
    while cpu.step(&mut console)? == Status::Running {
        flush(&mut console)?;
        cycles += 1;
        if args.fuel.is_some_and(|f| cycles >= f) {
            bail!("gave up after {cycles} cycles without reaching HLT");
        }
    }
    flush(&mut console)?;
    info!("halted after {cycles} cycles in {:?}", start.elapsed());

    Ok(())
}

/// Drains the console buffer to `stdout`
fn flush(console: &mut Console) -> Result<()> {
    let out = console.take_output();
    if !out.is_empty() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&out)?;
        stdout.flush()?;
    }
    Ok(())
}
