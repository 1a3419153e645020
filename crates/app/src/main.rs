mod cli;

use clap::Parser;
use vision::pipeline::PipelineConfig;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let config = PipelineConfig::try_from(cli.args)?;
    vision::pipeline::run(config)?;
    Ok(())
}
