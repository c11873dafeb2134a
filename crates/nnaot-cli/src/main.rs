use clap::Parser;
use nnaot_cli::{execute, print_outcome, register_backends, Cli};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .init();

    register_backends();
    let outcome = execute(&cli)?;
    print_outcome(&cli, &outcome);
    Ok(())
}
