use std::process::ExitCode;

use clap::Parser;

use gearlink::{Args, fake_gear_transport, real_gear_transport, run_with_log_level};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let log_level = args.log_level();
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let transport = match maybe_fake_args {
            Some(fake_args) => fake_gear_transport(fake_args),
            None => real_gear_transport().await?,
        };

        run_with_log_level(command, &mut stdout, transport, log_level).await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
