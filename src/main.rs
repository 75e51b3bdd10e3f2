use colored::Colorize;
use std::process::ExitCode;

fn main() -> ExitCode {
    match canonry::run().map_err(anyhow::Error::from) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            let code = err
                .downcast_ref::<canonry::core::error::CanonryError>()
                .map_or(1, |e| e.exit_code());
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
