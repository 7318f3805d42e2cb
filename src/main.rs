use std::process::ExitCode;

use crm_stage_loader::error::IngestError;

fn main() -> ExitCode {
    match crm_stage_loader::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ IngestError::Validation { .. }) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
