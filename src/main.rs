use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match log_fanout::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
