use clap::Parser;
use conveyor::cli::{self, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match cli::run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}
