use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Runs one task item from a request file.",
    long_about = "Invoked once per item by a submitted job script. Reads the request, checks that it was written by a compatible server and leaves the outcome in the response file."
)]
pub struct Cli {
    #[arg(long, help = "Request file written by the server")]
    pub input_file: PathBuf,

    #[arg(long, help = "Where to write the response")]
    pub output_file: PathBuf,

    #[arg(long, help = "Append logs to this file instead of stderr")]
    pub log_file: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase verbosity level (-v for debug, -vv for trace)")]
    pub verbose: u8,
}
