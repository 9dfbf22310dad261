use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TCP port to listen on.
    #[arg(default_value_t = 8080)]
    pub port: u16,
}
