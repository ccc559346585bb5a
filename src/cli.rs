use clap::{arg, command, Parser};

/// Runs a pipeline node from its JSON configuration file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// A JSON file describing this pipeline's name, scripts, and peers
    #[arg(short, long, default_value = "pipeline.json")]
    pub pipeline_file: String,

    /// Name of the inbound network interface used to accept connections
    #[arg(long, default_value = "eth0")]
    pub inbound_interface: String,

    /// Name(s) of the outbound network interface(s) used to broadcast discovery
    #[arg(long, default_values_t = vec!["eth0".to_string()])]
    pub outbound_interfaces: Vec<String>,

    /// UDP/TCP port used for peer discovery
    #[arg(long, default_value_t = 5557)]
    pub discovery_port: u16,

    /// Path to the Python interpreter's module search root (in addition to each script's own directory)
    #[arg(long)]
    pub module_search_root: Option<String>,
}

impl CliArgs {
    pub fn do_parse() -> CliArgs {
        CliArgs::parse()
    }
}
