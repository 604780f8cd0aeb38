use clap::{Parser, Subcommand};
use remdbg_protocol::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_IP, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(
    name = "remdbg",
    about = "Remote debugger for processes hosting the remdbg script runtime",
    version
)]
pub struct Cli {
    /// Verbose logging to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect a debugging console to a listening target.
    Connect {
        #[arg(default_value = DEFAULT_IP)]
        ip: String,
        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Connection timeout in seconds.
        #[arg(short, long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
        timeout: f64,
    },

    /// Start a debug server inside a running process, then connect to it.
    Attach {
        pid: u32,
        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Connection timeout in seconds.
        #[arg(short, long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
        timeout: f64,
        /// External injector command; receives the pid and the bootstrap
        /// expression as its two arguments.
        #[arg(long)]
        injector: Option<String>,
    },

    /// Run a script with debugging. Flags after the script name are passed
    /// to the script as is.
    Run {
        #[arg(short = 'i', long = "bind", default_value = DEFAULT_IP)]
        bind: String,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Do not drop into post-mortem when the script fails.
        #[arg(short = 'n', long)]
        no_post_mortem: bool,
        /// Arm tracing from the script's first statement.
        #[arg(short = 's', long)]
        use_set_trace: bool,
        /// Resolve the script as a dotted module name.
        #[arg(short = 'm', long)]
        run_as_module: bool,
        file: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}
