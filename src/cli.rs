use clap::{Parser, ValueEnum};
use jsonrpc_connection::jsonrpc::Trace;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub partial_message_timeout: Duration,
    pub trace: Trace,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum TraceLevel {
    Off,
    Messages,
    Verbose,
}

impl From<TraceLevel> for Trace {
    fn from(level: TraceLevel) -> Self {
        match level {
            TraceLevel::Off => Trace::Off,
            TraceLevel::Messages => Trace::Messages,
            TraceLevel::Verbose => Trace::Verbose,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "jsonrpc-connection")]
#[command(about = "Serve a small JSON-RPC endpoint over stdin/stdout", long_about = None)]
pub struct Cli {
    /// Milliseconds a message may stay incomplete before it is reported; 0 disables.
    #[arg(long, default_value_t = 10_000)]
    pub partial_message_timeout_ms: u64,
    #[arg(long, value_enum, default_value_t = TraceLevel::Off)]
    pub trace: TraceLevel,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn into_config(self) -> Config {
        Config {
            partial_message_timeout: Duration::from_millis(self.partial_message_timeout_ms),
            trace: self.trace.into(),
        }
    }
}
