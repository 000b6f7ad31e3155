//! chanreg configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default host registered as this server's address
    pub static DEFAULT_HOST: &str = "127.0.0.1:7000";
    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// Default per-attempt timeout connecting to the coordination service (seconds)
    pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5;
    /// Default number of connect retries after the first attempt
    pub const DEFAULT_CONNECT_RETRY_MAX: u32 = 3;
    /// Load (connections + queued) at or above which a channel owner is
    /// reported as busy
    pub const DEFAULT_LOAD_CEILING: u64 = 1_000;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "chanreg-worker";
    /// default log level. Can use this argument or CHANREG_LOG env var
    pub const DEFAULT_CHANREG_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    use std::{net::SocketAddr, time::Duration};

    pub use clap::Parser;
    use coordination::ConnectPolicy;

    use crate::registry::RegistryOptions;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "chanreg", bin_name = "chanreg", about, long_about = None)]
    /// parses from cli & environment var. chanreg will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// host address this server registers under
        #[clap(long, env, value_parser, default_value = DEFAULT_HOST)]
        pub host: String,
        /// the address the external api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// per-attempt timeout connecting to the coordination service, in seconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CONNECT_TIMEOUT)]
        pub connect_timeout: u64,
        /// connection retries after the first attempt fails
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CONNECT_RETRY_MAX)]
        pub connect_retry_max: u32,
        /// load at or above which a channel's owner is reported busy
        #[clap(long, env, value_parser, default_value_t = DEFAULT_LOAD_CEILING)]
        pub load_ceiling: u64,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// Worker thread count, defaults to the number of cpus
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_CHANREG_LOG)]
        pub chanreg_log: String,
        /// log output format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
    }

    impl Config {
        /// Create new connect timeout as `Duration`
        pub fn connect_timeout(&self) -> Duration {
            Duration::from_secs(self.connect_timeout)
        }

        /// retry policy for the initial coordination connect
        pub fn connect_policy(&self) -> ConnectPolicy {
            ConnectPolicy {
                timeout: self.connect_timeout(),
                retry_max: self.connect_retry_max,
                ..ConnectPolicy::default()
            }
        }

        /// options for opening the registry
        pub fn registry_options(&self) -> RegistryOptions {
            RegistryOptions {
                host: self.host.clone(),
                load_ceiling: self.load_ceiling,
            }
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for `tracing` output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(chanreg_log: &str, log_frmt: &str) -> Result<Self> {
            // Log level comes from CHANREG_LOG
            let filter = EnvFilter::try_new(chanreg_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
