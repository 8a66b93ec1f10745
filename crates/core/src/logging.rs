use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Chatty third-party targets are clamped unless the user asked for a
/// filter explicitly.
pub const DEFAULT_NOISE_FILTER: &str = "candle_core=warn,tokenizers=warn,hf_hub=warn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub verbose: u8,
    pub host_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            verbose: 0,
            host_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
        }
    }
}

/// Select the effective filter directive string.
///
/// Priority: explicit host filter > verbosity flags > RUST_LOG > default.
/// The noise filter is prepended only when the selection was implicit, so an
/// explicit filter always sees exactly what it asked for.
pub fn compose_log_filter(options: &LoggingInitOptions) -> String {
    let (user_filter, explicit) = if let Some(filter) = options.host_log_filter.as_deref() {
        (filter.to_string(), true)
    } else if options.verbose >= 2 {
        ("trace".to_string(), true)
    } else if options.verbose == 1 {
        ("debug".to_string(), true)
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        (filter.to_string(), false)
    } else {
        (options.default_log_filter.clone(), false)
    };

    if !explicit && !options.noise_filter.trim().is_empty() {
        format!("{},{user_filter}", options.noise_filter)
    } else {
        user_filter
    }
}

/// Install the global tracing subscriber. Safe to call more than once from a
/// host that reloads plugins; subsequent calls are ignored.
pub fn init_logging(options: &LoggingInitOptions) {
    let filter = compose_log_filter(options);
    let env_filter = EnvFilter::try_new(&filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
