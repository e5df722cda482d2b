use tracing_subscriber::EnvFilter;

/// Installs the process-wide JSON subscriber. `RUST_LOG` filters apply.
pub fn init_json_logger() {
	tracing_subscriber::fmt()
		.json()
		.with_env_filter(EnvFilter::from_default_env())
		.init();
}
