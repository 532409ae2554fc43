//! `lendrail init`: write a node configuration with default values.

use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory to initialize (defaults to current directory).
    #[arg(default_value = ".")]
    pub dir: PathBuf,
}

const DEFAULT_CONFIG: &str = r#"# lendrail node configuration

[api]
listen_addr = "127.0.0.1"
port = 9101

[storage]
# rocksdb | memory
backend = "rocksdb"
data_dir = "./data"

[ledger]
# simulated | http
mode = "simulated"
endpoint = "http://127.0.0.1:8545"
request_timeout_ms = 5000
signer_key_path = "./data/signer.key"

[dispatch]
poll_interval_ms = 2000
submission_timeout_ms = 5000
max_attempts = 5
failure_trip_threshold = 5

[logging]
level = "info"
# text | json
format = "text"
"#;

pub fn run(args: &InitArgs) -> anyhow::Result<()> {
    let config_path = args.dir.join("lendrail.toml");

    if config_path.exists() {
        anyhow::bail!("configuration file already exists at {}", config_path.display());
    }

    std::fs::create_dir_all(&args.dir)?;
    std::fs::write(&config_path, DEFAULT_CONFIG)?;
    println!("Initialized lendrail node at {}", config_path.display());
    println!("Edit lendrail.toml to customize your configuration.");
    println!("Run 'lendrail-node --config {}' to start the node.", config_path.display());

    // Create data directory
    let data_dir = args.dir.join("data");
    std::fs::create_dir_all(&data_dir)?;

    Ok(())
}
