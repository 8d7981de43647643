//! Environment/CLI configuration, loaded once at startup.

use clap::Parser;

pub const DEFAULT_SOVEREIGN_CONTRACT_ADDRESS: &str = "C4UAHoYgqZ7dmS4JypAwQcJ1YzYVM86S2eA1PTUthzve";
pub const DEFAULT_USDC_MINT: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU";
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const DEFAULT_PORT: u16 = 18515;
pub const DEFAULT_SOL_USDC_RATE: f64 = 150.0;

/// Runtime configuration for the proxy process.
///
/// Every field is readable from the environment (matching the Python
/// prototype's `os.getenv(...)` calls) and overridable on the command
/// line; a local `.env` file is loaded before parsing so both sources
/// agree on precedence.
#[derive(Parser, Debug, Clone)]
#[command(name = "agent-proxyd", about = "Metered LLM reverse proxy")]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "DATABASE_PATH", default_value = "agent_proxy.db")]
    pub database_path: String,

    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: Option<String>,

    #[arg(long, env = "HELIUS_API_KEY", default_value = "")]
    pub helius_api_key: String,

    #[arg(long, env = "HELIUS_RPC_URL")]
    pub helius_rpc_url: Option<String>,

    #[arg(long, env = "HELIUS_WS_URL")]
    pub helius_ws_url: Option<String>,

    #[arg(long, env = "SOVEREIGN_CONTRACT_ADDRESS", default_value = DEFAULT_SOVEREIGN_CONTRACT_ADDRESS)]
    pub program_id: String,

    #[arg(long, env = "USDC_MINT", default_value = DEFAULT_USDC_MINT)]
    pub usdc_mint: String,

    #[arg(long, env = "SOL_USDC_RATE", default_value_t = DEFAULT_SOL_USDC_RATE)]
    pub sol_usdc_rate: f64,

    /// Disable the liquid mirror's background workers (used by tests and
    /// local smoke runs that seed balances manually).
    #[arg(long, env = "DISABLE_MIRROR", default_value_t = false)]
    pub disable_mirror: bool,
}

impl Config {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Config::parse()
    }

    pub fn rpc_url(&self) -> String {
        self.helius_rpc_url.clone().unwrap_or_else(|| {
            format!(
                "https://devnet.helius-rpc.com/?api-key={}",
                self.helius_api_key
            )
        })
    }

    pub fn ws_url(&self) -> String {
        self.helius_ws_url.clone().unwrap_or_else(|| {
            format!(
                "wss://devnet.helius-rpc.com/?api-key={}",
                self.helius_api_key
            )
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}
