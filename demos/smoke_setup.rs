//! Local smoke-test setup: registers an agent against a running proxy,
//! seeds a local balance directly in sqlite (bypassing the on-chain
//! deposit), and writes a sourceable `proxy.env`.
//!
//! Usage: `smoke-setup [--proxy-url URL] [--database-path PATH]`

use std::path::Path;

use agent_proxyd::ledger::Ledger;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "smoke-setup", about = "Level5 local smoke-test setup")]
struct Args {
    #[arg(long, default_value = "http://localhost:18515")]
    proxy_url: String,

    #[arg(long, default_value = "agent_proxy.db")]
    database_path: String,

    #[arg(long, default_value = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU")]
    usdc_mint: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let base = args.proxy_url.trim_end_matches('/');

    let resp: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/v1/register"))
        .send()
        .await?
        .json()
        .await?;
    let api_token = resp["api_token"].as_str().expect("register response missing api_token").to_string();
    let deposit_code = resp["deposit_code"].as_str().expect("register response missing deposit_code").to_string();
    println!("api_token:    {api_token}");
    println!("deposit_code: {deposit_code}");

    let ledger = Ledger::open(&args.database_path, &args.usdc_mint, 150.0)?;
    ledger.manual_seed("local-dev-agent", &args.usdc_mint, 10_000_000).await?;
    ledger.activate_token(&deposit_code, "local-dev-agent").await?;
    println!("Balance seeded: 10 USDC");

    let env_contents = format!(
        "export ANTHROPIC_BASE_URL={base}/proxy/{api_token}\n\
         export ANTHROPIC_API_KEY=level5\n\
         export LEVEL5_API_TOKEN={api_token}\n"
    );
    std::fs::write(Path::new("proxy.env"), env_contents)?;
    println!("Wrote proxy.env — run: source proxy.env");

    Ok(())
}
