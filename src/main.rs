//! jobmarket - one-shot snapshot of the marketplace view as JSON

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use jobmarket_sync::{
    config::Args,
    logging,
    transport::FileTokenStore,
    AuthTransport, IdentityInput, LedgerProvider, MarketApi, MarketError, MemoryLedger, Pipeline,
    ProfileCache,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let Some(fixture) = args.ledger_fixture.clone() else {
        error!("Configuration error: LEDGER_FIXTURE is required");
        std::process::exit(1);
    };
    let wallet = args.wallet_address().map_err(MarketError::Config)?;

    info!("Ledger fixture: {}", fixture.display());
    info!("Token store: {}", args.token_store.display());

    let tokens = Arc::new(FileTokenStore::new(args.token_store.clone()));
    let transport = Arc::new(AuthTransport::new(args.transport_config(), tokens));
    info!("API: {}", transport.base_url());
    let api = Arc::new(MarketApi::new(transport));
    let cache = Arc::new(ProfileCache::new(api.clone()));

    let ledger: Arc<dyn LedgerProvider> = Arc::new(MemoryLedger::from_json_file(&fixture)?);
    let pipeline = Pipeline::new(api, cache.clone(), Some(ledger.clone()), args.pipeline_config());

    let input = match wallet {
        Some(address) => IdentityInput::connected(address, ledger),
        None => IdentityInput::disconnected(),
    };
    pipeline.set_identity(input);
    pipeline.refresh().await;

    let snapshot = pipeline.snapshot();
    let stats = cache.stats();
    info!(
        jobs = snapshot.jobs.len(),
        disputes = snapshot.disputes.len(),
        conversations = snapshot.conversations.len(),
        diagnostics = snapshot.diagnostics.len(),
        profile_lookups = stats.lookups,
        profile_hits = stats.hits + stats.coalesced,
        "Snapshot complete"
    );

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
