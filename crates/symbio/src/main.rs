use std::sync::Arc;
use std::time::Duration;

use symbio_core::ingest::{
    ChatCompletionsModel, ContentNormalizer, FactExtractor, ModelAssistedExtractor,
    RuleBasedExtractor, TabularParser, Validator,
};
use symbio_core::{EngineConfig, FsRawStore, Orchestrator, Storage};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "symbio=info,symbio_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    config.validate()?;

    let storage = Arc::new(
        Storage::open(&config.storage.database_path)
            .await?
            .with_stale_claim_after(config.orchestrator.stale_claim_after()),
    );
    let raw = Arc::new(FsRawStore::open(&config.storage.raw_dir).await?);

    let categories = config.category_table()?;
    let tabular = TabularParser::new(
        config.schema_profiles()?,
        categories.clone(),
        config.tabular.clone(),
    );

    let mut extractor = FactExtractor::new(Validator::new(config.validation.clone()))
        .with_rules(Box::new(RuleBasedExtractor::new(categories.clone())));
    if let Some(model) = &config.model {
        let client = ChatCompletionsModel::new(
            &model.base_url,
            &model.model,
            model.api_key.clone(),
            Duration::from_secs(model.timeout_seconds),
        )?;
        tracing::info!(model = %model.model, "model-assisted fallback enabled");
        extractor = extractor.with_fallback(Box::new(ModelAssistedExtractor::new(Arc::new(client))));
    }

    let mut orchestrator = Orchestrator::new(storage.clone(), storage.clone(), raw)
        .with_config(config.orchestrator.clone())
        .with_normalizer(ContentNormalizer::new(categories))
        .with_tabular(tabular)
        .with_extractor(extractor);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        shutdown.cancel();
    });

    tracing::info!(database = %config.storage.database_path, "starting symbio");
    let stats = orchestrator.run_continuous(cancel).await;

    for (status, count) in storage.count_by_status().await? {
        tracing::info!(%status, count, "documents");
    }
    tracing::info!("{}", serde_json::to_string(&stats)?);

    Ok(())
}
