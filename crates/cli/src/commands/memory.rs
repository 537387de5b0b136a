//! `toolweave memory`: Memory management commands.

use super::load_config;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use toolweave_config::AppConfig;
use toolweave_core::memory::RetrievalSet;
use toolweave_memory::MemoryStore;
use toolweave_providers::ProviderRouter;

/// Open the configured store, wiring the embedding provider when one is named.
pub async fn open_store(config: &AppConfig, providers: &ProviderRouter) -> anyhow::Result<MemoryStore> {
    let embedder = match config.memory.embedding.as_str() {
        "hash" => None,
        name => providers.get(name),
    };
    toolweave_memory::open_from_config(&config.memory, embedder)
        .await
        .with_context(|| format!("Failed to open {} memory store", config.memory.backend))
}

async fn open(explicit: Option<&Path>) -> anyhow::Result<(AppConfig, MemoryStore)> {
    let config = load_config(explicit)?;
    let providers = toolweave_providers::build_from_config(&config);
    let store = open_store(&config, &providers).await?;
    Ok((config, store))
}

pub async fn stats(explicit: Option<&Path>) -> anyhow::Result<()> {
    let (config, store) = open(explicit).await?;
    let stats = store.stats();

    println!("🧠 Memory Statistics");
    println!("====================");
    println!("  Backend:     {}", store.backend_name());
    if config.memory.backend == "sqlite" {
        let db_path = config.memory.db_path();
        match std::fs::metadata(&db_path) {
            Ok(meta) => println!(
                "  DB file:     {} ({:.1} KB)",
                db_path.display(),
                meta.len() as f64 / 1024.0
            ),
            Err(_) => println!("  DB file:     (not created yet)"),
        }
    }
    println!("  Embeddings:  {} ({} dims)", config.memory.embedding, config.memory.dimension);
    println!(
        "  Episodes:    {} ({} successful)",
        stats.episodes, stats.successful_episodes
    );
    println!("  Rules:       {}", stats.rules);
    println!(
        "  Strategies:  {} / {}",
        stats.strategies, config.memory.procedural_capacity
    );
    println!("  Avg reward:  {:.3}", stats.average_reward);
    println!("  Avg import.: {:.3}", stats.average_importance);
    Ok(())
}

pub async fn search(explicit: Option<&Path>, query: &str, limit: usize) -> anyhow::Result<()> {
    let (_config, store) = open(explicit).await?;

    println!("🔍 Searching memories for: \"{query}\"");
    println!();

    let results = store.search_text(query, limit.max(1)).await;
    if results.is_empty() {
        println!("   No memories found.");
    } else {
        for line in render_results(&results) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn seed(explicit: Option<&Path>) -> anyhow::Result<()> {
    let (_config, store) = open(explicit).await?;
    let added = store
        .seed_default_strategies()
        .await
        .context("Failed to seed strategies")?;
    if added == 0 {
        println!("Procedural memory already has strategies; nothing seeded.");
    } else {
        println!("✅ Seeded {added} default strategies");
    }
    Ok(())
}

fn render_results(results: &RetrievalSet) -> Vec<String> {
    let mut lines = Vec::new();
    if !results.rules.is_empty() {
        lines.push("  Rules".to_string());
        for s in &results.rules {
            lines.push(format!(
                "    [score: {:.2}] {} (confidence {:.2})",
                s.score,
                truncate(&s.item.rule, 80),
                s.item.confidence
            ));
        }
    }
    if !results.strategies.is_empty() {
        lines.push("  Strategies".to_string());
        for s in &results.strategies {
            lines.push(format!(
                "    [score: {:.2}] {}: {} (priority {:.2})",
                s.score,
                s.item.name,
                truncate(&s.item.description, 60),
                s.item.priority
            ));
        }
    }
    if !results.episodes.is_empty() {
        lines.push("  Episodes".to_string());
        for s in &results.episodes {
            let mark = if s.item.success { "✓" } else { "✗" };
            lines.push(format!(
                "    [score: {:.2}] {mark} {} (reward {:.2})",
                s.score,
                truncate(&s.item.task, 70),
                s.item.reward
            ));
        }
    }
    lines
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

/// Shared handle for the run command.
pub async fn open_shared(config: &AppConfig, providers: &ProviderRouter) -> anyhow::Result<Arc<MemoryStore>> {
    let store = open_store(config, providers).await?;
    store
        .seed_default_strategies()
        .await
        .context("Failed to seed strategies")?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolweave_memory::StoreLimits;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 3), "ééé…");
    }

    #[tokio::test]
    async fn renders_seeded_strategies() {
        let store = MemoryStore::ephemeral(64, StoreLimits::default());
        store.seed_default_strategies().await.unwrap();
        let results = store.search_text("verify before modify", 2).await;
        let lines = render_results(&results);
        assert_eq!(lines[0], "  Strategies");
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn in_memory_backend_opens_from_config() {
        let mut config = AppConfig::default();
        config.memory.backend = "memory".into();
        config.memory.embedding = "hash".into();
        let providers = toolweave_providers::build_from_config(&config);
        let store = open_shared(&config, &providers).await.unwrap();
        assert_eq!(store.stats().strategies, 5);
    }
}
