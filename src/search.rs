//! `rag search`: show what the retriever and reranker pick for a question.

use anyhow::Result;

use crate::config::Config;

pub async fn run_search(config: &Config, query: &str, limit: Option<usize>, no_rerank: bool) -> Result<()> {
    let pipeline = crate::build_pipeline(config).await?;
    let mut retrieved = pipeline.retrieve(query, !no_rerank).await?;
    if let Some(limit) = limit {
        retrieved.candidates.truncate(limit);
    }

    let p = &retrieved.processed;
    println!("query: {}", p.expanded);
    println!("  intent: {}", p.intent.as_str());
    for (from, to) in &p.corrections {
        println!("  corrected: {} -> {}", from, to);
    }
    if !p.expansions.is_empty() {
        println!("  expanded with: {}", p.expansions.join(", "));
    }
    println!("  reranked: {}", retrieved.reranked);
    if retrieved.filtered {
        println!("  filtered: unsupported passages dropped");
    }
    if !retrieved.degraded_sources.is_empty() {
        println!("  degraded: {}", retrieved.degraded_sources.join(", "));
    }
    println!();

    if retrieved.candidates.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, c) in retrieved.candidates.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, c.score, c.title);
        println!("    document: {}", c.document_id);
        println!("    excerpt: \"{}\"", excerpt(&c.text, 160));
        println!("    chunk: {}", c.chunk_id);
        println!();
    }
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
