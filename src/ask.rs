//! `rag ask`: answer one question on the terminal.
//!
//! Tokens are printed as they stream in; sources and quality flags follow
//! once the answer is complete. Ctrl-C cancels the query.

use std::io::Write;

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::generation::CancelToken;
use crate::pipeline::{ChatEvent, ChatRequest, Stage};

pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    let pipeline = crate::build_pipeline(config).await?;
    pipeline.validate(question)?;

    let request = ChatRequest {
        session_id: None,
        message: question.to_string(),
        history: Vec::new(),
    };
    let cancel = CancelToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let query = tokio::spawn(async move { pipeline.run(&request, &cancel, &tx).await });

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Token { token } => {
                print!("{}", token);
                stdout.flush()?;
            }
            ChatEvent::Done(done) => {
                println!();
                println!();
                if done.incomplete {
                    println!("(answer incomplete: generation failed part-way)");
                }
                if !done.reranked {
                    println!("(sources in fused order: reranker unavailable)");
                }
                if done.filtered {
                    println!("(unsupported passages dropped before answering)");
                }
                if !done.degraded_sources.is_empty() {
                    println!("(degraded search: {})", done.degraded_sources.join(", "));
                }
                println!("sources:");
                for c in &done.sources {
                    let mark = if done.cited.contains(&c.marker) { "*" } else { " " };
                    println!(" {}[{}] {} ({})", mark, c.marker, c.title, c.document_id);
                }
                if !done.invalid_citations.is_empty() {
                    println!("unknown citations: {}", done.invalid_citations.join(" "));
                }
            }
            ChatEvent::Error { error } => bail!("{}: {}", error.code, error.message),
            ChatEvent::Cancelled { .. } => {
                println!();
                println!("cancelled");
            }
        }
    }

    let outcome = query.await?;
    if outcome.stage == Stage::Failed && outcome.incomplete {
        bail!("generation failed after a partial answer");
    }
    Ok(())
}
