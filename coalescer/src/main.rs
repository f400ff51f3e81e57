use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use coalescer::{executor_fn, CoalesceError, CoalescerConfig, Engine};
use futures::future::join_all;
use uuid::Uuid;

#[derive(Debug, Parser)]
/// Compare direct member lookups against coalesced ones.
struct Args {
    /// YAML coalescer config. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Member lookups issued per strategy.
    #[arg(long, default_value_t = 20)]
    calls: i64,
}

#[derive(Debug, Clone)]
struct Member {
    id: i64,
    name: String,
    token: String,
}

type Members = HashMap<i64, Member>;

/// Simulated member store: fixed per-call overhead plus a small cost per id.
async fn batch_get_member(ids: Vec<i64>) -> anyhow::Result<Members> {
    let per_item = Duration::from_micros(100);
    tokio::time::sleep(Duration::from_millis(10) + per_item * ids.len() as u32).await;

    Ok(ids
        .into_iter()
        .map(|id| {
            let member = Member {
                id,
                name: format!("member-{id}"),
                token: Uuid::new_v4().simple().to_string(),
            };
            (id, member)
        })
        .collect())
}

async fn get_member(id: i64) -> anyhow::Result<Option<Member>> {
    Ok(batch_get_member(vec![id]).await?.remove(&id))
}

async fn get_member_coalesced(
    engine: &Engine<i64, Members>,
    id: i64,
) -> Result<Option<Member>, CoalesceError> {
    engine
        .call("GetMember", id, |members, id| members.get(id).cloned())
        .await
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("read config {}", path.display()))?;
            CoalescerConfig::from_yaml_bytes(&bytes)
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => CoalescerConfig::default(),
    };
    tracing::info!(
        window_size = cfg.window_size,
        window_timeout_ms = cfg.window_timeout_ms,
        calls = args.calls,
        "starting"
    );

    let invocations = Arc::new(AtomicUsize::new(0));
    let engine = Engine::<i64, Members>::configure(cfg)?;
    {
        let invocations = Arc::clone(&invocations);
        engine.register(
            "BatchGetMember",
            executor_fn(move |ids: Vec<i64>| {
                invocations.fetch_add(1, Ordering::Relaxed);
                batch_get_member(ids)
            }),
        );
    }
    engine.start()?;

    let started = Instant::now();
    for id in 1..=args.calls {
        get_member(id).await?;
    }
    tracing::info!(
        strategy = "one_by_one",
        elapsed_ms = elapsed_ms(started),
        "done"
    );

    let started = Instant::now();
    for res in join_all((1..=args.calls).map(|id| tokio::spawn(get_member(id)))).await {
        res??;
    }
    tracing::info!(
        strategy = "concurrent",
        elapsed_ms = elapsed_ms(started),
        "done"
    );

    let started = Instant::now();
    let lookups = (1..=args.calls).map(|id| {
        let engine = engine.clone();
        tokio::spawn(async move { get_member_coalesced(&engine, id).await })
    });
    let mut sample = None;
    for res in join_all(lookups).await {
        if let Some(member) = res?? {
            sample.get_or_insert(member);
        }
    }
    tracing::info!(
        strategy = "coalesced",
        elapsed_ms = elapsed_ms(started),
        executor_invocations = invocations.load(Ordering::Relaxed),
        "done"
    );
    if let Some(member) = sample {
        tracing::info!(
            id = member.id,
            name = %member.name,
            token = %member.token,
            "sample member"
        );
    }

    engine.shutdown().await;
    Ok(())
}
