mod commands;
mod render;

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use huddle_client::{ClientConfig, RealtimeClient, RestSource};
use huddle_feed::{ChannelFeed, FeedConfig, FeedError, FeedSources};

use crate::commands::{Command, HELP};
use crate::render::Renderer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so they do not interleave with the transcript
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "huddle=debug".into()),
        )
        .init();

    // Config
    let client_config = ClientConfig::from_env().context("backend configuration")?;
    let feed_config = FeedConfig::from_env().context("feed configuration")?;
    let channel = std::env::var("HUDDLE_CHANNEL").unwrap_or_else(|_| "general".into());

    // Backend adapters
    let rest = Arc::new(RestSource::new(client_config.clone())?);
    let realtime = Arc::new(
        RealtimeClient::connect(&client_config)
            .await
            .context("realtime connection")?,
    );

    let feed = ChannelFeed::new(
        feed_config,
        FeedSources {
            messages: rest.clone(),
            realtime,
            identity: rest,
        },
    );
    let sweeper = feed.spawn_sweeper();

    let mut snapshots = feed.snapshots();
    let mut notices = feed.notices();
    let mut renderer = Renderer::default();

    info!(channel = %channel, "Opening channel");
    if let Err(e) = feed.activate(&channel).await {
        warn!(channel = %channel, "Initial load failed: {}", e);
    }
    for line in renderer.update(&snapshots.borrow_and_update()) {
        println!("{}", line);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => run(&feed, command).await,
                    Ok(None) => {}
                    Err(usage) => eprintln!("{}", usage),
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                for line in renderer.update(&snapshots.borrow_and_update()) {
                    println!("{}", line);
                }
            }
            notice = notices.recv() => {
                match notice {
                    Ok(notice) => eprintln!("! {}", notice),
                    Err(RecvError::Lagged(n)) => warn!("Missed {} notices", n),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    feed.deactivate().await;
    sweeper.abort();
    info!("Bye");
    Ok(())
}

/// Execute a prompt command. Failures are reported through feed notices, so
/// only outcomes without one are printed here.
async fn run(feed: &ChannelFeed, command: Command) {
    let result = match command {
        Command::Say(text) => feed.send_message(&text, None).await.map(|_| ()),
        Command::Reply { parent_id, text } => feed.send_reply(&parent_id, &text, None).await.map(|_| ()),
        Command::React { message_id, emoji } => feed.toggle_reaction(&message_id, &emoji).await.map(|_| ()),
        Command::Join(channel) => feed.activate(&channel).await,
        Command::Refresh => feed.force_refresh().await,
        Command::Help => {
            println!("{}", HELP);
            Ok(())
        }
        Command::Quit => Ok(()),
    };

    match result {
        Err(FeedError::NoActiveChannel) => eprintln!("! no channel is open, use /join <channel>"),
        Err(FeedError::Superseded(channel)) => info!(channel = %channel, "Switched away before load finished"),
        _ => {}
    }
}
