use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use toiletime_lib::{
    config::AppConfig,
    models::{ActivityName, ApplicationToken, CategoryToken, MonitorEvent, RestrictionSet},
    platform::TokioNotifier,
    timer::{format_remaining, CountdownEvent},
    unlock::{SchedulerEvent, UnlockPath, UnlockTicket},
    AppState,
};

fn open() -> Result<AppState> {
    AppState::open(AppConfig::load()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn pick(apps: Vec<String>, categories: Vec<String>) -> Result<()> {
    let app = open()?;
    let set = RestrictionSet::new(
        apps.into_iter().map(ApplicationToken::new),
        categories.into_iter().map(CategoryToken::new),
    );
    let outcome = app.selection().commit(set).await?;
    print_json(&outcome)
}

pub async fn status() -> Result<()> {
    let app = open()?;
    print_json(&app.status().await?)
}

pub async fn unlock(minutes: u32, detach: bool) -> Result<()> {
    let app = open()?;

    let relock = app.scheduler.subscribe();

    if detach {
        let ticket = app.request_unlock(minutes).await?;
        print_json(&ticket)?;
        return hold_for_fallback(&ticket, relock).await;
    }

    let confirmed = app.confirm_unlock(minutes).await?;
    let countdown = app.countdown(Arc::new(TokioNotifier::new()));
    let mut events = countdown.subscribe();
    let ticket = countdown.start_for(confirmed.duration).await?;
    print_json(&ticket)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                countdown.teardown().await;
                println!("Countdown left; the window stays open until {}", ticket.window.ends_at);
                return hold_for_fallback(&ticket, relock).await;
            }
            event = events.recv() => match event {
                Ok(CountdownEvent::Tick { remaining_secs }) => println!("{}", format_remaining(remaining_secs)),
                Ok(CountdownEvent::Relocked(set)) => {
                    println!(
                        "Re-locked {} apps, {} categories",
                        set.applications.len(),
                        set.categories.len()
                    );
                }
                Ok(CountdownEvent::Finished) => {
                    println!("Time's up!");
                    countdown.teardown().await;
                    return Ok(());
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Nothing outside this process re-locks a fallback window, so stay up
/// until the timer fires.
async fn hold_for_fallback(
    ticket: &UnlockTicket,
    mut relock: tokio::sync::broadcast::Receiver<SchedulerEvent>,
) -> Result<()> {
    if !matches!(ticket.path, UnlockPath::Fallback(_)) {
        return Ok(());
    }
    println!("Staying up to re-lock at {}", ticket.window.ends_at);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Leaving early; run `monitord` or relaunch before {} to re-lock", ticket.window.ends_at);
                return Ok(());
            }
            event = relock.recv() => match event {
                Ok(SchedulerEvent::FallbackFired { relocked }) => {
                    println!(
                        "Re-locked {} apps, {} categories",
                        relocked.applications.len(),
                        relocked.categories.len()
                    );
                    return Ok(());
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

pub async fn cancel() -> Result<()> {
    let app = open()?;
    let set = app.scheduler.cancel().await?;
    print_json(&set)
}

pub async fn monitor(event: &str, activity: &str) -> Result<()> {
    let app = open()?;
    let event: MonitorEvent = event.parse()?;
    let action = app.monitor.handle(event, &ActivityName::new(activity)).await?;
    print_json(&action)
}

pub async fn monitord() -> Result<()> {
    let app = open()?;
    let cancel = CancellationToken::new();
    let dispatcher = app.dispatcher();

    let token = cancel.clone();
    let worker = tokio::spawn(async move { dispatcher.run(token).await });

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    worker.await?;
    Ok(())
}

pub async fn reconcile() -> Result<()> {
    let app = open()?;
    print_json(&app.restore_on_launch().await?)
}
