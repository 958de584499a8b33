// Keyboard button box: P pause, E emergency stop, H reset heading, M cycle mode, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use serde_json::json;
use soccerbot_runtime::config::TOPIC_BUTTON;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_BUTTON).await?;

    info!("Controls: P=pause, E=emergency stop, H=reset heading, M=cycle mode, Q=quit");

    enable_raw_mode()?;
    let result = run_buttons(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_buttons(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }

        let action = match code {
            KeyCode::Char('p') => "pause",
            KeyCode::Char('e') | KeyCode::Char(' ') => "emergency_stop",
            KeyCode::Char('h') => "reset_heading",
            KeyCode::Char('m') => "cycle_mode",
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let press = json!({ "action": action, "timestamp": timestamp });
        publisher.put(press.to_string()).await?;
        info!("Sent {}", action);
    }

    Ok(())
}
