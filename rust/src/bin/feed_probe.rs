use std::sync::Arc;
use std::time::{Duration, Instant};

use supachat_core::{AppAction, AppReconciler, AppUpdate, ChatApp, ViewState};

const USAGE: &str = "usage: feed_probe <email> <password> [--data-dir DIR] [--send TEXT] [--secs N]
  env: SUPACHAT_URL, SUPACHAT_API_KEY";

struct Printer;

impl AppReconciler for Printer {
    fn reconcile(&self, update: AppUpdate) {
        let AppUpdate::FullState(state) = update;
        eprintln!(
            "rev={} view={:?} busy={:?} feed={} notice={:?}",
            state.rev,
            state.view,
            state.busy,
            state.feed.len(),
            state.notice.as_ref().map(|n| n.message.as_str()),
        );
        if let Some(last) = state.feed.last() {
            eprintln!(
                "  last: #{} {} ({}) {:?}",
                last.id, last.display_name, last.initials, last.content
            );
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let url = std::env::var("SUPACHAT_URL").map_err(|_| anyhow::anyhow!("SUPACHAT_URL not set"))?;
    let api_key =
        std::env::var("SUPACHAT_API_KEY").map_err(|_| anyhow::anyhow!("SUPACHAT_API_KEY not set"))?;

    let mut args = std::env::args().skip(1);
    let email = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?;
    let password = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?;
    let mut data_dir = std::env::temp_dir()
        .join("supachat-probe")
        .to_string_lossy()
        .into_owned();
    let mut send: Option<String> = None;
    let mut secs: u64 = 15;
    while let Some(a) = args.next() {
        match a.as_str() {
            "--data-dir" => {
                data_dir = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--data-dir requires a path"))?;
            }
            "--send" => {
                send = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--send requires text"))?,
                );
            }
            "--secs" => {
                let n = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--secs requires a number"))?;
                secs = n.parse()?;
            }
            _ => return Err(anyhow::anyhow!("unknown arg: {a}\n{USAGE}")),
        }
    }
    std::fs::create_dir_all(&data_dir)?;

    let app: Arc<ChatApp> = ChatApp::new(url, api_key, data_dir)?;
    app.listen_for_updates(Box::new(Printer));

    // Give a stored session the chance to resume before signing in.
    let started = Instant::now();
    while app.state().view == ViewState::Loading && started.elapsed() < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(50));
    }
    if app.state().view != ViewState::Chat {
        app.dispatch(AppAction::SignIn { email, password });
    }

    let deadline = Instant::now() + Duration::from_secs(secs);
    let mut sent = false;
    while Instant::now() < deadline {
        let state = app.state();
        if state.view == ViewState::Chat && !state.busy.loading_feed && !sent {
            if let Some(text) = send.take() {
                app.dispatch(AppAction::SendMessage { content: text });
            }
            sent = true;
        }
        if state.view != ViewState::Chat && !state.busy.signing_in {
            if let Some(notice) = state.notice {
                anyhow::bail!("sign-in failed: {}", notice.message);
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let state = app.state();
    eprintln!("final: view={:?} feed={}", state.view, state.feed.len());
    app.close();
    Ok(())
}
