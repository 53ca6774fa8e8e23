use std::sync::Arc;
use std::time::Duration;

use domshell_browser::CdpControl;
use domshell_core::{Config, Paths};
use domshell_gateway::server::ServerState;
use domshell_gateway::{ConfirmRequest, Gateway};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn run(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = Config::load_or_default(&paths)?;

    let host = host.unwrap_or_else(|| config.gateway.host.clone());
    let port = port.unwrap_or(config.gateway.port);

    let token = match config.gateway.auth_token.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => {
            let generated = uuid::Uuid::new_v4().simple().to_string();
            eprintln!("No gateway.authToken configured; using a temporary token for this run:");
            eprintln!("  {}", generated);
            generated
        }
    };

    let control = CdpControl::new(config.browser.clone());
    let supervisor = control.spawn_supervisor();

    let (confirm_tx, confirm_rx) = mpsc::channel::<ConfirmRequest>(8);
    let confirm_timeout = Duration::from_secs(config.gateway.confirm_timeout_secs.max(1));
    let confirm_handle = tokio::spawn(confirm_from_terminal(confirm_rx, confirm_timeout));

    let gateway = Arc::new(Gateway::new(&config, paths.clone(), control, Some(confirm_tx)));
    let policy = gateway.policy();
    info!(
        allow_write = policy.allow_write,
        allow_sensitive = policy.allow_sensitive,
        confirmation = !policy.disable_confirmation,
        domains = ?policy.allowed_domains,
        "Gateway policy"
    );
    if !policy.allow_write {
        info!("Write and navigate commands are disabled; set gateway.allowWrite to enable them");
    }

    let state = ServerState { gateway, token };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("Shutting down gateway");
    };
    domshell_gateway::serve(state, &host, port, shutdown).await?;

    supervisor.abort();
    confirm_handle.abort();
    Ok(())
}

/// Prompt on the terminal for each confirmation request. Lines typed while
/// no prompt is open are discarded so a stale answer never approves the next
/// command.
async fn confirm_from_terminal(mut confirm_rx: mpsc::Receiver<ConfirmRequest>, timeout: Duration) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(request) = confirm_rx.recv().await {
        while line_rx.try_recv().is_ok() {}

        eprintln!();
        eprintln!(
            "⚠️  Session {} wants to run a {} command:",
            short_id(&request.session_id),
            request.tier
        );
        eprintln!("   {}", request.command);
        eprint!("Allow? [y/N] ");
        let _ = std::io::Write::flush(&mut std::io::stderr());

        let allowed = match tokio::time::timeout(timeout, line_rx.recv()).await {
            Ok(Some(answer)) => {
                let answer = answer.trim().to_lowercase();
                answer == "y" || answer == "yes"
            }
            Ok(None) => false,
            Err(_) => {
                eprintln!();
                eprintln!("(no answer, denied)");
                false
            }
        };
        if allowed {
            eprintln!("✅ Allowed");
        } else {
            eprintln!("❌ Denied");
        }
        let _ = request.response_tx.send(allowed);
    }
}

fn short_id(id: &str) -> &str {
    domshell_core::safe_truncate(id, 8)
}
