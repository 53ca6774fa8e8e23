//! Remote command gateway: policy checks, confirmation, audit and the
//! JSON-RPC server in front of per-session navigation kernels.

pub mod confirm;
pub mod dispatcher;
pub mod policy;
pub mod server;
pub mod tier;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use domshell_core::{Config, DomControl, Error, Paths};
use domshell_shell::{Command, Reply};
use domshell_storage::{AuditDecision, AuditLogger};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use confirm::{ConfirmRequest, Confirmation};
pub use dispatcher::Dispatcher;
pub use policy::Policy;
pub use server::{build_router, serve};
pub use tier::SecurityTier;

pub struct Gateway {
    policy: RwLock<Arc<Policy>>,
    dispatcher: Dispatcher,
    audit: Mutex<AuditLogger>,
    confirm_tx: Option<mpsc::Sender<ConfirmRequest>>,
    sessions: RwLock<HashSet<String>>,
}

impl Gateway {
    /// Must be called inside a tokio runtime; spawns the dispatcher worker.
    pub fn new(
        config: &Config,
        paths: Paths,
        control: Arc<dyn DomControl>,
        confirm_tx: Option<mpsc::Sender<ConfirmRequest>>,
    ) -> Self {
        Self {
            policy: RwLock::new(Arc::new(Policy::from_config(&config.gateway))),
            dispatcher: Dispatcher::spawn(control),
            audit: Mutex::new(AuditLogger::new(paths, config.audit_destination())),
            confirm_tx,
            sessions: RwLock::new(HashSet::new()),
        }
    }

    pub fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone());
        info!(session = %id, "Remote session created");
        id
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    pub async fn close_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        if removed {
            self.dispatcher.close(session_id).await;
            info!(session = %session_id, "Remote session closed");
        }
        removed
    }

    pub fn policy(&self) -> Arc<Policy> {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Settings-changed notification: later invocations see the new flags.
    pub fn apply_settings(&self, config: &Config) {
        let policy = Arc::new(Policy::from_config(&config.gateway));
        info!(
            allow_write = policy.allow_write,
            allow_sensitive = policy.allow_sensitive,
            disable_confirmation = policy.disable_confirmation,
            domains = policy.allowed_domains.len(),
            "Gateway policy updated"
        );
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Run one remote command line for `session_id` through every policy
    /// gate. Rejections and failures come back as error replies.
    pub async fn invoke(&self, session_id: &str, line: &str) -> Reply {
        let correlation_id = Uuid::new_v4().to_string();
        let line = line.trim();
        let policy = self.policy();

        let command = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                let verb = line.split_whitespace().next().unwrap_or("shell");
                let reply = Reply::error(verb, &e);
                self.audit(session_id, &correlation_id, line, "none", AuditDecision::Error, &reply.text)
                    .await;
                return reply;
            }
        };
        let verb = command.verb();
        let tier = SecurityTier::for_command(&command);

        if let Err(e) = policy.check_tier(tier) {
            info!(session = %session_id, verb, tier = %tier, "Denied by tier");
            return self
                .reject(session_id, &correlation_id, line, tier, AuditDecision::DeniedTier, verb, e)
                .await;
        }

        if policy.restricts_domains() {
            match self.check_domain(&policy, session_id, &command).await {
                Ok(()) => {}
                Err(e @ Error::DomainNotAllowed(_)) => {
                    info!(session = %session_id, verb, error = %e, "Denied by domain allowlist");
                    return self
                        .reject(session_id, &correlation_id, line, tier, AuditDecision::DeniedDomain, verb, e)
                        .await;
                }
                Err(e) => {
                    debug!(session = %session_id, verb, error = %e, "Target page unavailable");
                    let decision = match e {
                        Error::CommandTimeout(_) => AuditDecision::Timeout,
                        _ => AuditDecision::Error,
                    };
                    return self
                        .reject(session_id, &correlation_id, line, tier, decision, verb, e)
                        .await;
                }
            }
        }

        if policy.needs_confirmation(tier) {
            let outcome = confirm::ask(
                self.confirm_tx.as_ref(),
                session_id,
                line,
                tier,
                policy.confirm_timeout,
            )
            .await;
            let reason = match outcome {
                Confirmation::Approved => None,
                Confirmation::Denied => Some("declined".to_string()),
                Confirmation::TimedOut => Some(format!(
                    "no answer within {}s",
                    policy.confirm_timeout.as_secs()
                )),
            };
            if let Some(reason) = reason {
                info!(session = %session_id, verb, reason = %reason, "Denied by confirmation");
                return self
                    .reject(
                        session_id,
                        &correlation_id,
                        line,
                        tier,
                        AuditDecision::DeniedConfirm,
                        verb,
                        Error::UserDenied(reason),
                    )
                    .await;
            }
        }

        let reply = match self
            .dispatcher
            .submit(session_id, &correlation_id, command, policy.command_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e @ Error::CommandTimeout(_)) => {
                let reply = Reply::error(verb, &e);
                self.audit(session_id, &correlation_id, line, tier.as_str(), AuditDecision::Timeout, &reply.text)
                    .await;
                return reply;
            }
            Err(e) => Reply::error(verb, &e),
        };

        let reply = if policy.should_redact(tier) {
            Reply {
                text: crate::policy::redact_sensitive(&reply.text),
                is_error: reply.is_error,
            }
        } else {
            reply
        };

        let decision = if reply.is_error {
            AuditDecision::Error
        } else {
            AuditDecision::Execute
        };
        self.audit(session_id, &correlation_id, line, tier.as_str(), decision, &reply.text)
            .await;
        reply
    }

    /// Judge the page the command would act on: the destination of
    /// `navigate`, `open` and tab-entering `cd`, else the current page.
    /// Commands that touch no page pass. Lookup failures are returned as is.
    async fn check_domain(&self, policy: &Policy, session_id: &str, command: &Command) -> Result<(), Error> {
        match self
            .dispatcher
            .page_url(session_id, command, policy.command_timeout)
            .await?
        {
            Some(url) if !policy.domain_allowed(&url) => Err(Error::DomainNotAllowed(url)),
            _ => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn reject(
        &self,
        session_id: &str,
        correlation_id: &str,
        line: &str,
        tier: SecurityTier,
        decision: AuditDecision,
        verb: &str,
        err: Error,
    ) -> Reply {
        let reply = Reply::error(verb, &err);
        self.audit(session_id, correlation_id, line, tier.as_str(), decision, &reply.text)
            .await;
        reply
    }

    async fn audit(
        &self,
        session_id: &str,
        correlation_id: &str,
        line: &str,
        tier: &str,
        decision: AuditDecision,
        summary: &str,
    ) {
        let mut logger = self.audit.lock().await;
        if let Err(e) = logger.record(session_id, correlation_id, line, tier, decision, summary) {
            warn!(error = %e, "Failed to write audit record");
        }
    }

    /// Records of the audit file currently being written.
    pub async fn audit_records(&self) -> domshell_core::Result<Vec<domshell_storage::AuditRecord>> {
        self.audit.lock().await.read_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domshell_core::AxNode;
    use domshell_shell::mock::{MockControl, MockPage};
    use tempfile::TempDir;

    fn nodes() -> Vec<AxNode> {
        vec![
            AxNode::new("1", "RootWebArea")
                .with_name("Example")
                .with_children(["2", "3"])
                .with_backend(1),
            AxNode::new("2", "navigation").with_name("Nav").with_children(["4"]),
            AxNode::new("4", "link").with_name("Home").with_backend(40),
            AxNode::new("3", "button").with_name("Submit").with_backend(50),
        ]
    }

    fn control() -> Arc<MockControl> {
        Arc::new(
            MockControl::new().with_tab(
                7,
                1,
                MockPage::new("Example", "https://example.com/", nodes())
                    .with_cookie("sessionid", "abc123secret")
                    .with_cookie("theme", "dark"),
            ),
        )
    }

    fn config(dir: &TempDir, edit: impl FnOnce(&mut Config)) -> Config {
        let mut config = Config::default();
        config.gateway.audit_log = Some(dir.path().join("audit.jsonl").display().to_string());
        edit(&mut config);
        config
    }

    fn gateway(
        dir: &TempDir,
        control: Arc<MockControl>,
        confirm_tx: Option<mpsc::Sender<ConfirmRequest>>,
        edit: impl FnOnce(&mut Config),
    ) -> Gateway {
        let config = config(dir, edit);
        Gateway::new(
            &config,
            Paths::with_base(dir.path().to_path_buf()),
            control,
            confirm_tx,
        )
    }

    fn auto_confirm(answer: bool) -> mpsc::Sender<ConfirmRequest> {
        let (tx, mut rx) = mpsc::channel::<ConfirmRequest>(4);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.response_tx.send(answer);
            }
        });
        tx
    }

    #[tokio::test]
    async fn test_write_disabled_never_reaches_kernel() {
        let dir = TempDir::new().unwrap();
        let control = control();
        let gw = gateway(&dir, control.clone(), None, |_| {});
        let session = gw.create_session();

        assert!(!gw.invoke(&session, "cd tabs/7").await.is_error);
        control.clear_calls();

        for line in ["click submit_btn", "focus submit_btn", "type submit_btn hi", "navigate example.org"] {
            let reply = gw.invoke(&session, line).await;
            assert!(reply.is_error);
            assert!(reply.text.contains("allowWrite"), "{}", reply.text);
        }
        assert!(control.calls().is_empty());

        let records = gw.audit_records().await.unwrap();
        let denied: Vec<_> = records.iter().filter(|r| r.command.starts_with("click")).collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].decision, AuditDecision::DeniedTier);
        assert!(!records
            .iter()
            .any(|r| r.decision == AuditDecision::Execute && r.tier == "write"));
    }

    #[tokio::test]
    async fn test_confirmed_write_executes() {
        let dir = TempDir::new().unwrap();
        let control = control();
        let gw = gateway(&dir, control.clone(), Some(auto_confirm(true)), |c| {
            c.gateway.allow_write = true;
        });
        let session = gw.create_session();
        gw.invoke(&session, "cd tabs/7").await;

        let reply = gw.invoke(&session, "click submit_btn").await;
        assert!(!reply.is_error, "{}", reply.text);
        assert!(reply.text.starts_with("clicked submit_btn"));
        assert!(control.calls().contains(&"click 50".to_string()));

        let records = gw.audit_records().await.unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.decision, AuditDecision::Execute);
        assert_eq!(last.tier, "write");
    }

    #[tokio::test]
    async fn test_declined_and_unanswered_confirmation() {
        let dir = TempDir::new().unwrap();
        let control = control();
        let gw = gateway(&dir, control.clone(), Some(auto_confirm(false)), |c| {
            c.gateway.allow_write = true;
        });
        let session = gw.create_session();
        gw.invoke(&session, "cd tabs/7").await;
        control.clear_calls();

        let reply = gw.invoke(&session, "click submit_btn").await;
        assert!(reply.is_error);
        assert!(reply.text.contains("denied by user"));
        assert!(control.calls().is_empty());

        // a prompt nobody answers
        let (tx, mut rx) = mpsc::channel::<ConfirmRequest>(4);
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(req) = rx.recv().await {
                held.push(req);
            }
        });
        let gw = gateway(&dir, control.clone(), Some(tx), |c| {
            c.gateway.allow_write = true;
            c.gateway.confirm_timeout_secs = 1;
        });
        let session = gw.create_session();
        let reply = gw.invoke(&session, "click submit_btn").await;
        assert!(reply.text.contains("no answer within 1s"), "{}", reply.text);
        holder.abort();

        let records = gw.audit_records().await.unwrap();
        assert!(records
            .iter()
            .filter(|r| r.command == "click submit_btn")
            .all(|r| r.decision == AuditDecision::DeniedConfirm));
    }

    #[tokio::test]
    async fn test_sensitive_results_are_redacted() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir, control(), None, |c| {
            c.gateway.allow_sensitive = true;
        });
        let session = gw.create_session();
        gw.invoke(&session, "cd tabs/7").await;

        let reply = gw.invoke(&session, "cookies").await;
        assert!(!reply.is_error, "{}", reply.text);
        assert!(!reply.text.contains("abc123secret"));
        assert!(reply.text.contains("sessionid=[REDACTED]"));

        let records = gw.audit_records().await.unwrap();
        assert!(records.iter().all(|r| !r.summary.contains("abc123secret")));

        let mut exposed = config(&dir, |c| c.gateway.allow_sensitive = true);
        exposed.gateway.expose_sensitive = true;
        gw.apply_settings(&exposed);
        assert!(gw.invoke(&session, "cookies").await.text.contains("abc123secret"));
    }

    fn two_site_control() -> Arc<MockControl> {
        Arc::new(
            MockControl::new()
                .with_tab(7, 1, MockPage::new("Evil", "https://evil.test/", nodes()))
                .with_tab(8, 1, MockPage::new("Docs", "https://docs.rs/", nodes())),
        )
    }

    #[tokio::test]
    async fn test_domain_allowlist_judges_cd_by_destination() {
        let dir = TempDir::new().unwrap();
        let control = two_site_control();
        let gw = gateway(&dir, control.clone(), None, |c| {
            c.gateway.allow_write = true;
            c.gateway.disable_confirmation = true;
            c.gateway.allowed_domains = "docs.rs".into();
        });
        let session = gw.create_session();

        let reply = gw.invoke(&session, "cd tabs/7").await;
        assert!(reply.text.contains("domain not allowed: https://evil.test/"), "{}", reply.text);
        assert!(!control.calls().iter().any(|c| c.starts_with("attach")));
        assert_eq!(gw.invoke(&session, "pwd").await.text, "~");

        let reply = gw.invoke(&session, "cd tabs/8").await;
        assert!(!reply.is_error, "{}", reply.text);
        assert!(!gw.invoke(&session, "ls").await.is_error);
        assert!(gw.invoke(&session, "cd ../7").await.is_error);

        let reply = gw.invoke(&session, "navigate evil.test").await;
        assert!(reply.text.contains("domain not allowed: https://evil.test"));
        assert!(!control.calls().iter().any(|c| c.starts_with("navigate")));

        let records = gw.audit_records().await.unwrap();
        assert_eq!(
            records.iter().filter(|r| r.decision == AuditDecision::DeniedDomain).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_leaving_a_disallowed_page_is_always_possible() {
        let dir = TempDir::new().unwrap();
        let control = two_site_control();
        let gw = gateway(&dir, control.clone(), None, |c| {
            c.gateway.allowed_domains = "docs.rs".into();
        });
        let session = gw.create_session();
        assert!(!gw.invoke(&session, "cd tabs/8").await.is_error);

        gw.apply_settings(&config(&dir, |c| c.gateway.allowed_domains = "example.org".into()));

        assert!(gw.invoke(&session, "ls").await.text.contains("domain not allowed"));
        for line in ["pwd", "help", "cd ..", "cd ~", "cd /tabs", "ls /tabs"] {
            let reply = gw.invoke(&session, line).await;
            assert!(!reply.is_error, "{}: {}", line, reply.text);
        }
        assert_eq!(gw.invoke(&session, "pwd").await.text, "~/tabs");
    }

    #[tokio::test]
    async fn test_domain_check_runs_before_confirmation() {
        let dir = TempDir::new().unwrap();
        let control = two_site_control();
        let (tx, mut rx) = mpsc::channel::<ConfirmRequest>(4);
        let prompts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = prompts.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _ = req.response_tx.send(true);
            }
        });
        let gw = gateway(&dir, control.clone(), Some(tx), |c| {
            c.gateway.allow_write = true;
            c.gateway.allowed_domains = "docs.rs".into();
        });
        let session = gw.create_session();
        gw.invoke(&session, "cd tabs/8").await;
        gw.apply_settings(&config(&dir, |c| {
            c.gateway.allow_write = true;
            c.gateway.allowed_domains = "example.org".into();
        }));

        let reply = gw.invoke(&session, "click submit_btn").await;
        assert!(reply.text.contains("domain not allowed: https://docs.rs/"), "{}", reply.text);
        assert_eq!(prompts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outage_reports_not_attached_under_allowlist() {
        let dir = TempDir::new().unwrap();
        let control = two_site_control();
        let gw = gateway(&dir, control.clone(), None, |c| {
            c.gateway.allowed_domains = "docs.rs".into();
        });
        let session = gw.create_session();
        gw.invoke(&session, "cd tabs/8").await;
        control.set_disconnected(true);

        let reply = gw.invoke(&session, "ls").await;
        assert_eq!(reply.text, "ls: not attached to a tab");
        let records = gw.audit_records().await.unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.decision, AuditDecision::Error);
    }

    #[tokio::test]
    async fn test_command_timeout_is_audited() {
        let dir = TempDir::new().unwrap();
        let control = control();
        control.set_attach_delay(std::time::Duration::from_millis(1500));
        let gw = gateway(&dir, control, None, |c| {
            c.gateway.command_timeout_secs = 1;
        });
        let session = gw.create_session();

        let reply = gw.invoke(&session, "cd tabs/7").await;
        assert!(reply.is_error);
        assert!(reply.text.contains("no result within 1s"), "{}", reply.text);

        let records = gw.audit_records().await.unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.decision, AuditDecision::Timeout);
        assert_eq!(last.command, "cd tabs/7");
    }

    #[tokio::test]
    async fn test_malformed_input_and_sessions() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir, control(), None, |_| {});
        let session = gw.create_session();
        assert!(gw.has_session(&session));

        let reply = gw.invoke(&session, "frobnicate now").await;
        assert!(reply.text.starts_with("frobnicate: malformed input"));
        let records = gw.audit_records().await.unwrap();
        assert_eq!(records[0].decision, AuditDecision::Error);
        assert_eq!(records[0].tier, "none");

        let other = gw.create_session();
        gw.invoke(&session, "cd tabs/7").await;
        assert_eq!(gw.invoke(&other, "pwd").await.text, "~");

        assert!(gw.close_session(&session).await);
        assert!(!gw.has_session(&session));
        assert!(!gw.close_session(&session).await);
    }
}
