//! Top-level scan entrypoint.
//!
//! Composes the relay, harness, tools, and compiler into one run that
//! always reaches a terminal status. The only terminal failure path is
//! report compilation: tool errors, relay hiccups, and budget exhaustion
//! all degrade into the compiler handoff instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compiler::{is_under_structured, ReportCompiler};
use crate::config::Config;
use crate::error::{CompilerError, ScanError};
use crate::gate::HumanGate;
use crate::harness::{HarnessResult, StreamingHarness, TurnLoopHarness};
use crate::llm::{create_provider, CompletionProvider};
use crate::model::{
    assign_finding_ids, ActionType, HarnessKind, Report, ScanSession, ScanStatus, ScanTarget,
};
use crate::relay::{push_text_or_log, ActionRelay, GateStore, ReportSink};
use crate::session::{OpenCodeClient, SessionControl};
use crate::tools::{Dispatcher, HttpBrowserBridge, SnapshotStore, Submission};

/// Most files listed in the system prompt's repository inventory.
const INVENTORY_MAX_FILES: usize = 100;

/// Runs scans against one durable store.
pub struct ScanRunner<S> {
    store: Arc<S>,
    config: Config,
    provider: Arc<dyn CompletionProvider>,
    session_control: Option<Arc<dyn SessionControl>>,
}

impl<S> ScanRunner<S>
where
    S: ActionRelay + ReportSink + GateStore + SnapshotStore + Send + Sync + 'static,
{
    /// Build a runner with real provider clients from the configuration.
    pub fn new(store: Arc<S>, config: Config) -> Result<Self, ScanError> {
        let provider = create_provider(&config.llm)?;
        Ok(Self::from_parts(store, config, provider))
    }

    /// Build a runner around an existing completion provider.
    pub fn from_parts(
        store: Arc<S>,
        config: Config,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            store,
            config,
            provider,
            session_control: None,
        }
    }

    /// Override the session control plane (tests and local runs).
    pub fn with_session_control(mut self, control: Arc<dyn SessionControl>) -> Self {
        self.session_control = Some(control);
        self
    }

    /// Run one scan to a terminal status.
    ///
    /// Returns the submitted report on success. On failure the session
    /// carries a short error string and the store has been told the scan
    /// failed; the error is returned for the caller's exit code.
    pub async fn run(&self, session: &mut ScanSession) -> Result<Report, ScanError> {
        self.set_status(&session.id, ScanStatus::Running, None).await;
        session.status = ScanStatus::Running;

        match self.drive(session).await {
            Ok(report) => {
                self.set_status(&session.id, ScanStatus::Completed, None).await;
                session.status = ScanStatus::Completed;
                tracing::info!(
                    scan_id = %session.id,
                    findings = report.findings.len(),
                    "scan completed"
                );
                Ok(report)
            }
            Err(e) => {
                let message = e.to_string();
                self.set_status(&session.id, ScanStatus::Failed, Some(&message))
                    .await;
                session.status = ScanStatus::Failed;
                session.error = Some(message);
                tracing::error!(scan_id = %session.id, error = %e, "scan failed");
                Err(e)
            }
        }
    }

    async fn drive(&self, session: &ScanSession) -> Result<Report, ScanError> {
        let snapshot_dir = self.snapshot_dir(&session.target)?;

        push_text_or_log(
            self.relay(),
            &session.id,
            ActionType::Observation,
            format!("Starting security scan of {}", session.target.describe()),
        )
        .await;

        let system = build_system_prompt(&session.target, snapshot_dir.as_deref());
        let task = build_task_prompt(&session.target);

        let result = match session.harness {
            HarnessKind::TurnLoop => {
                let dispatcher = self.build_dispatcher(session, snapshot_dir.clone());
                let harness = TurnLoopHarness::new(
                    self.provider.clone(),
                    dispatcher,
                    self.config.limits.clone(),
                );
                harness.run(self.relay(), &session.id, &system, &task).await
            }
            HarnessKind::Streaming => {
                let control = match &self.session_control {
                    Some(control) => control.clone(),
                    None => Arc::new(OpenCodeClient::new(self.config.session_api.clone())),
                };
                let harness = StreamingHarness::new(
                    control,
                    session.model.clone(),
                    self.config.session_api.subscribe_settle,
                    self.config.limits.clone(),
                );
                harness.run(self.relay(), &session.id, &system, &task).await
            }
        };

        match result {
            HarnessResult::Submitted(submission) if !is_under_structured(&submission) => {
                self.finalize(session, submission, snapshot_dir.as_deref())
                    .await
            }
            HarnessResult::Submitted(_) => {
                push_text_or_log(
                    self.relay(),
                    &session.id,
                    ActionType::Observation,
                    "Submission was prose without discrete findings; restructuring from the trace",
                )
                .await;
                self.compile(session, snapshot_dir).await
            }
            HarnessResult::NeedsCompilation { reason } => {
                push_text_or_log(
                    self.relay(),
                    &session.id,
                    ActionType::Observation,
                    format!("Compiling report from trace: {reason}"),
                )
                .await;
                self.compile(session, snapshot_dir).await
            }
        }
    }

    /// Accept a well-structured submission as the report.
    async fn finalize(
        &self,
        session: &ScanSession,
        submission: Submission,
        snapshot_dir: Option<&Path>,
    ) -> Result<Report, ScanError> {
        let mut findings = submission.findings;
        assign_finding_ids(&mut findings);
        if let Some(dir) = snapshot_dir {
            crate::compiler::backfill_snippets(&mut findings, dir).await;
        }

        let report = Report {
            scan_id: session.id.clone(),
            summary: submission.summary,
            findings,
        };
        self.submit(session, report).await
    }

    /// Rebuild a structured report from the relayed trace.
    async fn compile(
        &self,
        session: &ScanSession,
        snapshot_dir: Option<PathBuf>,
    ) -> Result<Report, ScanError> {
        let trace = self.store.list_all_actions(&session.id).await?;
        let compiler = ReportCompiler::new(self.provider.clone(), snapshot_dir);
        let report = compiler.compile(&session.id, &trace).await?;
        self.submit(session, report).await
    }

    async fn submit(&self, session: &ScanSession, report: Report) -> Result<Report, ScanError> {
        push_text_or_log(
            self.relay(),
            &session.id,
            ActionType::Observation,
            format!(
                "Submitting report with {} findings to the dashboard",
                report.findings.len()
            ),
        )
        .await;
        self.store
            .submit_report(&session.project_id, &report)
            .await
            .map_err(|e| ScanError::Compiler(CompilerError::Submit(e)))?;
        Ok(report)
    }

    fn build_dispatcher(&self, session: &ScanSession, snapshot_dir: Option<PathBuf>) -> Dispatcher {
        let gate = HumanGate::new(
            self.store.clone(),
            self.config.limits.gate_poll_interval,
            self.config.limits.gate_timeout,
        );
        let mut dispatcher = Dispatcher::new(&session.id, snapshot_dir, gate);

        let wants_browser = matches!(session.target, ScanTarget::WebApp { .. });
        if wants_browser && !self.config.browser.bridge_url.is_empty() {
            dispatcher = dispatcher.with_browser(
                Arc::new(HttpBrowserBridge::new(self.config.browser.clone())),
                self.store.clone(),
            );
        }
        dispatcher
    }

    /// Validated snapshot directory for codebase targets.
    fn snapshot_dir(&self, target: &ScanTarget) -> Result<Option<PathBuf>, ScanError> {
        let Some(dir) = target.snapshot_dir() else {
            return Ok(None);
        };
        let path = PathBuf::from(dir);
        if !path.is_dir() {
            return Err(ScanError::MissingSnapshot(dir.to_string()));
        }
        Ok(Some(path))
    }

    fn relay(&self) -> &dyn ActionRelay {
        self.store.as_ref()
    }

    async fn set_status(&self, scan_id: &str, status: ScanStatus, error: Option<&str>) {
        if let Err(e) = self.store.update_scan_status(scan_id, status, error).await {
            tracing::warn!(scan_id, ?status, error = %e, "status update failed, continuing");
        }
    }
}

/// System prompt for the audit, including a repository inventory for
/// codebase targets so the agent starts with a map instead of blind
/// directory probing.
pub fn build_system_prompt(target: &ScanTarget, snapshot_dir: Option<&Path>) -> String {
    let mut prompt = String::from(
        "You are an expert application security auditor performing an authorized \
         assessment. Work methodically: map the attack surface, then dig into \
         authentication, authorization, injection, sensitive data exposure, \
         secrets handling, insecure deserialization, SSRF, vulnerable \
         dependencies, and unsafe defaults. Report only vulnerabilities you can \
         support with concrete evidence from this target.",
    );

    match target {
        ScanTarget::Codebase { .. } => {
            prompt.push_str(
                "\n\nThe target is a codebase snapshot. Use read_file and search_code \
                 to examine it. Cite findings as path:start-end line ranges.",
            );
            if let Some(dir) = snapshot_dir {
                let files = file_inventory(dir, INVENTORY_MAX_FILES);
                if !files.is_empty() {
                    prompt.push_str("\n\nRepository files:\n");
                    for file in &files {
                        prompt.push_str(file);
                        prompt.push('\n');
                    }
                }
            }
        }
        ScanTarget::WebApp { url, credentials } => {
            prompt.push_str(&format!(
                "\n\nThe target is a live web application at {url}. Use the browser \
                 tools to explore it and http_probe for raw API requests. Stay within \
                 the target host."
            ));
            if let Some(creds) = credentials {
                prompt.push_str(&format!(
                    "\n\nTest credentials: username `{}`, password `{}`. Log in and \
                     audit the authenticated surface as well.",
                    creds.username, creds.password
                ));
            }
        }
    }

    prompt.push_str(
        "\n\nIf you need information only the human operator has, call ask_human. \
         When the audit is complete, call submit_findings exactly once with a \
         summary and every finding as a discrete entry.",
    );
    prompt
}

fn build_task_prompt(target: &ScanTarget) -> String {
    format!(
        "Begin the security audit of {} now. Investigate thoroughly before \
         concluding, and finish with submit_findings.",
        target.describe()
    )
}

/// Relative paths of up to `max` files under `dir`, sorted, skipping
/// hidden entries and vendored dependency trees.
pub fn file_inventory(dir: &Path, max: usize) -> Vec<String> {
    const SKIP_DIRS: &[&str] = &["node_modules", "target", "vendor", "dist", "__pycache__"];

    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                if !SKIP_DIRS.contains(&name.as_ref()) {
                    stack.push(path);
                }
            } else if let Ok(relative) = path.strip_prefix(dir) {
                files.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    files.sort();
    files.truncate(max);
    files
}
