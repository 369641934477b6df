//! Per-connection execution state machine.
//!
//! ```text
//! Received -> (unknown token) AwaitingConfirm -> Approved | Rejected
//! Approved -> Preparing -> Building (optional) -> Running -> Done
//! any phase -> Failed(kind)
//! ```

use crate::error::{ExecError, FailureKind};
use crate::languages::LanguageHandler;
use crate::process::run_step;
use crate::protocol::{ExecutionRequest, FrameSink, OutputFrame};
use crate::state::AppState;
use crate::workspace::Workspace;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    AwaitingConfirm,
    Approved,
    Rejected,
    Preparing,
    Building,
    Running,
    Done,
    Failed(FailureKind),
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Rejected | Phase::Failed(_))
    }
}

pub struct ExecutionSession {
    connection_id: u64,
    phase: Phase,
    started: Instant,
    state: AppState,
}

impl ExecutionSession {
    pub fn new(connection_id: u64, state: AppState) -> Self {
        Self {
            connection_id,
            phase: Phase::Received,
            started: Instant::now(),
            state,
        }
    }

    /// Handle the single inbound message of a connection, sending frames to
    /// `frames` as they are produced. Returns the terminal phase.
    ///
    /// Dropping the returned future mid-flight kills any running step and
    /// removes a server-created workspace.
    pub async fn execute(&mut self, message: &str, frames: mpsc::Sender<OutputFrame>) -> Phase {
        let mut sink = FrameSink::new(frames);
        let result = self.drive(message, &mut sink).await;

        let terminal = match result {
            Ok(()) => Phase::Done,
            Err(ExecError::Disconnected) => Phase::Failed(FailureKind::Disconnected),
            Err(err) => {
                // A disconnect here leaves nothing else to do.
                let _ = sink.send(OutputFrame::error(&err)).await;
                match err {
                    ExecError::Rejected => Phase::Rejected,
                    other => Phase::Failed(other.kind()),
                }
            }
        };
        self.enter(terminal);

        if !sink.errors().is_empty() {
            debug!(connection_id = self.connection_id, errors = sink.errors(), "Session stderr");
        }
        info!(
            connection_id = self.connection_id,
            phase = ?self.phase,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Session finished"
        );
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug_assert!(!self.phase.is_terminal(), "session already ended in {:?}", self.phase);
        debug!(connection_id = self.connection_id, from = ?self.phase, to = ?phase, "Phase transition");
        self.phase = phase;
    }

    async fn drive(&mut self, message: &str, sink: &mut FrameSink) -> Result<(), ExecError> {
        let request = ExecutionRequest::parse(message)?;
        info!(
            connection_id = self.connection_id,
            language = %request.language,
            custom_dir = request.custom_dir.is_some(),
            "Execution requested"
        );

        let trust = self.state.trust.clone();
        if !trust.is_approved(&request.token) {
            self.enter(Phase::AwaitingConfirm);
            if !trust.authorize(&request.token).await {
                return Err(ExecError::Rejected);
            }
        }
        self.enter(Phase::Approved);

        let handler = self
            .state
            .handlers
            .get(&request.language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(request.language.clone()))?;

        self.enter(Phase::Preparing);
        let workspace = match &request.custom_dir {
            Some(dir) => Workspace::adopt(dir).await?,
            None => Workspace::create(&self.state.config.workspace_root).await?,
        };

        let supervisor = self.state.supervisor();
        let result = supervisor
            .supervise(self.build_and_run(handler.as_ref(), &workspace, &request, sink))
            .await;
        workspace.release().await;
        result
    }

    async fn build_and_run(
        &mut self,
        handler: &dyn LanguageHandler,
        workspace: &Workspace,
        request: &ExecutionRequest,
        sink: &mut FrameSink,
    ) -> Result<(), ExecError> {
        let dir = workspace.path();
        workspace
            .write_source(handler.source_file_name(), &request.code)
            .await?;

        if let Some(build) = handler.build_command(dir) {
            self.enter(Phase::Building);
            let build = build.with_extra(&request.compile_args);
            run_step(&build, dir, sink, ExecError::Build).await?;
        }

        self.enter(Phase::Running);
        let run = handler.run_command(dir).with_extra(&request.run_args);
        let started = Instant::now();
        run_step(&run, dir, sink, ExecError::Run).await?;
        let elapsed = started.elapsed();

        sink.send(OutputFrame::timing(elapsed)).await
    }
}
