//! Client side of a generation: one conversation, at most one live stream,
//! and the sandbox preview that follows a finished fragment.

pub mod client;
pub mod collaborators;
pub mod failure;
pub mod preview;
pub mod reconciler;

use std::sync::Arc;

use crate::dispatch::{LlmModel, LlmModelConfig};
use crate::error::KilnError;
use crate::fragment::{Fragment, SandboxResult};
use crate::gateway::GenerationRequest;
use crate::messages::{ContentPart, Message};
use crate::templates::{self, Templates};

use client::{SnapshotSource, SnapshotStream, StopHandle, StreamFrame};
use failure::ClientFailure;
use preview::PreviewOrchestrator;
use reconciler::{Conversation, PartialObjectReconciler, TurnBinding};

/// Who the session acts for. Forwarded to the gateway and the sandbox.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub access_token: Option<String>,
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("user_id", &self.user_id)
            .field("team_id", &self.team_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Result of consuming one stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Snapshot(TurnBinding),
    Failed(ClientFailure),
    Finished,
    Cancelled,
}

/// How the active stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(Fragment),
    Cancelled,
    Failed(ClientFailure),
    /// There was no stream to drive.
    Idle,
}

pub struct Session {
    source: Arc<dyn SnapshotSource>,
    preview: PreviewOrchestrator,
    identity: SessionIdentity,
    model: LlmModel,
    config: LlmModelConfig,
    templates: Templates,
    /// Chosen template id; `None` or "auto" offers every template.
    template_choice: Option<String>,
    conversation: Conversation,
    reconciler: PartialObjectReconciler,
    active: Option<SnapshotStream>,
    result: Option<SandboxResult>,
    failure: Option<ClientFailure>,
}

impl Session {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        preview: PreviewOrchestrator,
        model: LlmModel,
        config: LlmModelConfig,
    ) -> Self {
        Self {
            source,
            preview,
            identity: SessionIdentity::default(),
            model,
            config,
            templates: templates::builtin(),
            template_choice: None,
            conversation: Conversation::new(),
            reconciler: PartialObjectReconciler::new(),
            active: None,
            result: None,
            failure: None,
        }
    }

    pub fn with_identity(mut self, identity: SessionIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_templates(mut self, templates: Templates) -> Self {
        self.templates = templates;
        self
    }

    /// Restrict later requests to one template, or pass "auto"/`None` to
    /// let the model choose among all of them.
    pub fn choose_template(&mut self, id: Option<&str>) {
        self.template_choice = id.map(str::to_string);
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn fragment(&self) -> &Fragment {
        self.reconciler.fragment()
    }

    pub fn result(&self) -> Option<&SandboxResult> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&ClientFailure> {
        self.failure.as_ref()
    }

    pub fn preview(&self) -> &PreviewOrchestrator {
        &self.preview
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.active.as_ref().map(SnapshotStream::stop_handle)
    }

    /// Send a new user message. A stream still running is cancelled first.
    pub async fn submit(&mut self, content: Vec<ContentPart>) -> Result<(), KilnError> {
        self.stop();
        self.conversation.push(Message::user(content));
        self.open().await
    }

    /// Resend the current history without adding a message.
    pub async fn retry(&mut self) -> Result<(), KilnError> {
        self.stop();
        self.open().await
    }

    async fn open(&mut self) -> Result<(), KilnError> {
        self.failure = None;
        self.reconciler.reset();

        let req = GenerationRequest {
            messages: self.conversation.messages().to_vec(),
            user_id: self.identity.user_id.clone(),
            team_id: self.identity.team_id.clone(),
            template: templates::select(&self.templates, self.template_choice.as_deref()),
            model: self.model.clone(),
            config: self.config.clone(),
        };

        match self.source.open(&req).await {
            Ok(stream) => {
                self.active = Some(stream);
                Ok(())
            }
            Err(e) => {
                let failure = ClientFailure::from_error(&e);
                tracing::warn!(code = failure.code.as_str(), "generation request failed");
                self.failure = Some(failure);
                Err(e)
            }
        }
    }

    /// Cancel the active stream. Merged state stays as it is.
    pub fn stop(&mut self) -> bool {
        match self.active.take() {
            Some(stream) => {
                stream.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the last exchange and the current preview.
    pub fn undo(&mut self) {
        self.stop();
        self.conversation.drop_last_exchange();
        self.reconciler.reset();
        self.result = None;
        self.preview.reset();
    }

    pub fn clear(&mut self) {
        self.stop();
        self.conversation.clear();
        self.reconciler.reset();
        self.result = None;
        self.failure = None;
        self.preview.reset();
    }

    /// Consume one frame of the active stream. `None` when no stream is active.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        let stream = self.active.as_mut()?;
        let item = stream.next().await;
        // Nothing is applied once a stop was requested.
        if stream.is_cancelled() {
            self.active = None;
            return Some(SessionEvent::Cancelled);
        }

        match item {
            Some(Ok(StreamFrame::Snapshot(snapshot))) => Some(SessionEvent::Snapshot(
                self.reconciler.apply(&mut self.conversation, snapshot),
            )),
            Some(Ok(StreamFrame::Failed(failure))) => Some(self.fail(failure)),
            Some(Err(e)) => Some(self.fail(ClientFailure::from_error(&e))),
            None => {
                self.active = None;
                Some(SessionEvent::Finished)
            }
        }
    }

    fn fail(&mut self, failure: ClientFailure) -> SessionEvent {
        if let Some(stream) = self.active.take() {
            stream.cancel();
        }
        tracing::warn!(
            code = failure.code.as_str(),
            incident_id = failure.incident_id.as_deref().unwrap_or(""),
            "generation failed"
        );
        self.failure = Some(failure.clone());
        SessionEvent::Failed(failure)
    }

    /// Consume the active stream to its end.
    pub async fn drive(&mut self) -> StreamOutcome {
        if self.active.is_none() {
            return StreamOutcome::Idle;
        }
        loop {
            match self.next().await {
                Some(SessionEvent::Snapshot(_)) => continue,
                Some(SessionEvent::Finished) => {
                    return StreamOutcome::Completed(self.reconciler.fragment().clone());
                }
                Some(SessionEvent::Failed(failure)) => return StreamOutcome::Failed(failure),
                Some(SessionEvent::Cancelled) => return StreamOutcome::Cancelled,
                None => return StreamOutcome::Idle,
            }
        }
    }

    /// Drive the stream and, if it completed with a fragment, materialize it.
    /// No new submission can start while the sandbox call is outstanding.
    pub async fn run(&mut self) -> Result<StreamOutcome, KilnError> {
        let outcome = self.drive().await;
        if let StreamOutcome::Completed(fragment) = &outcome {
            if fragment.is_empty() {
                tracing::debug!("stream completed without a fragment; nothing to preview");
                return Ok(outcome);
            }
            let result = self.preview.materialize(fragment, &self.identity).await?;
            self.conversation.attach_result(result.clone());
            self.result = Some(result);
        }
        Ok(outcome)
    }
}
