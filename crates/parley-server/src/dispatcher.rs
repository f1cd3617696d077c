//! Per-message protocol handling.
//!
//! The socket reader calls [`Dispatcher::dispatch`] once per text frame, in
//! arrival order. Directory and registry changes happen synchronously inside
//! that call; provider work is queued on the connection's [`Pipeline`] so it
//! completes in submission order without blocking the reader.
//!
//! Only `register` and `ping` are accepted before registration. Translation
//! mode is read when a message is dispatched, so a `settings` change only
//! affects messages that arrive after it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use parley_core::constants::CLOSE_POLICY_VIOLATION;
use parley_core::protocol::{AudioChunk, RegisterRequest, SettingsPatch};
use parley_core::{
    ConnectionId, Inbound, Outbound, ParsedFrame, RelayError, Role, SessionCode, TranslationMode,
};
use parley_providers::{ProviderChain, TranscribeOptions};
use serde_json::Value;
use tracing::{Span, debug, info, instrument, warn};

use crate::broadcaster::{Broadcaster, translate_text};
use crate::connection::{Connection, Registration};
use crate::directory::{LeaveOutcome, SessionDirectory};
use crate::metrics::{ERRORS_TOTAL, MESSAGES_TOTAL};
use crate::pipeline::Pipeline;
use crate::registry::{ConnectionRegistry, RegistryListener};

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// How long a detached session can be resumed.
    pub grace_period: Duration,
    /// Accumulate non-final audio chunks (otherwise they are dropped).
    pub buffer_partial_audio: bool,
    /// Largest accumulated utterance.
    pub max_audio_bytes: usize,
    /// Jobs queued per connection before the reader waits.
    pub pipeline_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            buffer_partial_audio: true,
            max_audio_bytes: 25 * 1024 * 1024,
            pipeline_capacity: 32,
        }
    }
}

#[derive(Debug, Default)]
struct AudioBuffer {
    bytes: Vec<u8>,
    mime_type: Option<String>,
}

impl AudioBuffer {
    fn clear(&mut self) {
        self.bytes.clear();
        self.mime_type = None;
    }
}

/// State owned by one socket's reader task.
pub struct ConnectionContext {
    connection: Arc<Connection>,
    pipeline: Pipeline,
    audio: AudioBuffer,
}

impl ConnectionContext {
    /// Context for `connection`, spawning its pipeline worker.
    pub fn new(connection: Arc<Connection>, pipeline_capacity: usize) -> Self {
        let pipeline = Pipeline::spawn(pipeline_capacity, connection.cancel_token());
        Self {
            connection,
            pipeline,
            audio: AudioBuffer::default(),
        }
    }

    /// The connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Bytes buffered for the current utterance.
    pub fn buffered_audio(&self) -> usize {
        self.audio.bytes.len()
    }

    /// Stop the pipeline and wait for it.
    pub async fn close(self) {
        self.pipeline.shutdown().await;
    }
}

/// Split an optional `data:<mime>;base64,` prefix from a payload.
pub fn split_data_uri(data: &str) -> (Option<&str>, &str) {
    let data = data.trim();
    if let Some(rest) = data.strip_prefix("data:") {
        if let Some((mime, payload)) = rest.split_once(";base64,") {
            let mime = (!mime.is_empty()).then_some(mime);
            return (mime, payload);
        }
    }
    (None, data)
}

/// Decode base64 audio, tolerating a data URI prefix.
pub fn decode_audio(data: &str) -> Result<(Option<&str>, Vec<u8>), RelayError> {
    let (mime, payload) = split_data_uri(data);
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| RelayError::validation(format!("audio data is not valid base64: {e}")))?;
    Ok((mime, bytes))
}

/// Protocol state machine shared by all connections.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<SessionDirectory>,
    broadcaster: Arc<Broadcaster>,
    chain: Arc<ProviderChain>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Dispatcher over shared state.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<SessionDirectory>,
        chain: Arc<ProviderChain>,
        config: DispatchConfig,
    ) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&chain),
        ));
        Self {
            registry,
            directory,
            broadcaster,
            chain,
            config,
        }
    }

    /// Dispatcher settings.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Handle one inbound text frame.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(connection_id = %ctx.connection.id(), kind = tracing::field::Empty)
    )]
    pub async fn dispatch(&self, ctx: &mut ConnectionContext, text: &str) {
        let message = match Inbound::parse(text) {
            Ok(ParsedFrame::Message(message)) => message,
            Ok(ParsedFrame::Unknown(kind)) => {
                debug!(kind, "ignoring unknown message type");
                metrics::counter!(MESSAGES_TOTAL, "type" => "unknown").increment(1);
                return;
            }
            Err(e) => {
                let is_register = frame_type(text).as_deref() == Some("register");
                self.fail(&ctx.connection, &e, is_register);
                return;
            }
        };

        let kind = message.kind();
        let _ = Span::current().record("kind", kind);
        metrics::counter!(MESSAGES_TOTAL, "type" => kind).increment(1);

        if let Err(e) = self.handle(ctx, message).await {
            self.fail(&ctx.connection, &e, kind == "register");
        }
    }

    async fn handle(&self, ctx: &mut ConnectionContext, message: Inbound) -> Result<(), RelayError> {
        match message {
            Inbound::Register(request) => self.register(ctx, request).await,
            Inbound::Ping { timestamp } => {
                let _ = ctx.connection.send(&Outbound::Pong {
                    timestamp,
                    server_time: Utc::now().timestamp_millis(),
                });
                Ok(())
            }
            Inbound::Audio(chunk) => {
                let code = self.require(&ctx.connection, Role::Presenter, "audio")?;
                self.audio(ctx, code, chunk).await
            }
            Inbound::Transcription { text } => {
                let code = self.require(&ctx.connection, Role::Presenter, "transcription")?;
                self.transcription(ctx, code, text).await
            }
            Inbound::SendTranslation { text } => {
                let code = self.require(&ctx.connection, Role::Presenter, "send_translation")?;
                let text = non_empty(text, "send_translation")?;
                self.submit_delivery(ctx, code, text).await;
                Ok(())
            }
            Inbound::Settings { settings } => {
                let code = self.require(&ctx.connection, Role::Presenter, "settings")?;
                self.settings(&ctx.connection, &code, &settings)
            }
            Inbound::StudentRequest { text } => {
                let code = self.require(&ctx.connection, Role::Listener, "student_request")?;
                self.student_request(ctx, code, text).await
            }
            Inbound::TeacherReply {
                connection_id,
                text,
            } => {
                let code = self.require(&ctx.connection, Role::Presenter, "teacher_reply")?;
                self.teacher_reply(ctx, code, connection_id, text).await
            }
        }
    }

    // ── register ────────────────────────────────────────────────────────

    async fn register(
        &self,
        ctx: &mut ConnectionContext,
        request: RegisterRequest,
    ) -> Result<(), RelayError> {
        let connection = Arc::clone(&ctx.connection);
        let language = request.language_code.trim().to_owned();
        if language.is_empty() {
            return Err(RelayError::validation("languageCode must not be empty"));
        }

        // re-registration starts from a clean slate
        let departed = self.directory.leave_session(connection.id());
        notify_departure(&self.registry, &departed);
        connection.set_registration(Registration::default());
        ctx.audio.clear();

        let display_name = request
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_owned);

        match request.role {
            Role::Presenter => {
                let code = self
                    .attach_presenter(connection.id(), &request, &language)
                    .await?;
                connection.set_registration(Registration {
                    role: Some(Role::Presenter),
                    session_code: Some(code.clone()),
                    language_code: Some(language.clone()),
                    display_name,
                });
                let _ = connection.send(&Outbound::SessionCode { code: code.clone() });
                let _ = connection.send(&Outbound::RegistrationConfirmation {
                    role: Role::Presenter,
                    language_code: language,
                    session_code: Some(code.clone()),
                });
                if let Some(count) = self.directory.listener_count(&code).filter(|c| *c > 0) {
                    let _ = connection.send(&Outbound::ListenerCount { count });
                }
                info!(session_code = %code, "presenter registered");
            }
            Role::Listener => {
                let raw = request
                    .session_code
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| RelayError::validation("listeners must supply sessionCode"))?;
                let code =
                    SessionCode::parse(raw).ok_or_else(|| RelayError::session_not_found(raw))?;
                let joined = self.directory.join_session(
                    &code,
                    connection.id(),
                    &language,
                    display_name.clone(),
                )?;
                connection.set_registration(Registration {
                    role: Some(Role::Listener),
                    session_code: Some(code.clone()),
                    language_code: Some(language.clone()),
                    display_name,
                });
                let _ = connection.send(&Outbound::RegistrationConfirmation {
                    role: Role::Listener,
                    language_code: language.clone(),
                    session_code: Some(code.clone()),
                });
                let _ = self.registry.send_to(
                    &joined.presenter_id,
                    &Outbound::ListenerCount {
                        count: joined.listener_count,
                    },
                );
                info!(session_code = %code, language, "listener registered");
            }
        }
        Ok(())
    }

    /// Resume by code, then by presenter key, else mint a new session.
    async fn attach_presenter(
        &self,
        id: &ConnectionId,
        request: &RegisterRequest,
        language: &str,
    ) -> Result<SessionCode, RelayError> {
        let grace = self.config.grace_period;
        let key = request
            .teacher_id
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        if let Some(raw) = request.session_code.as_deref() {
            match SessionCode::parse(raw) {
                Some(code) => {
                    let resumed = match self.directory.reattach_by_code(&code, id, key, grace)? {
                        Some(resumed) => {
                            if let Some(displaced) = &resumed.displaced {
                                self.evict_presenter(displaced, &resumed.code);
                            }
                            Some(resumed.code)
                        }
                        None => self.restore_from_store(&code, id, key).await,
                    };
                    if let Some(code) = resumed {
                        let _ = self.directory.set_source_language(&code, language);
                        return Ok(code);
                    }
                    debug!(session_code = %code, "requested session not resumable");
                }
                None => debug!(raw, "ignoring malformed presenter session code"),
            }
        }

        if let Some(key) = key {
            if let Some(code) = self.directory.reattach_presenter(id, key, grace) {
                let _ = self.directory.set_source_language(&code, language);
                return Ok(code);
            }
        }

        self.directory
            .create_session(id, language, key.map(str::to_owned))
    }

    /// Close the socket that held a session before it was resumed elsewhere.
    fn evict_presenter(&self, id: &ConnectionId, code: &SessionCode) {
        let Some(connection) = self.registry.get(id) else {
            return;
        };
        connection.set_registration(Registration::default());
        self.send_error(
            &connection,
            &RelayError::forbidden(format!("session {code} was resumed by another connection")),
        );
        info!(session_code = %code, connection_id = %id, "closing displaced presenter");
        let _ = connection.close(CLOSE_POLICY_VIOLATION, "session resumed elsewhere");
    }

    async fn restore_from_store(
        &self,
        code: &SessionCode,
        id: &ConnectionId,
        key: Option<&str>,
    ) -> Option<SessionCode> {
        let store = Arc::clone(self.directory.store()?);
        match store.find_by_code(code).await {
            Ok(Some(record)) => {
                self.directory
                    .restore_session(record, id, key, self.config.grace_period)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_code = %code, error = %e, "session store lookup failed");
                None
            }
        }
    }

    // ── presenter flow ──────────────────────────────────────────────────

    async fn audio(
        &self,
        ctx: &mut ConnectionContext,
        code: SessionCode,
        chunk: AudioChunk,
    ) -> Result<(), RelayError> {
        let (mime, bytes) = decode_audio(&chunk.data)?;
        if let Some(mime) = mime {
            ctx.audio.mime_type = Some(mime.to_owned());
        }

        if self.config.buffer_partial_audio || chunk.is_final_chunk {
            if ctx.audio.bytes.len() + bytes.len() > self.config.max_audio_bytes {
                ctx.audio.clear();
                return Err(RelayError::validation(format!(
                    "audio utterance exceeds {} bytes",
                    self.config.max_audio_bytes
                )));
            }
            ctx.audio.bytes.extend_from_slice(&bytes);
        }
        if !chunk.is_final_chunk {
            return Ok(());
        }

        let utterance = std::mem::take(&mut ctx.audio);
        if utterance.bytes.is_empty() {
            return Err(RelayError::validation("audio utterance is empty"));
        }
        let held = self.mode_of(&code)? == TranslationMode::Manual;
        let language = ctx.connection.language_code();

        let this = self.clone();
        let connection = Arc::clone(&ctx.connection);
        let _ = ctx
            .pipeline
            .submit(async move {
                this.transcribe_and_deliver(connection, code, utterance, language, held)
                    .await;
            })
            .await;
        Ok(())
    }

    async fn transcribe_and_deliver(
        &self,
        connection: Arc<Connection>,
        code: SessionCode,
        utterance: AudioBuffer,
        language: Option<String>,
        held: bool,
    ) {
        let cancel = connection.cancel_token();
        let options = TranscribeOptions {
            language,
            mime_type: utterance.mime_type,
        };
        let text = match self
            .chain
            .transcribe(&utterance.bytes, &options, &cancel)
            .await
        {
            Ok(outcome) => outcome.value.trim().to_owned(),
            Err(e) if e.is_cancelled() => {
                debug!(connection_id = %connection.id(), "transcription cancelled");
                return;
            }
            Err(e) => {
                self.send_error(
                    &connection,
                    &RelayError::ProviderChainExhausted {
                        message: e.to_string(),
                    },
                );
                return;
            }
        };
        if text.is_empty() {
            debug!(connection_id = %connection.id(), "empty transcription");
            return;
        }

        let _ = connection.send(&Outbound::Transcription {
            text: text.clone(),
            held,
        });
        if !held {
            self.deliver(&connection, &code, &text).await;
        }
    }

    async fn transcription(
        &self,
        ctx: &mut ConnectionContext,
        code: SessionCode,
        text: String,
    ) -> Result<(), RelayError> {
        let text = non_empty(text, "transcription")?;
        if self.mode_of(&code)? == TranslationMode::Manual {
            debug!(session_code = %code, "manual mode, transcription held");
            return Ok(());
        }
        self.submit_delivery(ctx, code, text).await;
        Ok(())
    }

    async fn submit_delivery(&self, ctx: &ConnectionContext, code: SessionCode, text: String) {
        let this = self.clone();
        let connection = Arc::clone(&ctx.connection);
        let _ = ctx
            .pipeline
            .submit(async move { this.deliver(&connection, &code, &text).await })
            .await;
    }

    async fn deliver(&self, presenter: &Connection, code: &SessionCode, text: &str) {
        let cancel = presenter.cancel_token();
        match self.broadcaster.broadcast(code, text, &cancel).await {
            Ok(report) => {
                if let Some(err) = report.exhaustion_error() {
                    self.send_error(presenter, &err);
                }
            }
            Err(RelayError::ConnectionLost) => {
                debug!(session_code = %code, "broadcast cancelled");
            }
            Err(e) => self.send_error(presenter, &e),
        }
    }

    fn settings(
        &self,
        connection: &Connection,
        code: &SessionCode,
        patch: &SettingsPatch,
    ) -> Result<(), RelayError> {
        let settings = self
            .directory
            .update_settings(code, patch)
            .ok_or_else(|| RelayError::session_not_found(code.as_str()))?;
        debug!(
            session_code = %code,
            mode = ?settings.translation_mode,
            tts = settings.tts_enabled,
            "settings updated"
        );
        let _ = connection.send(&Outbound::SettingsUpdated { settings });
        Ok(())
    }

    // ── listener questions ──────────────────────────────────────────────

    async fn student_request(
        &self,
        ctx: &mut ConnectionContext,
        code: SessionCode,
        text: String,
    ) -> Result<(), RelayError> {
        let text = non_empty(text, "student_request")?;
        let session = self
            .directory
            .session(&code)
            .ok_or_else(|| RelayError::session_not_found(code.as_str()))?;
        let presenter_id = session
            .presenter_id
            .ok_or_else(|| RelayError::session_not_found(code.as_str()))?;
        let registration = ctx.connection.registration();
        let listener_language = registration.language_code.unwrap_or_default();
        let presenter_language = session.source_language;

        let this = self.clone();
        let listener = Arc::clone(&ctx.connection);
        let _ = ctx
            .pipeline
            .submit(async move {
                let cancel = listener.cancel_token();
                let translated = match translate_text(
                    &this.chain,
                    &text,
                    &listener_language,
                    &presenter_language,
                    &cancel,
                )
                .await
                {
                    Ok(translated) => translated,
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => {
                        this.send_error(
                            &listener,
                            &RelayError::ProviderChainExhausted {
                                message: e.to_string(),
                            },
                        );
                        return;
                    }
                };
                let delivered = this.registry.send_to(
                    &presenter_id,
                    &Outbound::StudentRequest {
                        connection_id: listener.id().clone(),
                        display_name: registration.display_name,
                        language_code: listener_language,
                        text: translated,
                        original_text: text,
                    },
                );
                if !delivered {
                    debug!(presenter_id = %presenter_id, "presenter unreachable for question");
                }
            })
            .await;
        Ok(())
    }

    async fn teacher_reply(
        &self,
        ctx: &mut ConnectionContext,
        code: SessionCode,
        target_id: ConnectionId,
        text: String,
    ) -> Result<(), RelayError> {
        let text = non_empty(text, "teacher_reply")?;
        let source_language = self
            .directory
            .session(&code)
            .ok_or_else(|| RelayError::session_not_found(code.as_str()))?
            .source_language;
        match self.directory.membership(&target_id) {
            Some((Role::Listener, listener_code)) if listener_code == code => {}
            _ => {
                return Err(RelayError::validation(format!(
                    "{target_id} is not a listener in session {code}"
                )));
            }
        }
        let target = self
            .registry
            .get(&target_id)
            .ok_or_else(|| RelayError::validation(format!("{target_id} is not connected")))?;
        let target_language = target.language_code().unwrap_or_default();

        let this = self.clone();
        let presenter = Arc::clone(&ctx.connection);
        let _ = ctx
            .pipeline
            .submit(async move {
                let cancel = presenter.cancel_token();
                match translate_text(&this.chain, &text, &source_language, &target_language, &cancel)
                    .await
                {
                    Ok(translated) => {
                        let _ = target.send(&Outbound::TeacherReply {
                            text: translated,
                            original_text: text,
                            source_language,
                            target_language,
                        });
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => this.send_error(
                        &presenter,
                        &RelayError::ProviderChainExhausted {
                            message: e.to_string(),
                        },
                    ),
                }
            })
            .await;
        Ok(())
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn mode_of(&self, code: &SessionCode) -> Result<TranslationMode, RelayError> {
        self.directory
            .settings(code)
            .map(|s| s.translation_mode)
            .ok_or_else(|| RelayError::session_not_found(code.as_str()))
    }

    /// Role and session the sender must hold for `kind`.
    ///
    /// The connection's registration names the session; the directory must
    /// still agree, otherwise the session is gone or was taken over.
    fn require(
        &self,
        connection: &Connection,
        role: Role,
        kind: &str,
    ) -> Result<SessionCode, RelayError> {
        let registration = connection.registration();
        let (Some(actual), Some(code)) = (registration.role, registration.session_code) else {
            return Err(RelayError::NotRegistered {
                kind: kind.to_owned(),
            });
        };
        if actual != role {
            return Err(RelayError::forbidden(format!(
                "{kind} is only accepted from a {role}"
            )));
        }
        match self.directory.membership(connection.id()) {
            Some((member_role, member_code)) if member_role == role && member_code == code => {
                Ok(code)
            }
            _ => Err(RelayError::session_not_found(code.as_str())),
        }
    }

    fn send_error(&self, connection: &Connection, err: &RelayError) {
        metrics::counter!(ERRORS_TOTAL, "code" => err.code()).increment(1);
        debug!(connection_id = %connection.id(), code = err.code(), error = %err, "sending error");
        let _ = connection.send(&Outbound::error(err));
    }

    fn fail(&self, connection: &Connection, err: &RelayError, during_register: bool) {
        self.send_error(connection, err);
        if !during_register {
            return;
        }
        if let Some(code) = err.registration_close_code() {
            info!(connection_id = %connection.id(), code, error = %err, "closing after failed registration");
            let _ = connection.close(code, err.to_string());
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn non_empty(text: String, kind: &str) -> Result<String, RelayError> {
    if text.trim().is_empty() {
        Err(RelayError::validation(format!("{kind} text must not be empty")))
    } else {
        Ok(text)
    }
}

/// `type` of a frame that failed full parsing.
fn frame_type(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_owned)
}

/// Tell a presenter its listener count changed.
fn notify_departure(registry: &ConnectionRegistry, outcome: &LeaveOutcome) {
    if let LeaveOutcome::ListenerLeft {
        remaining,
        presenter_id: Some(presenter_id),
        ..
    } = outcome
    {
        let _ = registry.send_to(
            presenter_id,
            &Outbound::ListenerCount { count: *remaining },
        );
    }
}

/// Registry hook that drops a closed connection's session membership.
pub struct SessionCleanup {
    directory: Arc<SessionDirectory>,
    registry: Weak<ConnectionRegistry>,
}

impl SessionCleanup {
    /// Hook for `registry`, cleaning up `directory`.
    pub fn new(directory: Arc<SessionDirectory>, registry: &Arc<ConnectionRegistry>) -> Self {
        Self {
            directory,
            registry: Arc::downgrade(registry),
        }
    }

    /// Install a cleanup hook on `registry`.
    pub fn install(directory: Arc<SessionDirectory>, registry: &Arc<ConnectionRegistry>) {
        registry.set_listener(Arc::new(Self::new(directory, registry)));
    }
}

impl RegistryListener for SessionCleanup {
    fn on_unregister(&self, connection: &Connection) {
        let outcome = self.directory.leave_session(connection.id());
        if let Some(registry) = self.registry.upgrade() {
            notify_departure(&registry, &outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parley_providers::mock::MockProvider;
    use parley_providers::{ProviderHealthTracker, Synthesizer, Transcriber, Translator};
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::connection::OutboundFrame;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        directory: Arc<SessionDirectory>,
        dispatcher: Dispatcher,
        translator: Arc<MockProvider>,
    }

    struct Client {
        ctx: ConnectionContext,
        rx: mpsc::Receiver<OutboundFrame>,
    }

    impl Harness {
        fn new(transcribers: Vec<MockProvider>, translator: MockProvider) -> Self {
            Self::with_config(transcribers, translator, DispatchConfig::default())
        }

        fn with_config(
            transcribers: Vec<MockProvider>,
            translator: MockProvider,
            config: DispatchConfig,
        ) -> Self {
            Self::build(transcribers, translator, config, SessionDirectory::new(10))
        }

        fn with_directory(directory: SessionDirectory) -> Self {
            Self::build(
                vec![],
                MockProvider::new("t"),
                DispatchConfig::default(),
                directory,
            )
        }

        fn build(
            transcribers: Vec<MockProvider>,
            translator: MockProvider,
            config: DispatchConfig,
            directory: SessionDirectory,
        ) -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let directory = Arc::new(directory);
            SessionCleanup::install(Arc::clone(&directory), &registry);
            let translator = Arc::new(translator);
            let chain = Arc::new(ProviderChain::new(
                transcribers
                    .into_iter()
                    .map(|t| Arc::new(t) as Arc<dyn Transcriber>)
                    .collect(),
                vec![Arc::clone(&translator) as Arc<dyn Translator>],
                Vec::<Arc<dyn Synthesizer>>::new(),
                Duration::from_secs(1),
                Arc::new(ProviderHealthTracker::new()),
            ));
            let dispatcher = Dispatcher::new(
                Arc::clone(&registry),
                Arc::clone(&directory),
                chain,
                config,
            );
            Self {
                registry,
                directory,
                dispatcher,
                translator,
            }
        }

        fn connect(&self, id: &str) -> Client {
            let (tx, rx) = mpsc::channel(64);
            let connection = Arc::new(Connection::new(ConnectionId::from(id), tx));
            self.registry.register(Arc::clone(&connection));
            Client {
                ctx: ConnectionContext::new(connection, 8),
                rx,
            }
        }

        async fn send(&self, client: &mut Client, message: Value) {
            self.dispatcher
                .dispatch(&mut client.ctx, &message.to_string())
                .await;
        }

        async fn presenter(&self, id: &str) -> (Client, SessionCode) {
            let mut client = self.connect(id);
            self.send(
                &mut client,
                json!({"type": "register", "role": "presenter", "languageCode": "en-US"}),
            )
            .await;
            let msg = client.next().await;
            assert_eq!(msg["type"], "session_code");
            let code = SessionCode::parse(msg["code"].as_str().unwrap()).unwrap();
            assert_eq!(client.next().await["type"], "registration_confirmation");
            (client, code)
        }

        async fn listener(&self, id: &str, code: &SessionCode, language: &str) -> Client {
            let mut client = self.connect(id);
            self.send(
                &mut client,
                json!({
                    "type": "register",
                    "role": "listener",
                    "languageCode": language,
                    "sessionCode": code.as_str(),
                }),
            )
            .await;
            assert_eq!(client.next().await["type"], "registration_confirmation");
            client
        }
    }

    impl Client {
        async fn next_frame(&mut self) -> OutboundFrame {
            tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed")
        }

        async fn next(&mut self) -> Value {
            match self.next_frame().await {
                OutboundFrame::Text(json) => serde_json::from_str(&json).unwrap(),
                other => panic!("expected text frame, got {other:?}"),
            }
        }

        async fn assert_silent(&mut self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(self.rx.try_recv().is_err(), "unexpected frame");
        }

        /// Wait until all queued pipeline work has run.
        async fn drain(&self) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            assert!(
                self.ctx
                    .pipeline
                    .submit(async move {
                        let _ = tx.send(());
                    })
                    .await
            );
            rx.await.unwrap();
        }
    }

    #[test]
    fn data_uri_prefix_is_split() {
        assert_eq!(
            split_data_uri("data:audio/webm;base64,AAAA"),
            (Some("audio/webm"), "AAAA")
        );
        assert_eq!(split_data_uri("AAAA"), (None, "AAAA"));
        assert_eq!(split_data_uri("  AAAA \n"), (None, "AAAA"));
        let (_, bytes) = decode_audio("data:audio/wav;base64,aGk=").unwrap();
        assert_eq!(bytes, b"hi");
        assert_eq!(decode_audio("%%%").unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn steady_state_requires_registration() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut c = h.connect("c1");
        h.send(&mut c, json!({"type": "transcription", "text": "hi"})).await;
        let err = c.next().await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "NOT_REGISTERED");
    }

    #[tokio::test]
    async fn ping_works_before_registration() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut c = h.connect("c1");
        h.send(&mut c, json!({"type": "ping", "timestamp": 42})).await;
        let pong = c.next().await;
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["timestamp"], 42);
        assert!(pong["serverTime"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut c = h.connect("c1");
        h.send(&mut c, json!({"type": "dance"})).await;
        c.assert_silent().await;

        h.dispatcher.dispatch(&mut c.ctx, "{not json").await;
        assert_eq!(c.next().await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn malformed_register_closes_with_policy_violation() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut c = h.connect("c1");
        h.send(&mut c, json!({"type": "register", "role": "presenter"})).await;
        assert_eq!(c.next().await["code"], "VALIDATION_ERROR");
        // the reason embeds the serde message, so only the code is stable
        assert!(matches!(
            c.next_frame().await,
            OutboundFrame::Close { code: CLOSE_POLICY_VIOLATION, .. }
        ));
    }

    #[tokio::test]
    async fn listener_with_unknown_code_is_closed() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut c = h.connect("l1");
        h.send(
            &mut c,
            json!({"type": "register", "role": "listener", "languageCode": "es-ES", "sessionCode": "ZZZ999"}),
        )
        .await;
        let err = c.next().await;
        assert_eq!(err["code"], "SESSION_NOT_FOUND");
        assert!(matches!(
            c.next_frame().await,
            OutboundFrame::Close { code: 1008, .. }
        ));
        assert!(c.ctx.connection().role().is_none());
    }

    #[tokio::test]
    async fn listener_join_notifies_presenter() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (mut p, code) = h.presenter("p1").await;
        let _l = h.listener("l1", &code, "es-ES").await;
        let count = p.next().await;
        assert_eq!(count["type"], "listener_count");
        assert_eq!(count["count"], 1);

        let _ = h.registry.unregister(&ConnectionId::from("l1"));
        let count = p.next().await;
        assert_eq!(count["count"], 0);
    }

    #[tokio::test]
    async fn auto_mode_broadcasts_transcription() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (mut p, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        let _ = p.next().await;

        h.send(&mut p, json!({"type": "transcription", "text": "Hello"})).await;
        let msg = l.next().await;
        assert_eq!(msg["type"], "translation");
        assert_eq!(msg["text"], "[es-ES] Hello");
        assert_eq!(msg["sourceLanguage"], "en-US");
        assert_eq!(msg["targetLanguage"], "es-ES");
        l.assert_silent().await;
    }

    #[tokio::test]
    async fn manual_mode_holds_until_release() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (mut p, code) = h.presenter("p1").await;
        let mut es1 = h.listener("l1", &code, "es-ES").await;
        let mut es2 = h.listener("l2", &code, "es-ES").await;
        let mut fr = h.listener("l3", &code, "fr-FR").await;

        h.send(
            &mut p,
            json!({"type": "settings", "settings": {"translationMode": "manual"}}),
        )
        .await;
        h.send(&mut p, json!({"type": "transcription", "text": "Hello"})).await;
        p.drain().await;
        es1.assert_silent().await;
        fr.assert_silent().await;
        assert_eq!(h.translator.calls(), 0);

        h.send(&mut p, json!({"type": "send_translation", "text": "Hello"})).await;
        p.drain().await;
        assert_eq!(es1.next().await["targetLanguage"], "es-ES");
        assert_eq!(es2.next().await["targetLanguage"], "es-ES");
        assert_eq!(fr.next().await["targetLanguage"], "fr-FR");
        assert_eq!(h.translator.calls(), 2);
        es1.assert_silent().await;
    }

    #[tokio::test]
    async fn settings_reply_and_persist() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (mut p, code) = h.presenter("p1").await;
        h.send(
            &mut p,
            json!({"type": "settings", "settings": {"translationMode": "manual", "ttsEnabled": false}}),
        )
        .await;
        let reply = p.next().await;
        assert_eq!(reply["type"], "settings_updated");
        assert_eq!(reply["settings"]["translationMode"], "manual");
        assert_eq!(reply["settings"]["ttsEnabled"], false);
        assert_eq!(
            h.directory.settings(&code).unwrap().translation_mode,
            TranslationMode::Manual
        );
    }

    #[tokio::test]
    async fn listener_cannot_send_presenter_messages() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (_p, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        h.send(&mut l, json!({"type": "send_translation", "text": "x"})).await;
        assert_eq!(l.next().await["code"], "FORBIDDEN");
        h.send(&mut l, json!({"type": "settings", "settings": {}})).await;
        assert_eq!(l.next().await["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn audio_chunks_accumulate_until_final() {
        let h = Harness::new(
            vec![MockProvider::new("stt").with_transcript("Hello")],
            MockProvider::new("t"),
        );
        let (mut p, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        let _ = p.next().await;

        h.send(&mut p, json!({"type": "audio", "data": STANDARD.encode(b"abc")})).await;
        assert_eq!(p.ctx.buffered_audio(), 3);
        h.send(
            &mut p,
            json!({"type": "audio", "data": STANDARD.encode(b"def"), "isFinalChunk": true}),
        )
        .await;
        assert_eq!(p.ctx.buffered_audio(), 0);

        let echo = p.next().await;
        assert_eq!(echo["type"], "transcription");
        assert_eq!(echo["text"], "Hello");
        assert_eq!(echo["held"], false);
        assert_eq!(l.next().await["text"], "[es-ES] Hello");
    }

    #[tokio::test]
    async fn partial_chunks_dropped_when_buffering_disabled() {
        let config = DispatchConfig {
            buffer_partial_audio: false,
            ..DispatchConfig::default()
        };
        let h = Harness::with_config(vec![MockProvider::new("stt")], MockProvider::new("t"), config);
        let (mut p, _code) = h.presenter("p1").await;
        h.send(&mut p, json!({"type": "audio", "data": STANDARD.encode(b"abc")})).await;
        assert_eq!(p.ctx.buffered_audio(), 0);
    }

    #[tokio::test]
    async fn oversized_utterance_is_rejected() {
        let config = DispatchConfig {
            max_audio_bytes: 4,
            ..DispatchConfig::default()
        };
        let h = Harness::with_config(vec![MockProvider::new("stt")], MockProvider::new("t"), config);
        let (mut p, _code) = h.presenter("p1").await;
        h.send(&mut p, json!({"type": "audio", "data": STANDARD.encode(b"abcdef")})).await;
        assert_eq!(p.next().await["code"], "VALIDATION_ERROR");
        assert_eq!(p.ctx.buffered_audio(), 0);
    }

    #[tokio::test]
    async fn exhausted_transcription_errors_presenter_only() {
        let h = Harness::new(
            vec![
                MockProvider::new("a").failing(),
                MockProvider::new("b").failing(),
                MockProvider::new("c").failing(),
            ],
            MockProvider::new("t"),
        );
        let (mut p, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        let _ = p.next().await;

        h.send(
            &mut p,
            json!({"type": "audio", "data": STANDARD.encode(b"abc"), "isFinalChunk": true}),
        )
        .await;
        let err = p.next().await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "PROVIDER_CHAIN_EXHAUSTED");
        p.assert_silent().await;
        l.assert_silent().await;
    }

    #[tokio::test]
    async fn questions_and_replies_are_translated() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (mut p, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        let _ = p.next().await;

        h.send(&mut l, json!({"type": "student_request", "text": "¿Por qué?"})).await;
        let question = p.next().await;
        assert_eq!(question["type"], "student_request");
        assert_eq!(question["connectionId"], "l1");
        assert_eq!(question["text"], "[en-US] ¿Por qué?");
        assert_eq!(question["originalText"], "¿Por qué?");

        h.send(
            &mut p,
            json!({"type": "teacher_reply", "connectionId": "l1", "text": "Because"}),
        )
        .await;
        let reply = l.next().await;
        assert_eq!(reply["type"], "teacher_reply");
        assert_eq!(reply["text"], "[es-ES] Because");
        assert_eq!(reply["targetLanguage"], "es-ES");
    }

    #[tokio::test]
    async fn reply_to_foreign_connection_is_rejected() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (mut p, _code) = h.presenter("p1").await;
        h.send(
            &mut p,
            json!({"type": "teacher_reply", "connectionId": "nobody", "text": "hi"}),
        )
        .await;
        assert_eq!(p.next().await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn expired_session_fails_listener_sends() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (_p, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        let _ = h.registry.unregister(&ConnectionId::from("p1"));
        let _ = h.directory.expire(Duration::ZERO);

        h.send(&mut l, json!({"type": "student_request", "text": "hola"})).await;
        assert_eq!(l.next().await["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn presenter_reconnect_resumes_code() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut first = h.connect("p1");
        h.send(
            &mut first,
            json!({"type": "register", "role": "presenter", "languageCode": "en-US", "teacherId": "t-1"}),
        )
        .await;
        let code = first.next().await["code"].as_str().unwrap().to_owned();
        let _ = h.registry.unregister(&ConnectionId::from("p1"));

        let mut second = h.connect("p2");
        h.send(
            &mut second,
            json!({"type": "register", "role": "presenter", "languageCode": "en-US", "teacherId": "t-1"}),
        )
        .await;
        assert_eq!(second.next().await["code"], code.as_str());
    }

    fn keyed_register(key: &str, code: Option<&SessionCode>) -> Value {
        let mut request = json!({
            "type": "register",
            "role": "presenter",
            "languageCode": "en-US",
            "teacherId": key,
        });
        if let Some(code) = code {
            request["sessionCode"] = json!(code.as_str());
        }
        request
    }

    #[tokio::test]
    async fn displaced_presenter_is_cut_off() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut p1 = h.connect("p1");
        h.send(&mut p1, keyed_register("k1", None)).await;
        let code = SessionCode::parse(p1.next().await["code"].as_str().unwrap()).unwrap();
        assert_eq!(p1.next().await["type"], "registration_confirmation");
        let mut l = h.listener("l1", &code, "es-ES").await;
        assert_eq!(p1.next().await["type"], "listener_count");

        let mut p2 = h.connect("p2");
        h.send(&mut p2, keyed_register("k1", Some(&code))).await;
        assert_eq!(p2.next().await["code"], code.as_str());
        assert_eq!(p2.next().await["type"], "registration_confirmation");
        assert_eq!(p2.next().await["count"], 1);

        let evicted = p1.next().await;
        assert_eq!(evicted["type"], "error");
        assert_eq!(evicted["code"], "FORBIDDEN");
        assert!(matches!(
            p1.next_frame().await,
            OutboundFrame::Close { code: CLOSE_POLICY_VIOLATION, .. }
        ));
        assert!(p1.ctx.connection().role().is_none());

        h.send(&mut p1, json!({"type": "transcription", "text": "from displaced p1"})).await;
        assert_eq!(p1.next().await["code"], "NOT_REGISTERED");
        h.send(&mut p1, json!({"type": "settings", "settings": {"translationMode": "manual"}}))
            .await;
        assert_eq!(p1.next().await["code"], "NOT_REGISTERED");
        l.assert_silent().await;
        assert_eq!(h.translator.calls(), 0);

        h.send(&mut p2, json!({"type": "transcription", "text": "from p2"})).await;
        assert_eq!(l.next().await["originalText"], "from p2");
    }

    #[tokio::test]
    async fn stale_registration_cannot_broadcast() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (mut p, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        let _ = p.next().await;
        // membership gone while the socket still believes it presents
        let _ = h.directory.leave_session(&ConnectionId::from("p1"));

        h.send(&mut p, json!({"type": "transcription", "text": "ghost"})).await;
        assert_eq!(p.next().await["code"], "SESSION_NOT_FOUND");
        l.assert_silent().await;
    }

    #[tokio::test]
    async fn detached_session_rejects_foreign_presenter_key() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let mut p1 = h.connect("p1");
        h.send(&mut p1, keyed_register("secret-key", None)).await;
        let code = SessionCode::parse(p1.next().await["code"].as_str().unwrap()).unwrap();
        let _l = h.listener("l1", &code, "es-ES").await;
        let _ = h.registry.unregister(&ConnectionId::from("p1"));

        let mut intruder = h.connect("x");
        h.send(&mut intruder, keyed_register("other-key", Some(&code))).await;
        assert_eq!(intruder.next().await["code"], "FORBIDDEN");
        intruder.assert_silent().await;
        assert!(intruder.ctx.connection().role().is_none());
        let session = h.directory.session(&code).unwrap();
        assert!(session.presenter_id.is_none());
        assert_eq!(h.directory.len(), 1);

        let mut owner = h.connect("p2");
        h.send(&mut owner, keyed_register("secret-key", Some(&code))).await;
        assert_eq!(owner.next().await["code"], code.as_str());
    }

    #[tokio::test]
    async fn reminted_code_does_not_reach_old_listener() {
        let directory =
            SessionDirectory::new(10).with_code_source(|| SessionCode::parse("SAME01").unwrap());
        let h = Harness::with_directory(directory);
        let (_p1, code) = h.presenter("p1").await;
        let mut l = h.listener("l1", &code, "es-ES").await;
        let _ = h.registry.unregister(&ConnectionId::from("p1"));
        let _ = h.directory.expire(Duration::ZERO);

        let (mut p2, reminted) = h.presenter("p2").await;
        assert_eq!(reminted, code);

        h.send(&mut l, json!({"type": "student_request", "text": "hola"})).await;
        assert_eq!(l.next().await["code"], "SESSION_NOT_FOUND");
        p2.assert_silent().await;
        assert_eq!(h.translator.calls(), 0);
    }

    #[tokio::test]
    async fn teardown_removes_membership() {
        let h = Harness::new(vec![], MockProvider::new("t"));
        let (_p, code) = h.presenter("p1").await;
        let _l = h.listener("l1", &code, "es-ES").await;
        let _ = h.registry.unregister(&ConnectionId::from("l1"));
        assert!(h.directory.membership(&ConnectionId::from("l1")).is_none());
        assert_eq!(h.directory.listener_count(&code), Some(0));
    }
}
