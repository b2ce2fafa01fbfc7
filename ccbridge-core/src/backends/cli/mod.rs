//! Local agent backend: runs the agent binary as a subprocess and reads its
//! JSON-lines stream.
//!
//! The binary is launched under a PTY wrapper (`script -qec ... /dev/null` by
//! default) so it keeps streaming output when stdout is not a terminal. The
//! wrapper brings terminal control sequences with it; those are scrubbed
//! best-effort before line classification.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};

use crate::{
    backend::ChatBackend,
    error::{BridgeError, CoreResult},
    framing::{LineBuffer, strip_control_sequences},
    model::{ChatRequest, ChatResponse, Role},
    stream::{BoxStreamEv, StreamEvent},
    translate::StreamTranslator,
};

/// Default wall-clock budget for one agent run.
pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 300_000;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Classified agent output, in line order, ending with exactly one `Close`.
#[derive(Debug)]
pub enum AgentEvent {
    /// Incremental assistant text.
    ContentDelta(String),
    /// A complete assistant message object.
    AssistantMessage(Value),
    /// The final result object (usage, cost, session metadata).
    Result(Value),
    /// A line that was not a recognized JSON event.
    Raw(String),
    /// Runtime failure; `Close` still follows.
    Error(BridgeError),
    /// Process ended. Emitted exactly once, always last.
    Close { code: Option<i32> },
}

/// Classify one scrubbed output line.
///
/// Priority when a JSON object matches several shapes: content delta, then
/// assistant message, then result. Anything else (including non-JSON) is
/// passed through as `Raw`; blank lines vanish.
pub fn classify_line(line: &str) -> Option<AgentEvent> {
    let cleaned = strip_control_sequences(line);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return Some(AgentEvent::Raw(trimmed.to_string())),
    };
    if let Some(text) = value
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(Value::as_str)
    {
        return Some(AgentEvent::ContentDelta(text.to_string()));
    }
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => Some(AgentEvent::AssistantMessage(value)),
        Some("result") => Some(AgentEvent::Result(value)),
        _ => Some(AgentEvent::Raw(trimmed.to_string())),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A running agent subprocess with its classified event channel.
pub struct AgentProcess {
    child: Arc<Mutex<Option<Child>>>,
    events: mpsc::Receiver<AgentEvent>,
}

impl AgentProcess {
    /// Spawn `program args...`, optionally under a PTY wrapper, and start
    /// reading its stdout. Spawn failures surface here; everything after a
    /// successful spawn arrives as events.
    pub fn spawn(
        program: &str,
        args: &[String],
        pty_wrapper: Option<&str>,
        timeout: Duration,
    ) -> CoreResult<Self> {
        let mut cmd = match pty_wrapper {
            Some(wrapper) => {
                let mut line = shell_quote(program);
                for a in args {
                    line.push(' ');
                    line.push_str(&shell_quote(a));
                }
                let mut c = Command::new(wrapper);
                c.args(["-qec", &line, "/dev/null"]);
                c
            }
            None => {
                let mut c = Command::new(program);
                c.args(args);
                c
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BridgeError::ProcessNotFound {
                    command: program.to_string(),
                }
            } else {
                BridgeError::Io(e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Other(anyhow::anyhow!("child stdout not captured")))?;

        let child = Arc::new(Mutex::new(Some(child)));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(read_loop(stdout, child.clone(), tx, timeout));

        Ok(Self { child, events: rx })
    }

    /// Next classified event; `None` after `Close` has been consumed.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Kill the subprocess. Safe to call any number of times, including
    /// after natural exit.
    pub async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
        *guard = None;
    }
}

async fn read_loop(
    mut stdout: tokio::process::ChildStdout,
    child: Arc<Mutex<Option<Child>>>,
    tx: mpsc::Sender<AgentEvent>,
    timeout: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut buf = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    let mut timed_out = false;
    let mut receiver_gone = false;

    'outer: loop {
        tokio::select! {
            read = stdout.read(&mut chunk) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                        for line in buf.push(&text) {
                            if let Some(ev) = classify_line(&line)
                                && tx.send(ev).await.is_err()
                            {
                                receiver_gone = true;
                                break 'outer;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(AgentEvent::Error(BridgeError::Io(e))).await;
                        break;
                    }
                }
            }
            _ = &mut deadline => {
                timed_out = true;
                let _ = tx
                    .send(AgentEvent::Error(BridgeError::ProcessTimeout {
                        ms: timeout.as_millis() as u64,
                    }))
                    .await;
                break;
            }
        }
    }

    if let Some(tail) = buf.finish()
        && !timed_out
        && !receiver_gone
        && let Some(ev) = classify_line(&tail)
    {
        let _ = tx.send(ev).await;
    }

    let code = {
        let mut guard = child.lock().await;
        match guard.take() {
            Some(mut child) => {
                if timed_out || receiver_gone {
                    let _ = child.start_kill();
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
            None => None,
        }
    };
    let _ = tx.send(AgentEvent::Close { code }).await;
}

/// Configuration for the agent subprocess backend.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub binary: String,
    /// PTY wrapper binary; `None` runs the agent directly.
    pub pty_wrapper: Option<String>,
    pub timeout_ms: u64,
    pub session_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            pty_wrapper: Some("script".to_string()),
            timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            session_id: None,
        }
    }
}

/// Backend that answers chat requests through the local agent binary.
pub struct CliBackend {
    config: AgentConfig,
    name: String,
}

impl CliBackend {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            name: "cli".into(),
        }
    }

    fn agent_args(&self, req: &ChatRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            req.model.clone(),
            "--no-session-persistence".to_string(),
        ];
        if let Some(sid) = &self.config.session_id {
            args.push("--session-id".to_string());
            args.push(sid.clone());
        }
        args.push(render_prompt(req));
        args
    }
}

/// Flatten the normalized request into a single prompt argument. A bare
/// single user turn passes through verbatim; anything richer becomes a
/// labeled transcript.
fn render_prompt(req: &ChatRequest) -> String {
    if req.system.is_none()
        && req.turns.len() == 1
        && req.turns[0].role == Role::User
    {
        return req.turns[0].content.clone();
    }
    let mut out = String::new();
    if let Some(system) = &req.system {
        out.push_str(system);
        out.push_str("\n\n");
    }
    for turn in &req.turns {
        let label = match turn.role {
            Role::Assistant => "Assistant",
            _ => "User",
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&turn.content);
        out.push('\n');
    }
    out
}

/// Pull the assistant text out of a complete assistant-message object.
fn assistant_text(value: &Value) -> Option<String> {
    let blocks = value.get("message")?.get("content")?.as_array()?;
    let text: String = blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

fn result_usage(value: &Value) -> (u32, u32) {
    let usage = value.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    (input, output)
}

#[async_trait]
impl ChatBackend for CliBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        let model = req.model.clone();
        let mut stream = self.chat_stream(req).await?;
        let mut text = String::new();
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        let mut stop_reason = None;

        use futures_util::StreamExt;
        while let Some(ev) = stream.next().await {
            match ev {
                StreamEvent::Content(c) => text.push_str(&c),
                StreamEvent::Finish {
                    reason,
                    input_tokens: tin,
                    output_tokens: tout,
                } => {
                    stop_reason = Some(reason);
                    input_tokens = tin;
                    output_tokens = tout;
                }
                StreamEvent::Error(e) => return Err(e),
                StreamEvent::Role | StreamEvent::Done => {}
            }
        }

        Ok(ChatResponse {
            model,
            text,
            input_tokens,
            output_tokens,
            stop_reason,
            backend: self.name.clone(),
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let args = self.agent_args(&req);
        let mut process = AgentProcess::spawn(
            &self.config.binary,
            &args,
            self.config.pty_wrapper.as_deref(),
            Duration::from_millis(self.config.timeout_ms),
        )?;

        let backend = self.name.clone();
        let model = req.model.clone();
        let request_id = req.request_id.clone();
        let started = std::time::Instant::now();

        let stream = async_stream::stream! {
            let mut tr = StreamTranslator::new();
            while let Some(event) = process.next_event().await {
                match event {
                    AgentEvent::ContentDelta(delta) => {
                        for out in tr.on_event(crate::translate::UpstreamEvent::ContentDelta(delta)) {
                            yield out;
                        }
                    }
                    AgentEvent::AssistantMessage(value) => {
                        // Only a fallback: when deltas already streamed the
                        // text, the complete message is redundant.
                        if tr.text().is_empty()
                            && let Some(text) = assistant_text(&value)
                        {
                            for out in tr.on_event(crate::translate::UpstreamEvent::ContentDelta(text)) {
                                yield out;
                            }
                        }
                    }
                    AgentEvent::Result(value) => {
                        let (input, output) = result_usage(&value);
                        for out in tr.on_event(crate::translate::UpstreamEvent::MessageDelta {
                            output_tokens: output,
                            stop_reason: None,
                        }) {
                            yield out;
                        }
                        for out in tr.on_event(crate::translate::UpstreamEvent::MessageStart {
                            model: String::new(),
                            input_tokens: input,
                        }) {
                            yield out;
                        }
                    }
                    AgentEvent::Raw(line) => {
                        tracing::debug!(line = %line, "unclassified agent output");
                    }
                    AgentEvent::Error(e) => {
                        for out in tr.fail(e) {
                            yield out;
                        }
                    }
                    AgentEvent::Close { code } => {
                        if !tr.is_terminal() {
                            if let Some(c) = code
                                && c != 0
                                && tr.text().is_empty()
                            {
                                for out in tr.fail(BridgeError::ProcessExit { code: c }) {
                                    yield out;
                                }
                            } else {
                                for out in tr.finish() {
                                    yield out;
                                }
                            }
                        }
                        break;
                    }
                }
            }
            process.kill().await;

            let (tin, tout) = tr.usage();
            let clog = crate::telemetry::CompletionLog::new()
                .backend(&backend)
                .model(&model)
                .request_id_opt(request_id.as_deref())
                .latency_ms(started.elapsed().as_millis() as u64)
                .stop_reason_opt(tr.stop_reason())
                .text_opt(Some(tr.text()))
                .tokens(Some(tin), Some(tout), tin.checked_add(tout));
            crate::telemetry::emit_completion(clog);
        };
        Ok(Box::pin(stream))
    }
}
