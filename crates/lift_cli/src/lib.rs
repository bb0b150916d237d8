use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use lift::{
    decode_server_message, encode_line, ClientAgentSettings, ClientEvent, ClientTransferAgent,
    SimulatedWorldLoader, WorldTemplateId,
};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 46100;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETRY_MS: u64 = 100;
pub const DEFAULT_QUIET_MS: u64 = 250;
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_WORLD_TEMPLATE: u32 = 1;
const MAX_RETRY_BACKOFF_MS: u64 = 1_000;
const CLIENT_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineChannel {
    Control,
    Telemetry,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub channel: LineChannel,
    pub payload: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CommonOptions {
    pub port: u16,
    pub timeout_ms: u64,
    pub retry_ms: u64,
    pub include_telemetry: bool,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_ms: DEFAULT_RETRY_MS,
            include_telemetry: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    pub name: String,
    pub world_template: u32,
    pub load_ms: u64,
    pub transfer_timeout_ms: u64,
    /// Load the instance but never answer the invite.
    pub skip_ready: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            name: "player".to_string(),
            world_template: DEFAULT_WORLD_TEMPLATE,
            load_ms: 0,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            skip_ready: false,
        }
    }
}

pub enum CommandKind {
    WaitReady,
    Send { command: String },
    Join(JoinOptions),
}

pub fn parse_wire_line(raw: &str) -> ParsedLine {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    if let Some(payload) = trimmed.strip_prefix("C ") {
        return ParsedLine {
            channel: LineChannel::Control,
            payload: payload.to_string(),
        };
    }
    if let Some(payload) = trimmed.strip_prefix("T ") {
        return ParsedLine {
            channel: LineChannel::Telemetry,
            payload: payload.to_string(),
        };
    }
    ParsedLine {
        channel: LineChannel::Unknown,
        payload: trimmed.to_string(),
    }
}

pub fn should_print_line(line: &ParsedLine, include_telemetry: bool) -> bool {
    match line.channel {
        LineChannel::Control => true,
        LineChannel::Telemetry => include_telemetry,
        LineChannel::Unknown => false,
    }
}

pub fn is_ready_payload(payload: &str) -> bool {
    payload.starts_with("lift.ready v1 port:")
}

/// Transport replies that are not part of the transfer handshake.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlReply {
    Zone {
        outcome: String,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Client side of one staged transfer: feeds control lines into the
/// transfer agent and reports when the join is settled.
pub struct TransferSession {
    agent: ClientTransferAgent,
    loader: SimulatedWorldLoader,
    skip_ready: bool,
    finished: Option<Result<String, String>>,
}

impl TransferSession {
    pub fn new(options: &JoinOptions) -> Self {
        let world_template = WorldTemplateId(options.world_template);
        let latency_polls = (options.load_ms / CLIENT_TICK.as_millis() as u64) as u32;
        Self {
            agent: ClientTransferAgent::new(ClientAgentSettings::new(world_template)),
            loader: SimulatedWorldLoader::new(
                options.world_template as usize + 1,
                latency_polls,
            ),
            skip_ready: options.skip_ready,
            finished: None,
        }
    }

    pub fn opening_lines(name: &str) -> Vec<String> {
        vec![
            serde_json::json!({ "type": "hello", "name": name }).to_string(),
            serde_json::json!({ "type": "zone_enter" }).to_string(),
        ]
    }

    pub fn on_control_payload(&mut self, payload: &str) -> Option<ClientEvent> {
        if let Ok(message) = decode_server_message(payload) {
            let event = self.agent.on_message(message, &mut self.loader)?;
            self.settle(&event);
            return Some(event);
        }
        match serde_json::from_str::<ControlReply>(payload) {
            Ok(ControlReply::Zone { outcome }) => {
                if outcome != "admitted" && outcome != "already_member" {
                    self.finished = Some(Err(format!("staging zone refused entry: {outcome}")));
                }
            }
            Ok(ControlReply::Error { message }) => {
                self.finished = Some(Err(format!("server error: {message}")));
            }
            Ok(ControlReply::Other) | Err(_) => {}
        }
        None
    }

    /// Advances the simulated load and returns the events it produced plus
    /// the encoded lines to send.
    pub fn tick(&mut self, dt: Duration) -> (Vec<ClientEvent>, Vec<String>) {
        let events = self.agent.tick(dt, &mut self.loader);
        for event in &events {
            self.settle(event);
        }
        let mut lines = Vec::new();
        for message in self.agent.drain_outbound() {
            if self.skip_ready {
                continue;
            }
            if let Ok(line) = encode_line(&message) {
                lines.push(line);
            }
        }
        (events, lines)
    }

    pub fn finished(&self) -> Option<&Result<String, String>> {
        self.finished.as_ref()
    }

    fn settle(&mut self, event: &ClientEvent) {
        let outcome = match event {
            ClientEvent::Committed(instance_id) => {
                Ok(format!("transferred into instance {instance_id}"))
            }
            ClientEvent::ReadySent(instance_id) if self.skip_ready => {
                Ok(format!("loaded instance {instance_id}; ready withheld"))
            }
            ClientEvent::LoadFailed {
                instance_id,
                reason,
            } => Err(format!("failed to load instance {instance_id}: {reason}")),
            ClientEvent::LoadTimedOut(instance_id) => {
                Err(format!("timed out loading instance {instance_id}"))
            }
            _ => return,
        };
        self.finished.get_or_insert(outcome);
    }
}

pub fn describe_event(event: &ClientEvent) -> String {
    match event {
        ClientEvent::LoadStarted(id) => format!("client: load_started instance:{id}"),
        ClientEvent::DuplicateInviteIgnored(id) => {
            format!("client: duplicate_invite_ignored instance:{id}")
        }
        ClientEvent::ReadySent(id) => format!("client: loaded instance:{id}"),
        ClientEvent::LoadFailed {
            instance_id,
            reason,
        } => format!("client: load_failed instance:{instance_id} reason:{reason}"),
        ClientEvent::LoadTimedOut(id) => format!("client: load_timed_out instance:{id}"),
        ClientEvent::Committed(id) => format!("client: committed instance:{id}"),
    }
}

pub fn run<W: Write>(kind: CommandKind, opts: CommonOptions, stdout: &mut W) -> Result<(), String> {
    let timeout = Duration::from_millis(opts.timeout_ms);
    let retry_base = Duration::from_millis(opts.retry_ms.max(1));
    let include_telemetry = opts.include_telemetry;
    let mut session = Session::connect(opts.port, timeout, retry_base, &mut |line: &ParsedLine| {
        emit_line(stdout, line, include_telemetry)
    })?;

    match kind {
        CommandKind::WaitReady => Ok(()),
        CommandKind::Send { command } => {
            session.send(&command)?;
            session.drain_until_quiet(
                timeout,
                Duration::from_millis(DEFAULT_QUIET_MS),
                &mut |line: &ParsedLine| emit_line(stdout, line, include_telemetry),
            )
        }
        CommandKind::Join(join) => session.join(&join, include_telemetry, stdout),
    }
}

/// One connected socket with a line reader over a clone of it.
struct Session {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

enum ReadOutcome {
    Line(ParsedLine),
    Idle,
    Closed,
    Expired,
    Failed(io::Error),
}

impl Session {
    /// Connects with capped exponential backoff until the server announces
    /// itself with its ready line.
    fn connect<F>(
        port: u16,
        timeout: Duration,
        retry_base: Duration,
        on_line: &mut F,
    ) -> Result<Self, String>
    where
        F: FnMut(&ParsedLine),
    {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        while Instant::now() < deadline {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
                let mut session = Self::from_stream(stream)?;
                loop {
                    match session.read(deadline) {
                        ReadOutcome::Line(line) => {
                            on_line(&line);
                            if line.channel == LineChannel::Control
                                && is_ready_payload(&line.payload)
                            {
                                return Ok(session);
                            }
                        }
                        ReadOutcome::Idle => {}
                        ReadOutcome::Closed => break,
                        ReadOutcome::Expired => {
                            return Err(format!(
                                "timed out waiting for lift ready on 127.0.0.1:{port}"
                            ))
                        }
                        ReadOutcome::Failed(error) => {
                            return Err(format!("socket read error while waiting for ready: {error}"))
                        }
                    }
                }
            }

            let pause = retry_backoff(retry_base, attempt);
            if Instant::now() + pause >= deadline {
                break;
            }
            thread::sleep(pause);
            attempt = attempt.saturating_add(1);
        }

        Err(format!("timed out waiting for lift ready on 127.0.0.1:{port}"))
    }

    fn from_stream(stream: TcpStream) -> Result<Self, String> {
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(|error| format!("failed to set socket read timeout: {error}"))?;
        let reader = stream
            .try_clone()
            .map_err(|error| format!("failed to clone socket stream: {error}"))?;
        Ok(Self {
            writer: stream,
            reader: BufReader::new(reader),
        })
    }

    fn send(&mut self, line: &str) -> Result<(), String> {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.writer
            .write_all(framed.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|error| format!("failed to send line: {error}"))
    }

    fn read(&mut self, deadline: Instant) -> ReadOutcome {
        if Instant::now() >= deadline {
            return ReadOutcome::Expired;
        }
        let mut raw = String::new();
        match self.reader.read_line(&mut raw) {
            Ok(0) => ReadOutcome::Closed,
            Ok(_) => ReadOutcome::Line(parse_wire_line(&raw)),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                ReadOutcome::Idle
            }
            Err(error) => ReadOutcome::Failed(error),
        }
    }

    /// Echoes replies until none arrive for `quiet_window`.
    fn drain_until_quiet<F>(
        &mut self,
        timeout: Duration,
        quiet_window: Duration,
        on_line: &mut F,
    ) -> Result<(), String>
    where
        F: FnMut(&ParsedLine),
    {
        let deadline = Instant::now() + timeout;
        let mut last_line_at: Option<Instant> = None;
        loop {
            match self.read(deadline) {
                ReadOutcome::Line(line) => {
                    on_line(&line);
                    last_line_at = Some(Instant::now());
                }
                ReadOutcome::Idle => {
                    let now = Instant::now();
                    let quiet = match last_line_at {
                        Some(at) => now.saturating_duration_since(at) >= quiet_window,
                        None => now + quiet_window >= deadline,
                    };
                    if quiet {
                        return Ok(());
                    }
                }
                ReadOutcome::Closed => {
                    return Err("socket closed while waiting for replies".to_string())
                }
                ReadOutcome::Expired => return Ok(()),
                ReadOutcome::Failed(error) => {
                    return Err(format!("socket read error while waiting for replies: {error}"))
                }
            }
        }
    }

    fn join<W: Write>(
        &mut self,
        join: &JoinOptions,
        include_telemetry: bool,
        stdout: &mut W,
    ) -> Result<(), String> {
        let mut transfer = TransferSession::new(join);
        for line in TransferSession::opening_lines(&join.name) {
            self.send(&line)?;
        }

        let deadline = Instant::now() + Duration::from_millis(join.transfer_timeout_ms);
        let mut last_tick = Instant::now();
        let mut notes = Vec::new();
        loop {
            match self.read(deadline) {
                ReadOutcome::Line(line) => {
                    emit_line(stdout, &line, include_telemetry);
                    if line.channel == LineChannel::Control {
                        notes.extend(transfer.on_control_payload(&line.payload));
                    }
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Closed => return Err("socket closed during transfer".to_string()),
                ReadOutcome::Expired => {
                    return Err("timed out waiting for the transfer to complete".to_string())
                }
                ReadOutcome::Failed(error) => {
                    return Err(format!("socket read error during transfer: {error}"))
                }
            }

            let elapsed = last_tick.elapsed();
            if elapsed >= CLIENT_TICK {
                last_tick = Instant::now();
                let (events, lines) = transfer.tick(elapsed);
                notes.extend(events);
                for line in lines {
                    self.send(&line)?;
                }
            }
            for event in notes.drain(..) {
                let _ = writeln!(stdout, "{}", describe_event(&event));
            }

            match transfer.finished() {
                Some(Ok(summary)) => {
                    let _ = writeln!(stdout, "{summary}");
                    return Ok(());
                }
                Some(Err(message)) => return Err(message.clone()),
                None => {}
            }
        }
    }
}

/// Doubles per attempt, capped.
pub fn retry_backoff(retry_base: Duration, attempt: u32) -> Duration {
    let shift = attempt.min(8);
    let backoff_ms = (retry_base.as_millis() as u64)
        .saturating_mul(1u64 << shift)
        .min(MAX_RETRY_BACKOFF_MS);
    Duration::from_millis(backoff_ms.max(1))
}

fn emit_line<W: Write>(stdout: &mut W, line: &ParsedLine, include_telemetry: bool) {
    if should_print_line(line, include_telemetry) {
        let _ = writeln!(stdout, "{}", line.payload);
    }
}
