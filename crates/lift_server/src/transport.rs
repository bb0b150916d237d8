use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use lift::ConnectionId;
use tracing::{info, warn};

const TRANSPORT_DIAG_ENV_VAR: &str = "LIFT_TRANSPORT_DIAG";
const MAX_PENDING_TELEMETRY_BYTES_PER_CLIENT: usize = 64 * 1024;
const MAX_PENDING_CONTROL_BYTES_PER_CLIENT: usize = 256 * 1024;
pub const CONTROL_PREFIX: &str = "C ";
pub const TELEMETRY_PREFIX: &str = "T ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(ConnectionId),
    Line(ConnectionId, String),
    Disconnected(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundClass {
    Control,
    Telemetry,
}

#[derive(Debug)]
struct OutboundChunk {
    class: OutboundClass,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct OutboundChunkState {
    chunk: OutboundChunk,
    written: usize,
}

#[derive(Debug)]
struct ClientConn {
    id: ConnectionId,
    stream: TcpStream,
    read_buf: Vec<u8>,
    active_chunk: Option<OutboundChunkState>,
    queued_chunks: VecDeque<OutboundChunk>,
    queued_control_bytes: usize,
    queued_telemetry_bytes: usize,
}

impl ClientConn {
    fn new(id: ConnectionId, stream: TcpStream) -> Self {
        Self {
            id,
            stream,
            read_buf: Vec::new(),
            active_chunk: None,
            queued_chunks: VecDeque::new(),
            queued_control_bytes: 0,
            queued_telemetry_bytes: 0,
        }
    }
}

/// Nonblocking newline-delimited TCP transport. Every accepted socket gets a
/// fresh `ConnectionId`; outbound lines carry a `C ` or `T ` prefix.
#[derive(Debug)]
pub struct LineTransport {
    listener: TcpListener,
    bound_port: u16,
    clients: Vec<ClientConn>,
    next_connection: u64,
}

impl LineTransport {
    pub fn bind_localhost(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(localhost_bind_addr(port))?;
        listener.set_nonblocking(true)?;
        let bound_port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            bound_port,
            clients: Vec::new(),
            next_connection: 1,
        })
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn poll(&mut self, out: &mut Vec<TransportEvent>) {
        self.accept_pending_clients(out);
        self.poll_client_lines(out);
        self.flush_all_client_outbound(out);
    }

    pub fn send_control(&mut self, connection: ConnectionId, line: &str) {
        if let Some(client) = self
            .clients
            .iter_mut()
            .find(|client| client.id == connection)
        {
            enqueue_control_line_with_cap(client, line, MAX_PENDING_CONTROL_BYTES_PER_CLIENT);
        }
    }

    pub fn broadcast_telemetry(&mut self, line: &str) {
        for client in &mut self.clients {
            enqueue_telemetry_line_with_cap(client, line, MAX_PENDING_TELEMETRY_BYTES_PER_CLIENT);
        }
    }

    pub fn flush(&mut self, out: &mut Vec<TransportEvent>) {
        self.flush_all_client_outbound(out);
    }

    fn accept_pending_clients(&mut self, out: &mut Vec<TransportEvent>) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!(error = %err, "transport_client_nonblocking_failed");
                        continue;
                    }
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(error = %err, "transport_client_nodelay_failed");
                    }
                    let id = ConnectionId(self.next_connection);
                    self.next_connection = self.next_connection.saturating_add(1);
                    let mut client = ClientConn::new(id, stream);
                    enqueue_control_line_with_cap(
                        &mut client,
                        &ready_line_text(self.bound_port, id),
                        MAX_PENDING_CONTROL_BYTES_PER_CLIENT,
                    );
                    info!(connection = %id, peer = %addr, "transport_client_accepted");
                    self.clients.push(client);
                    out.push(TransportEvent::Connected(id));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "transport_accept_failed");
                    break;
                }
            }
        }
    }

    fn poll_client_lines(&mut self, out: &mut Vec<TransportEvent>) {
        let mut index = 0usize;
        while index < self.clients.len() {
            let mut disconnected = false;
            {
                let client = &mut self.clients[index];
                let mut chunk = [0u8; 1024];
                loop {
                    match client.stream.read(&mut chunk) {
                        Ok(0) => {
                            disconnected = true;
                            break;
                        }
                        Ok(bytes_read) => {
                            client.read_buf.extend_from_slice(&chunk[..bytes_read]);
                            let mut lines = Vec::new();
                            drain_complete_lines(&mut client.read_buf, &mut lines);
                            out.extend(
                                lines
                                    .into_iter()
                                    .map(|line| TransportEvent::Line(client.id, line)),
                            );
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            warn!(connection = %client.id, error = %err, "transport_client_read_failed");
                            disconnected = true;
                            break;
                        }
                    }
                }
            }

            if disconnected {
                let client = self.clients.swap_remove(index);
                info!(connection = %client.id, "transport_client_disconnected");
                out.push(TransportEvent::Disconnected(client.id));
            } else {
                index += 1;
            }
        }
    }

    fn flush_all_client_outbound(&mut self, out: &mut Vec<TransportEvent>) {
        let mut index = 0usize;
        while index < self.clients.len() {
            let flush_result = {
                let client = &mut self.clients[index];
                flush_pending_chunks(
                    &mut client.active_chunk,
                    &mut client.queued_chunks,
                    &mut client.queued_control_bytes,
                    &mut client.queued_telemetry_bytes,
                    |payload| client.stream.write(payload),
                )
            };
            if let Err(err) = flush_result {
                let client = self.clients.swap_remove(index);
                warn!(connection = %client.id, error = %err, "transport_client_write_failed");
                out.push(TransportEvent::Disconnected(client.id));
            } else {
                index += 1;
            }
        }
    }
}

fn localhost_bind_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn transport_diag_enabled() -> bool {
    matches!(
        std::env::var(TRANSPORT_DIAG_ENV_VAR).ok().as_deref(),
        Some("1")
    )
}

fn drain_complete_lines(buffer: &mut Vec<u8>, out: &mut Vec<String>) {
    while let Some(newline_index) = buffer.iter().position(|byte| *byte == b'\n') {
        let mut line_bytes = buffer.drain(..=newline_index).collect::<Vec<u8>>();
        line_bytes.pop(); // newline
        if line_bytes.last().copied() == Some(b'\r') {
            line_bytes.pop();
        }

        match String::from_utf8(line_bytes) {
            Ok(line) => {
                if transport_diag_enabled() {
                    info!(line = %line, "transport_diag_line_read");
                }
                out.push(line)
            }
            Err(err) => warn!(error = %err, "transport_invalid_utf8_line_dropped"),
        }
    }
}

fn encode_tagged_payload(prefix: &str, line: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(prefix.len() + line.len() + 1);
    payload.extend_from_slice(prefix.as_bytes());
    payload.extend_from_slice(line.as_bytes());
    payload.push(b'\n');
    payload
}

fn ready_line_text(port: u16, connection: ConnectionId) -> String {
    format!("lift.ready v1 port:{port} connection:{connection}")
}

fn enqueue_control_line_with_cap(client: &mut ClientConn, line: &str, control_cap: usize) {
    let chunk = OutboundChunk {
        class: OutboundClass::Control,
        bytes: encode_tagged_payload(CONTROL_PREFIX, line),
    };
    let chunk_bytes = chunk.bytes.len();
    if chunk_bytes > control_cap {
        warn!(connection = %client.id, chunk_bytes, control_cap, "transport_control_line_over_cap");
        return;
    }

    while client.queued_control_bytes.saturating_add(chunk_bytes) > control_cap {
        if !evict_oldest_queued(client, OutboundClass::Control) {
            return;
        }
    }

    client.queued_control_bytes = client.queued_control_bytes.saturating_add(chunk_bytes);
    let insert_at = client
        .queued_chunks
        .iter()
        .position(|existing| existing.class == OutboundClass::Telemetry)
        .unwrap_or(client.queued_chunks.len());
    client.queued_chunks.insert(insert_at, chunk);
    if transport_diag_enabled() {
        info!(
            connection = %client.id,
            line = %line,
            queue_len = client.queued_chunks.len(),
            "transport_diag_enqueued_control_line"
        );
    }
}

fn enqueue_telemetry_line_with_cap(client: &mut ClientConn, line: &str, telemetry_cap: usize) {
    let chunk = OutboundChunk {
        class: OutboundClass::Telemetry,
        bytes: encode_tagged_payload(TELEMETRY_PREFIX, line),
    };
    let chunk_bytes = chunk.bytes.len();
    if chunk_bytes > telemetry_cap {
        return;
    }

    while client.queued_telemetry_bytes.saturating_add(chunk_bytes) > telemetry_cap {
        if !evict_oldest_queued(client, OutboundClass::Telemetry) {
            return;
        }
    }

    client.queued_telemetry_bytes = client.queued_telemetry_bytes.saturating_add(chunk_bytes);
    client.queued_chunks.push_back(chunk);
}

fn evict_oldest_queued(client: &mut ClientConn, class: OutboundClass) -> bool {
    let Some(index) = client
        .queued_chunks
        .iter()
        .position(|chunk| chunk.class == class)
    else {
        return false;
    };
    let Some(removed) = client.queued_chunks.remove(index) else {
        return false;
    };
    match class {
        OutboundClass::Control => {
            client.queued_control_bytes = client
                .queued_control_bytes
                .saturating_sub(removed.bytes.len());
        }
        OutboundClass::Telemetry => {
            client.queued_telemetry_bytes = client
                .queued_telemetry_bytes
                .saturating_sub(removed.bytes.len());
        }
    }
    if transport_diag_enabled() {
        info!(
            connection = %client.id,
            class = ?class,
            removed_bytes = removed.bytes.len(),
            "transport_diag_evicted_oldest"
        );
    }
    true
}

fn flush_pending_chunks<F>(
    active_chunk: &mut Option<OutboundChunkState>,
    queued_chunks: &mut VecDeque<OutboundChunk>,
    queued_control_bytes: &mut usize,
    queued_telemetry_bytes: &mut usize,
    mut write_payload: F,
) -> io::Result<()>
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    loop {
        if active_chunk.is_none() {
            let Some(chunk) = queued_chunks.pop_front() else {
                return Ok(());
            };
            match chunk.class {
                OutboundClass::Control => {
                    *queued_control_bytes = queued_control_bytes.saturating_sub(chunk.bytes.len());
                }
                OutboundClass::Telemetry => {
                    *queued_telemetry_bytes =
                        queued_telemetry_bytes.saturating_sub(chunk.bytes.len());
                }
            }
            *active_chunk = Some(OutboundChunkState { chunk, written: 0 });
        }

        let Some(state) = active_chunk.as_mut() else {
            return Ok(());
        };
        let remaining = &state.chunk.bytes[state.written..];
        match write_payload(remaining) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport_write_zero",
                ));
            }
            Ok(bytes_written) => {
                state.written = state.written.saturating_add(bytes_written);
                if state.written >= state.chunk.bytes.len() {
                    *active_chunk = None;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn make_client_conn_for_queue_tests() -> ClientConn {
        let listener = TcpListener::bind(localhost_bind_addr(0)).expect("bind");
        let addr = listener.local_addr().expect("addr");
        let stream = TcpStream::connect(addr).expect("connect");
        ClientConn::new(ConnectionId(1), stream)
    }

    fn poll_until<F>(transport: &mut LineTransport, mut done: F) -> Vec<TransportEvent>
    where
        F: FnMut(&[TransportEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            transport.poll(&mut events);
            if done(&events) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn bind_address_is_localhost_only() {
        assert_eq!(
            localhost_bind_addr(46100),
            SocketAddr::from(([127, 0, 0, 1], 46100))
        );
    }

    #[test]
    fn drain_complete_lines_keeps_partial_tail() {
        let mut buffer = b"hello\r\nzone_en".to_vec();
        let mut lines = Vec::new();
        drain_complete_lines(&mut buffer, &mut lines);
        assert_eq!(lines, vec!["hello".to_string()]);
        assert_eq!(buffer, b"zone_en".to_vec());
    }

    #[test]
    fn accepted_client_gets_id_ready_line_and_lines_are_attributed() {
        let mut transport = LineTransport::bind_localhost(0).expect("bind");
        let mut stream =
            TcpStream::connect(localhost_bind_addr(transport.bound_port())).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        stream.write_all(b"{\"type\":\"zone_enter\"}\n").expect("write");

        let events = poll_until(&mut transport, |events| {
            events
                .iter()
                .any(|event| matches!(event, TransportEvent::Line(..)))
        });
        assert_eq!(events[0], TransportEvent::Connected(ConnectionId(1)));
        assert!(events.contains(&TransportEvent::Line(
            ConnectionId(1),
            "{\"type\":\"zone_enter\"}".to_string()
        )));

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).expect("ready line");
        assert_eq!(
            line.trim_end(),
            format!("C lift.ready v1 port:{} connection:1", transport.bound_port())
        );
    }

    #[test]
    fn closed_socket_reports_disconnect() {
        let mut transport = LineTransport::bind_localhost(0).expect("bind");
        let stream =
            TcpStream::connect(localhost_bind_addr(transport.bound_port())).expect("connect");
        poll_until(&mut transport, |events| !events.is_empty());
        drop(stream);

        let events = poll_until(&mut transport, |events| {
            events
                .iter()
                .any(|event| matches!(event, TransportEvent::Disconnected(_)))
        });
        assert!(events.contains(&TransportEvent::Disconnected(ConnectionId(1))));
        assert_eq!(transport.client_count(), 0);
    }

    #[test]
    fn control_is_queued_ahead_of_telemetry() {
        let mut client = make_client_conn_for_queue_tests();
        enqueue_telemetry_line_with_cap(&mut client, "t1", 1024);
        enqueue_control_line_with_cap(&mut client, "c1", 1024);
        let classes = client
            .queued_chunks
            .iter()
            .map(|chunk| chunk.class)
            .collect::<Vec<_>>();
        assert_eq!(classes, vec![OutboundClass::Control, OutboundClass::Telemetry]);
    }

    #[test]
    fn telemetry_eviction_never_touches_control() {
        let mut client = make_client_conn_for_queue_tests();
        enqueue_control_line_with_cap(&mut client, "keep", 1024);
        for index in 0..10 {
            enqueue_telemetry_line_with_cap(&mut client, &format!("frame-{index}"), 20);
        }
        let controls = client
            .queued_chunks
            .iter()
            .filter(|chunk| chunk.class == OutboundClass::Control)
            .count();
        assert_eq!(controls, 1);
        assert!(client.queued_telemetry_bytes <= 20);
    }

    #[test]
    fn wouldblock_retains_active_chunk() {
        let mut active = None;
        let mut queue = VecDeque::from([OutboundChunk {
            class: OutboundClass::Control,
            bytes: b"abcdef".to_vec(),
        }]);
        let mut control_bytes = 6usize;
        let mut telemetry_bytes = 0usize;
        let mut calls = 0;
        flush_pending_chunks(
            &mut active,
            &mut queue,
            &mut control_bytes,
            &mut telemetry_bytes,
            |payload| {
                calls += 1;
                if calls == 1 {
                    Ok(payload.len().min(2))
                } else {
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
            },
        )
        .expect("flush");
        let state = active.expect("still active");
        assert_eq!(state.written, 2);
        assert!(queue.is_empty());
        assert_eq!(control_bytes, 0);
    }
}
