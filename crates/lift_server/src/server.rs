use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lift::{
    encode_line, AuthorityFlags, AuthorityPorts, AvatarTemplateId, AvatarWorld, ConnectionId,
    ConnectionRegistry, FixedStepClock, InMemoryRegistry, LoopConfig, MetricsLogGate,
    ReadyOutcome, SimulatedWorldLoader, TemplateCatalog, TransferAuthority, ViewState,
    ZoneConfigError, ZoneEntry,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolvedSettings;
use crate::protocol::{InboundCommand, Reply, Telemetry};
use crate::transport::{LineTransport, TransportEvent};

const MIN_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// The authority process state: transfer core plus the in-process
/// collaborators it drives.
pub struct LiftServer {
    authority: TransferAuthority,
    registry: InMemoryRegistry,
    world: AvatarWorld,
    loader: SimulatedWorldLoader,
    view: ViewState,
    lobby_avatar_template: AvatarTemplateId,
    loop_config: LoopConfig,
    outbound: Vec<(ConnectionId, String)>,
}

impl LiftServer {
    pub fn new(
        settings: ResolvedSettings,
        catalog: TemplateCatalog,
        loader_latency_ticks: u32,
    ) -> Result<Self, ZoneConfigError> {
        let loader = SimulatedWorldLoader::new(catalog.world_count(), loader_latency_ticks);
        Ok(Self {
            authority: TransferAuthority::new(settings.transfer)?,
            registry: InMemoryRegistry::default(),
            world: AvatarWorld::new(catalog),
            loader,
            view: ViewState::default(),
            lobby_avatar_template: settings.lobby_avatar_template,
            loop_config: settings.loop_config,
            outbound: Vec::new(),
        })
    }

    pub fn on_connected(&mut self, connection: ConnectionId) {
        self.registry.connect(connection);
    }

    /// Drops the connection and whatever avatar it was driving.
    pub fn on_disconnected(&mut self, connection: ConnectionId) {
        if let Some(avatar) = self.registry.disconnect(connection) {
            self.world.despawn(avatar);
        }
    }

    pub fn on_line(&mut self, connection: ConnectionId, line: &str) {
        let command = match InboundCommand::parse(line) {
            Ok(command) => command,
            Err(err) => {
                debug!(connection = %connection, error = %err, "inbound_line_rejected");
                self.reply(
                    connection,
                    &Reply::Error {
                        message: format!("unrecognized command: {err}"),
                    },
                );
                return;
            }
        };

        match command {
            InboundCommand::Hello { name } => self.on_hello(connection, &name),
            InboundCommand::ZoneEnter => {
                let entry =
                    self.authority
                        .on_entity_enter(connection, &self.registry, &mut self.view);
                self.reply(
                    connection,
                    &Reply::Zone {
                        outcome: zone_entry_label(entry),
                    },
                );
            }
            InboundCommand::ZoneExit => {
                let left = self.authority.on_entity_exit(connection, &mut self.view);
                self.reply(
                    connection,
                    &Reply::Zone {
                        outcome: if left { "left" } else { "not_member" },
                    },
                );
            }
            InboundCommand::Ready { instance_id } => {
                let mut ports = AuthorityPorts {
                    registry: &mut self.registry,
                    spawner: &mut self.world,
                    loader: &mut self.loader,
                    view: &mut self.view,
                };
                if let ReadyOutcome::HandoffFailed =
                    self.authority.on_ready(connection, instance_id, &mut ports)
                {
                    self.reply(
                        connection,
                        &Reply::Error {
                            message: format!("transfer into instance {instance_id} failed"),
                        },
                    );
                }
            }
        }
    }

    fn on_hello(&mut self, connection: ConnectionId, name: &str) {
        if self.registry.avatar(connection).is_some() {
            self.reply(connection, &Reply::welcome(connection));
            return;
        }
        if !self.registry.authenticate(connection, name) {
            return;
        }
        match self.world.spawn_staging_avatar(
            self.lobby_avatar_template,
            connection,
            AuthorityFlags::default(),
        ) {
            Ok(avatar) => {
                self.registry.bind_avatar(connection, avatar);
                self.reply(connection, &Reply::welcome(connection));
            }
            Err(err) => {
                warn!(connection = %connection, error = %err, "lobby_avatar_spawn_failed");
                self.reply(
                    connection,
                    &Reply::Error {
                        message: err.to_string(),
                    },
                );
            }
        }
    }

    pub fn tick(&mut self, dt: Duration) {
        let mut ports = AuthorityPorts {
            registry: &mut self.registry,
            spawner: &mut self.world,
            loader: &mut self.loader,
            view: &mut self.view,
        };
        self.authority.tick(dt, &mut ports);
        self.world.apply_pending();
    }

    /// Encoded control lines accumulated since the last call, handshake
    /// messages included.
    pub fn take_outbound(&mut self) -> Vec<(ConnectionId, String)> {
        for (connection, message) in self.authority.drain_outbound() {
            match encode_line(&message) {
                Ok(line) => self.outbound.push((connection, line)),
                Err(err) => warn!(connection = %connection, error = %err, "outbound_encode_failed"),
            }
        }
        std::mem::take(&mut self.outbound)
    }

    /// Telemetry line when the staging view changed since the last call.
    pub fn take_telemetry(&mut self) -> Option<String> {
        if !self.view.take_dirty() {
            return None;
        }
        serde_json::to_string(&Telemetry::from_view(&self.view)).ok()
    }

    pub fn authority(&self) -> &TransferAuthority {
        &self.authority
    }

    pub fn registry(&self) -> &InMemoryRegistry {
        &self.registry
    }

    pub fn world(&self) -> &AvatarWorld {
        &self.world
    }

    pub fn loop_config(&self) -> &LoopConfig {
        &self.loop_config
    }

    fn reply<T: Serialize>(&mut self, connection: ConnectionId, reply: &T) {
        match encode_line(reply) {
            Ok(line) => self.outbound.push((connection, line)),
            Err(err) => warn!(connection = %connection, error = %err, "reply_encode_failed"),
        }
    }
}

fn zone_entry_label(entry: ZoneEntry) -> &'static str {
    match entry {
        ZoneEntry::Admitted => "admitted",
        ZoneEntry::AlreadyMember => "already_member",
        ZoneEntry::Full => "full",
        ZoneEntry::Unauthenticated => "unauthenticated",
        ZoneEntry::InFlight => "in_flight",
        ZoneEntry::InSession => "in_session",
    }
}

/// Runs the fixed-step authority loop until `shutdown` is set.
pub fn run(server: &mut LiftServer, transport: &mut LineTransport, shutdown: &AtomicBool) {
    let loop_config = server.loop_config().clone();
    let mut clock = FixedStepClock::new(&loop_config, Instant::now());
    let mut metrics_gate = MetricsLogGate::new(loop_config.metrics_log_interval, Instant::now());
    let metrics = server.authority().metrics_handle();
    let mut events = Vec::new();

    info!(
        port = transport.bound_port(),
        target_tps = loop_config.target_tps,
        "authority_loop_started"
    );
    while !shutdown.load(Ordering::Relaxed) {
        transport.poll(&mut events);
        for event in events.drain(..) {
            match event {
                TransportEvent::Connected(connection) => server.on_connected(connection),
                TransportEvent::Line(connection, line) => server.on_line(connection, &line),
                TransportEvent::Disconnected(connection) => server.on_disconnected(connection),
            }
        }

        let now = Instant::now();
        let plan = clock.advance(now);
        for _ in 0..plan.ticks_to_run {
            server.tick(clock.fixed_dt());
            metrics_gate.record_tick();
        }

        for (connection, line) in server.take_outbound() {
            transport.send_control(connection, &line);
        }
        if let Some(line) = server.take_telemetry() {
            transport.broadcast_telemetry(&line);
        }
        transport.flush(&mut events);

        if let Some(tps) = metrics_gate.maybe_emit(now) {
            let snapshot = metrics.snapshot();
            info!(
                tps,
                clients = transport.client_count(),
                zone_members = snapshot.zone_members,
                pending_transfers = snapshot.pending_transfers,
                live_instances = snapshot.live_instances,
                batches_dispatched = snapshot.batches_dispatched,
                commits = snapshot.commits,
                expirations = snapshot.expirations,
                handoff_failures = snapshot.handoff_failures,
                "transfer_metrics"
            );
        }

        thread::sleep(clock.until_next_tick().max(MIN_IDLE_SLEEP));
    }
    info!("authority_loop_stopped");
}
