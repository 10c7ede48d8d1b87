//! Dispatcher: six listeners, connection triage, frame-to-record decode,
//! observation-system lookup, and the periodic client broadcast and GC
//! tasks.
//!
//! Accepted connections land in one of two pools (operator clients vs
//! devices). Read tasks enqueue framed lines onto the dispatcher bus; the
//! single consumer decodes them with the dialect matching the listening
//! port and routes them onto the right observation system's bus. Lines that
//! fail to decode close the connection for clients, cameras and GFT mounts;
//! GWAC device endpoints produce handshake noise and are only logged.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use obs_proto::gwac;
use obs_proto::kv::{DerotCmd, Envelope, FocusCmd, KvBody, KvFrame, PlanReport, FOCUS_UNKNOWN};
use obs_proto::types::{ObssType, PlanState};

use crate::bus::{self, Bus};
use crate::config::Config;
use crate::net::{spawn_link, LineSink, Link};
use crate::obss::{self, ObssEvent, ObssHandle, GC_IDLE_SECS};

/// Client status broadcast cadence.
const BROADCAST_SECS: u64 = 2;
/// Idle observation-system sweep cadence.
const GC_SWEEP_SECS: u64 = 60;
/// Focus channels multiplexed per GWAC unit.
const FOCUS_CHANNELS: usize = 5;

// ── Peers ─────────────────────────────────────────────────────────────────────

/// Which listener a connection arrived on; decides dialect and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    MountGwac,
    CameraGwac,
    FocusGwac,
    MountGft,
    CameraGft,
}

impl Peer {
    pub fn label(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::MountGwac | Self::MountGft => "mount",
            Self::CameraGwac | Self::CameraGft => "camera",
            Self::FocusGwac => "focus",
        }
    }

    fn is_client(self) -> bool {
        self == Self::Client
    }

    /// GWAC mount/focus endpoints speak the positional dialect.
    fn is_positional(self) -> bool {
        matches!(self, Self::MountGwac | Self::FocusGwac)
    }
}

// ── Dispatcher messages ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum HubEvent {
    Line { link: Link, peer: Peer, line: String },
    Closed { link: Link, peer: Peer },
    Quit,
}

// ── Connection pools ──────────────────────────────────────────────────────────

/// Thread-safe set of live connections. The broadcast write holds the lock
/// for the whole sweep so no frame interleaves with a removal.
struct Pool {
    conns: StdMutex<Vec<Link>>,
}

impl Pool {
    fn new() -> Self {
        Self {
            conns: StdMutex::new(Vec::new()),
        }
    }

    fn push(&self, link: Link) {
        self.conns.lock().unwrap().push(link);
    }

    fn pop(&self, id: u64) -> Option<Link> {
        let mut conns = self.conns.lock().unwrap();
        let at = conns.iter().position(|l| l.id() == id)?;
        Some(conns.remove(at))
    }

    fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    fn broadcast(&self, line: &str) {
        let conns = self.conns.lock().unwrap();
        for link in conns.iter() {
            link.send_line(line);
        }
    }

    fn close_all(&self) {
        let mut conns = self.conns.lock().unwrap();
        for link in conns.drain(..) {
            link.close();
        }
    }
}

// ── Observation-system registry ───────────────────────────────────────────────

struct Registry {
    systems: StdMutex<Vec<ObssHandle>>,
    plan_tx: mpsc::UnboundedSender<KvFrame>,
}

impl Registry {
    fn find(&self, gid: &str, uid: &str) -> Option<ObssHandle> {
        self.systems
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.matches(gid, uid))
            .cloned()
    }

    /// Lazy creation: the first frame naming a `(gid, uid)` brings the
    /// observation system into being.
    fn find_or_create(&self, gid: &str, uid: &str, kind: ObssType) -> Option<ObssHandle> {
        let mut systems = self.systems.lock().unwrap();
        if let Some(handle) = systems.iter().find(|h| h.matches(gid, uid)) {
            return Some(handle.clone());
        }
        let handle = obss::spawn(gid, uid, kind, self.plan_tx.clone())?;
        systems.push(handle.clone());
        Some(handle)
    }

    fn all(&self) -> Vec<ObssHandle> {
        self.systems.lock().unwrap().clone()
    }

    fn remove(&self, gid: &str, uid: &str) {
        self.systems
            .lock()
            .unwrap()
            .retain(|h| !(h.gid == gid && h.uid == uid));
    }

    fn drain(&self) -> Vec<ObssHandle> {
        std::mem::take(&mut *self.systems.lock().unwrap())
    }
}

// ── Hub ───────────────────────────────────────────────────────────────────────

/// Ports actually bound, for configurations that request port 0.
#[derive(Debug, Clone, Copy)]
pub struct Ports {
    pub client: u16,
    pub mount_gwac: u16,
    pub camera_gwac: u16,
    pub focus_gwac: u16,
    pub mount_gft: u16,
    pub camera_gft: u16,
}

pub struct Hub {
    clients: Arc<Pool>,
    devices: Arc<Pool>,
    registry: Arc<Registry>,
    bus: Bus<HubEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    ports: Ports,
}

impl Hub {
    /// Bind all six listeners and launch the consumer, broadcast and GC
    /// tasks. Fails when any port cannot be bound.
    pub async fn start(cfg: Config) -> anyhow::Result<Hub> {
        let cfg = Arc::new(cfg);
        let (bus_tx, mut bus_rx) = bus::channel::<HubEvent>();
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);

        let clients = Arc::new(Pool::new());
        let devices = Arc::new(Pool::new());
        let (plan_tx, mut plan_rx) = mpsc::unbounded_channel::<KvFrame>();
        let registry = Arc::new(Registry {
            systems: StdMutex::new(Vec::new()),
            plan_tx,
        });

        // Plan-status relay: every lifecycle transition reaches all clients.
        {
            let clients = clients.clone();
            tokio::spawn(async move {
                while let Some(frame) = plan_rx.recv().await {
                    clients.broadcast(&frame.encode());
                }
            });
        }

        let listeners = [
            (Peer::Client, cfg.network.client.port),
            (Peer::MountGwac, cfg.network.mount_gwac.port),
            (Peer::CameraGwac, cfg.network.camera_gwac.port),
            (Peer::FocusGwac, cfg.network.focus_gwac.port),
            (Peer::MountGft, cfg.network.mount_gft.port),
            (Peer::CameraGft, cfg.network.camera_gft.port),
        ];
        let mut bound = [0u16; 6];
        for (at, (peer, port)) in listeners.into_iter().enumerate() {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            bound[at] = listener.local_addr()?.port();
            info!("listening for {} on port {}", peer.label(), bound[at]);

            let bus = bus_tx.clone();
            let clients = clients.clone();
            let devices = devices.clone();
            let mut sd = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sd.changed() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, addr)) = accepted else { continue };
                            info!("accepted {} connection from {addr}", peer.label());
                            let link = spawn_link(stream, peer, LineSink::Hub(bus.clone()));
                            if peer.is_client() {
                                clients.push(link);
                            } else {
                                devices.push(link);
                            }
                        }
                    }
                }
            });
        }
        let ports = Ports {
            client: bound[0],
            mount_gwac: bound[1],
            camera_gwac: bound[2],
            focus_gwac: bound[3],
            mount_gft: bound[4],
            camera_gft: bound[5],
        };

        let hub = Hub {
            clients: clients.clone(),
            devices: devices.clone(),
            registry: registry.clone(),
            bus: bus_tx,
            shutdown: shutdown.clone(),
            ports,
        };

        // Dispatcher consumer.
        {
            let cfg = cfg.clone();
            let clients = clients.clone();
            let devices = devices.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                while let Some(ev) = bus_rx.recv().await {
                    match ev {
                        HubEvent::Line { link, peer, line } => {
                            route_line(&cfg, &clients, &devices, &registry, link, peer, &line)
                                .await;
                        }
                        HubEvent::Closed { link, peer } => {
                            on_closed(&clients, &devices, &registry, link, peer).await;
                        }
                        HubEvent::Quit => break,
                    }
                }
            });
        }

        // Periodic client broadcast of device status.
        {
            let clients = clients.clone();
            let registry = registry.clone();
            let mut sd = shutdown.subscribe();
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_secs(BROADCAST_SECS));
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = sd.changed() => break,
                        _ = tick.tick() => broadcast_status(&clients, &registry).await,
                    }
                }
            });
        }

        // Periodic GC of idle observation systems.
        {
            let registry = registry.clone();
            let mut sd = shutdown.subscribe();
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_secs(GC_SWEEP_SECS));
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = sd.changed() => break,
                        _ = tick.tick() => sweep_idle(&registry).await,
                    }
                }
            });
        }

        Ok(hub)
    }

    pub fn ports(&self) -> Ports {
        self.ports
    }

    /// Reverse of start: observation systems first, then listeners and
    /// connection pools.
    pub async fn stop(&self) {
        info!("stopping dispatcher");
        for handle in self.registry.drain() {
            handle.stop();
        }
        let _ = self.shutdown.send(true);
        self.bus.send(HubEvent::Quit);
        self.clients.close_all();
        self.devices.close_all();
    }
}

// ── Routing ───────────────────────────────────────────────────────────────────

async fn route_line(
    cfg: &Config,
    clients: &Pool,
    devices: &Pool,
    registry: &Registry,
    link: Link,
    peer: Peer,
    line: &str,
) {
    if line.is_empty() {
        return;
    }
    if peer.is_positional() {
        let frame = match gwac::GwacFrame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                // GWAC endpoints emit noise during handshake; skip, keep the
                // link.
                error!("undefined protocol from {}: {e}", peer.label());
                return;
            }
        };
        match peer {
            Peer::MountGwac => route_mount_gwac(cfg, registry, &link, frame).await,
            Peer::FocusGwac => route_focus_gwac(registry, &link, frame).await,
            _ => unreachable!(),
        }
        return;
    }

    let frame = match KvFrame::parse(line) {
        Ok(frame) => frame,
        Err(e) => {
            error!("undefined protocol from {}: {e} <{line}>", peer.label());
            link.close();
            return;
        }
    };
    match peer {
        Peer::Client => process_client(clients, registry, frame).await,
        Peer::MountGft => {
            if matches!(frame.body, KvBody::Mount(_)) {
                if let Some(handle) =
                    registry.find_or_create(&frame.env.gid, &frame.env.uid, ObssType::Gft)
                {
                    // Ownership of the link moves out of the device pool.
                    if let Some(owned) = devices.pop(link.id()) {
                        handle.post(ObssEvent::CoupleMount(owned)).await;
                    }
                }
            }
        }
        Peer::CameraGwac | Peer::CameraGft => {
            if matches!(frame.body, KvBody::Camera(_)) {
                let kind = if peer == Peer::CameraGwac {
                    ObssType::Gwac
                } else {
                    ObssType::Gft
                };
                if let Some(handle) = registry.find_or_create(&frame.env.gid, &frame.env.uid, kind)
                {
                    if let Some(owned) = devices.pop(link.id()) {
                        handle
                            .post(ObssEvent::CoupleCamera {
                                link: owned,
                                cid: frame.env.cid.clone(),
                            })
                            .await;
                    }
                }
            }
        }
        Peer::MountGwac | Peer::FocusGwac => unreachable!(),
    }
}

/// A GWAC mount endpoint drives a whole group: fan a status frame out to
/// units `[1..N_GROUP]`, creating observation systems as they appear.
async fn route_mount_gwac(cfg: &Config, registry: &Registry, link: &Link, frame: gwac::GwacFrame) {
    // Shared link: every unit of the group holds the same connection.
    let shared = link.clone();
    match frame.body {
        gwac::GwacBody::Status { states } => {
            let units = cfg.group_units(&frame.gid).min(states.len());
            for unit in 1..=units {
                let uid = format!("{unit:03}");
                if let Some(handle) = registry.find_or_create(&frame.gid, &uid, ObssType::Gwac) {
                    handle.post(ObssEvent::CoupleMount(shared.clone())).await;
                    handle
                        .post(ObssEvent::MountState(i32::from(states[unit - 1])))
                        .await;
                }
            }
        }
        gwac::GwacBody::Position { ra, dec } => {
            if let Some(handle) = registry.find_or_create(&frame.gid, &frame.uid, ObssType::Gwac) {
                handle.post(ObssEvent::CoupleMount(shared.clone())).await;
                handle
                    .post(ObssEvent::MountPosition {
                        ra,
                        dec,
                        utc: frame.utc,
                    })
                    .await;
            }
        }
        gwac::GwacBody::Response => {
            if let Some(handle) = registry.find(&frame.gid, &frame.uid) {
                handle
                    .post(ObssEvent::Response {
                        serial: frame.serial,
                    })
                    .await;
            }
        }
        gwac::GwacBody::Focus { .. } => {}
    }
}

/// A GWAC focuser frame carries the five focus channels of one unit; they
/// map onto cameras `(uid-1)*5+1 ..= (uid-1)*5+5`.
async fn route_focus_gwac(registry: &Registry, link: &Link, frame: gwac::GwacFrame) {
    let shared = link.clone();
    match frame.body {
        gwac::GwacBody::Focus { pos } => {
            let Some(handle) = registry.find_or_create(&frame.gid, &frame.uid, ObssType::Gwac)
            else {
                return;
            };
            handle.post(ObssEvent::CoupleFocus(shared.clone())).await;
            let Ok(unit) = frame.uid.parse::<usize>() else {
                return;
            };
            if unit == 0 {
                return;
            }
            let base = (unit - 1) * FOCUS_CHANNELS;
            for (channel, value) in pos.iter().enumerate() {
                if let Some(value) = value {
                    let cid = format!("{:03}", base + channel + 1);
                    handle
                        .post(ObssEvent::FocusPosition {
                            cid,
                            pos: *value,
                        })
                        .await;
                }
            }
        }
        gwac::GwacBody::Response => {
            if let Some(handle) = registry.find(&frame.gid, &frame.uid) {
                handle
                    .post(ObssEvent::Response {
                        serial: frame.serial,
                    })
                    .await;
            }
        }
        _ => {}
    }
}

/// Client verbs fan out over every matching observation system.
async fn process_client(clients: &Pool, registry: &Registry, frame: KvFrame) {
    let gid = frame.env.gid.clone();
    let uid = frame.env.uid.clone();

    match &frame.body {
        KvBody::CheckPlan(query) => {
            for handle in registry.all() {
                if !handle.matches(&gid, &uid) {
                    continue;
                }
                let snap = handle.snapshot().await;
                if snap.plan.plan_sn.eq_ignore_ascii_case(&query.plan_sn) {
                    let reply = KvFrame::new(
                        Envelope::new(&handle.gid, &handle.uid),
                        KvBody::Plan(snap.plan),
                    );
                    clients.broadcast(&reply.encode());
                    return;
                }
            }
            // Nobody has the serial: answer with the error state.
            let reply = KvFrame::new(
                Envelope::new(&gid, &uid),
                KvBody::Plan(PlanReport {
                    plan_sn: query.plan_sn.clone(),
                    state: PlanState::Error,
                    ..Default::default()
                }),
            );
            clients.broadcast(&reply.encode());
        }
        KvBody::RemovePlan(query) => {
            for handle in registry.all() {
                if !handle.matches(&gid, &uid) {
                    continue;
                }
                let snap = handle.snapshot().await;
                if snap.plan.plan_sn.eq_ignore_ascii_case(&query.plan_sn) {
                    handle.post(ObssEvent::Client(frame)).await;
                    return;
                }
            }
        }
        KvBody::AppendPlan(_)
        | KvBody::AppendGwac(_)
        | KvBody::TakeImage(_)
        | KvBody::Abort
        | KvBody::Slew(_)
        | KvBody::Park
        | KvBody::Home
        | KvBody::Sync(_)
        | KvBody::Guide(_)
        | KvBody::Track
        | KvBody::TrackVel(_)
        | KvBody::Focus(_)
        | KvBody::FocusSync
        | KvBody::Fwhm(_)
        | KvBody::CamSet(_)
        | KvBody::Derot(_)
        | KvBody::Dome(_)
        | KvBody::MirrorCover(_)
        | KvBody::Filter(_)
        | KvBody::GeoSite(_) => {
            for handle in registry.all() {
                if handle.matches(&gid, &uid) {
                    handle.post(ObssEvent::Client(frame.clone())).await;
                }
            }
        }
        other => {
            warn!("unexpected record {} from client", other.type_str());
        }
    }
}

async fn on_closed(clients: &Pool, devices: &Pool, registry: &Registry, link: Link, peer: Peer) {
    if peer.is_client() {
        clients.pop(link.id());
        return;
    }
    devices.pop(link.id());
    // A dropped multiplexed endpoint takes the whole group down with it.
    match peer {
        Peer::MountGwac => {
            for handle in registry.all() {
                handle.post(ObssEvent::DecoupleMount(link.clone())).await;
            }
        }
        Peer::FocusGwac => {
            for handle in registry.all() {
                handle.post(ObssEvent::DecoupleFocus(link.clone())).await;
            }
        }
        _ => {}
    }
}

// ── Periodic tasks ────────────────────────────────────────────────────────────

/// Snapshot every unit and push mount, camera, focus and derotator records
/// to all connected clients.
async fn broadcast_status(clients: &Pool, registry: &Registry) {
    if clients.len() == 0 {
        return;
    }
    for handle in registry.all() {
        let snap = handle.snapshot().await;

        let mut env = Envelope::new(&handle.gid, &handle.uid);
        if !snap.mount_utc.is_empty() {
            env.utc = snap.mount_utc.clone();
        }
        let mount = KvFrame::new(env, KvBody::Mount(snap.mount.clone()));
        clients.broadcast(&mount.encode());

        for cam in &snap.cameras {
            let env = Envelope::with_cid(&handle.gid, &handle.uid, &cam.cid);
            let frame = KvFrame::new(env, KvBody::Camera(cam.info.clone()));
            clients.broadcast(&frame.encode());

            if let Some(pos) = cam.foc_pos {
                let mut env = Envelope::with_cid(&handle.gid, &handle.uid, &cam.cid);
                if !cam.foc_utc.is_empty() {
                    env.utc = cam.foc_utc.clone();
                }
                let frame = KvFrame::new(
                    env,
                    KvBody::Focus(FocusCmd {
                        op_type: 0,
                        state: cam.foc_state.code(),
                        rel_pos: 0,
                        pos,
                        pos_tar: cam.foc_tar.unwrap_or(FOCUS_UNKNOWN),
                    }),
                );
                clients.broadcast(&frame.encode());
            }

            if cam.derot_enabled {
                let mut env = Envelope::with_cid(&handle.gid, &handle.uid, &cam.cid);
                if !cam.derot_utc.is_empty() {
                    env.utc = cam.derot_utc.clone();
                }
                let frame = KvFrame::new(
                    env,
                    KvBody::Derot(DerotCmd {
                        op_type: 0,
                        command: -1,
                        state: cam.derot_state,
                        pos_tar: cam.derot_tar,
                        pos: cam.derot_pos,
                    }),
                );
                clients.broadcast(&frame.encode());
            }
        }
    }
}

/// Collect units whose every link is gone and whose idle clock has run out.
async fn sweep_idle(registry: &Registry) {
    let now = chrono::Utc::now();
    for handle in registry.all() {
        let snap = handle.snapshot().await;
        if snap.idle_secs(now) > GC_IDLE_SECS {
            info!(
                "observation system <{}:{}> idle for {}s, collecting",
                handle.gid,
                handle.uid,
                snap.idle_secs(now)
            );
            handle.stop();
            registry.remove(&handle.gid, &handle.uid);
        }
    }
}
