//! Observation system: the per-unit aggregate of one mount link, one focus
//! channel and N cameras, plus the plan currently driving them.
//!
//! ## Architecture
//!
//! All state lives on a single consumer task fed by the unit's message bus;
//! the dispatcher, socket read tasks and periodic workers only enqueue.
//! Alongside the consumer run two workers:
//! - the **plan worker** wakes on a new plan or every 10 s and nudges the
//!   consumer to start a cataloged plan or to abort one past its deadline;
//! - the **retransmit worker** (GWAC only) re-sends unacknowledged
//!   positional commands once per second, giving up after three retries.
//!
//! A read-side status snapshot is refreshed after every handled message so
//! the dispatcher's broadcast and GC tasks never touch live state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use obs_proto::gwac::GwacCommand;
use obs_proto::gwac::GwacEncoder;
use obs_proto::kv::{
    CamSet, CameraReport, Envelope, ExposeCmd, FocusCmd, FwhmReport, GuideCmd, KvBody, KvFrame,
    MountReport, ObsPlan, PlanReport, SlewCmd, SyncCmd, TrackVelCmd, FOCUS_UNKNOWN,
};
use obs_proto::types::{
    CoordSystem, GwacDevice, MountState, ObssType, PlanState, CAMERA_ERROR, CAMERA_IDLE,
    CAMERA_WAIT_FLAT, EXP_START, EXP_STOP,
};
use obs_proto::utc_now;

use crate::bus::{self, Bus};
use crate::net::{LineSink, Link, TcpLink};

/// Retries before an unacknowledged GWAC command is dropped.
const RETRY_MAX: u8 = 3;
/// Identical focus readings that close out a move.
const FOCUS_SETTLED_REPEATS: u32 = 3;
/// Slew suppressed when the new target is within this of the last one.
const SLEW_TOLERANCE_ARCSEC: f64 = 5.0;
/// Mount-vs-local clock skew worth a warning, checked every 200th sample.
const CLOCK_SKEW_WARN_SECS: i64 = 5;
const CLOCK_SKEW_SAMPLE: u64 = 200;
/// Seconds with no device link before the dispatcher may collect the unit.
pub const GC_IDLE_SECS: i64 = 300;

// ── Messages ──────────────────────────────────────────────────────────────────

/// Everything that can happen to an observation system. Mutation happens
/// only in the consumer of this bus.
#[derive(Debug)]
pub enum ObssEvent {
    /// A client verb addressed to this unit.
    Client(KvFrame),
    CoupleMount(Link),
    CoupleFocus(Link),
    CoupleCamera { link: Link, cid: String },
    DecoupleMount(Link),
    DecoupleFocus(Link),
    /// One digit of a GWAC group status frame.
    MountState(i32),
    MountPosition { ra: f64, dec: f64, utc: String },
    /// One channel of a GWAC focus frame.
    FocusPosition { cid: String, pos: i32 },
    /// A `...Rec...` acknowledgement quoting a command serial.
    Response { serial: u32 },
    /// A framed line from a device link this unit owns.
    DeviceLine { link: Link, line: String },
    DeviceClosed { link: Link },
    /// Plan worker tick.
    PlanTick,
    /// Every exposing camera is waiting for flat: re-point.
    FlatReslew,
    Quit,
}

// ── Matching ──────────────────────────────────────────────────────────────────

/// Empty-propagation matching rule: both empty matches everything, an empty
/// unit matches the whole group, otherwise both must agree. A unit match
/// without a group match is never accepted.
pub fn is_matched(own_gid: &str, own_uid: &str, gid: &str, uid: &str) -> bool {
    (gid.is_empty() && uid.is_empty())
        || (uid.is_empty() && gid.eq_ignore_ascii_case(own_gid))
        || (gid.eq_ignore_ascii_case(own_gid) && uid.eq_ignore_ascii_case(own_uid))
}

// ── Device links ──────────────────────────────────────────────────────────────

/// The mount and focuser links, shared with the retransmit worker. Locks
/// guard only the pointer swap.
#[derive(Debug, Default)]
pub struct DeviceLinks {
    mount: StdMutex<Option<Link>>,
    focus: StdMutex<Option<Link>>,
}

impl DeviceLinks {
    pub fn mount(&self) -> Option<Link> {
        self.mount.lock().unwrap().clone()
    }

    pub fn focus(&self) -> Option<Link> {
        self.focus.lock().unwrap().clone()
    }

    fn set_mount(&self, link: Option<Link>) {
        *self.mount.lock().unwrap() = link;
    }

    fn set_focus(&self, link: Option<Link>) {
        *self.focus.lock().unwrap() = link;
    }

    pub fn for_device(&self, device: GwacDevice) -> Option<Link> {
        match device {
            GwacDevice::Mount => self.mount(),
            GwacDevice::Focus => self.focus(),
        }
    }
}

// ── Retransmission ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingCmd {
    serial: u32,
    device: GwacDevice,
    retry: u8,
    line: String,
}

/// What the 1 s retransmit tick decided.
#[derive(Debug, PartialEq)]
pub enum RetryAction {
    Idle,
    Resend(GwacDevice, String),
    GaveUp(u32),
}

/// FIFO of outbound GWAC commands awaiting their `...Rec...` response.
/// Serials are strictly increasing modulo the encoder wrap.
#[derive(Debug, Default)]
pub struct RetransmitQueue {
    items: StdMutex<VecDeque<PendingCmd>>,
    notify: Notify,
}

impl RetransmitQueue {
    /// Queue a command; called before the bytes hit the wire so an instant
    /// response still finds its serial here.
    pub fn push(&self, cmd: &GwacCommand) {
        self.items.lock().unwrap().push_back(PendingCmd {
            serial: cmd.serial,
            device: cmd.device,
            retry: 0,
            line: cmd.line.clone(),
        });
        self.notify.notify_one();
    }

    /// Remove the entry a response acknowledged.
    pub fn pop_serial(&self, serial: u32) -> bool {
        let mut items = self.items.lock().unwrap();
        if let Some(at) = items.iter().position(|c| c.serial == serial) {
            items.remove(at);
            true
        } else {
            false
        }
    }

    /// Drop every pending command for one device; used when its link drops.
    pub fn clear_device(&self, device: GwacDevice) {
        self.items.lock().unwrap().retain(|c| c.device != device);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn pushed(&self) {
        self.notify.notified().await
    }

    /// One timeout tick: bump the head's retry count, drop it after
    /// [`RETRY_MAX`] attempts, otherwise hand back the bytes to resend.
    pub fn tick(&self) -> RetryAction {
        let mut items = self.items.lock().unwrap();
        let Some(head) = items.front_mut() else {
            return RetryAction::Idle;
        };
        head.retry += 1;
        if head.retry > RETRY_MAX {
            let serial = head.serial;
            items.pop_front();
            RetryAction::GaveUp(serial)
        } else {
            RetryAction::Resend(head.device, head.line.clone())
        }
    }
}

// ── Status snapshot ───────────────────────────────────────────────────────────

/// Focus sub-state of one camera channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusState {
    Idle,
    Moving,
    Unknown,
}

impl FocusState {
    /// Wire code used in the `focus` KV record.
    pub fn code(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Moving => 1,
            Self::Unknown => -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraSnapshot {
    pub cid: String,
    pub online: bool,
    pub info: CameraReport,
    pub foc_utc: String,
    pub foc_state: FocusState,
    pub foc_pos: Option<i32>,
    pub foc_tar: Option<i32>,
    pub derot_enabled: bool,
    pub derot_utc: String,
    pub derot_state: i32,
    pub derot_pos: f64,
    pub derot_tar: f64,
}

/// Read-side copy of a unit's state, refreshed after every handled message.
#[derive(Debug, Clone)]
pub struct ObssStatus {
    pub mount: MountReport,
    pub mount_utc: String,
    pub cameras: Vec<CameraSnapshot>,
    pub plan: PlanReport,
    pub links_online: usize,
    pub last_closed: DateTime<Utc>,
}

impl ObssStatus {
    /// Seconds since the last device link dropped; zero while any link is
    /// up. Input to the dispatcher's GC rule.
    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        if self.links_online > 0 {
            0
        } else {
            (now - self.last_closed).num_seconds()
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable face of one observation system, held by the dispatcher.
#[derive(Clone)]
pub struct ObssHandle {
    pub gid: String,
    pub uid: String,
    pub kind: ObssType,
    bus: Bus<ObssEvent>,
    status: Arc<RwLock<ObssStatus>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ObssHandle {
    pub fn matches(&self, gid: &str, uid: &str) -> bool {
        is_matched(&self.gid, &self.uid, gid, uid)
    }

    pub async fn post(&self, ev: ObssEvent) {
        self.bus.post(ev).await;
    }

    pub async fn snapshot(&self) -> ObssStatus {
        self.status.read().await.clone()
    }

    /// Stop sequence: workers first, then the bus consumer (which closes
    /// the device links it owns on its way out).
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.bus.send(ObssEvent::Quit);
    }
}

// ── Private state ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CameraSlot {
    cid: String,
    link: Option<Link>,
    info: CameraReport,
    foc_utc: String,
    foc_state: FocusState,
    foc_pos: Option<i32>,
    foc_tar: Option<i32>,
    repeat: u32,
    fwhm: f64,
    derot_enabled: bool,
    derot_utc: String,
    derot_state: i32,
    derot_pos: f64,
    derot_tar: f64,
    camset: Option<CamSet>,
}

impl CameraSlot {
    fn new(cid: &str) -> Self {
        Self {
            cid: cid.to_string(),
            link: None,
            info: CameraReport::default(),
            foc_utc: String::new(),
            foc_state: FocusState::Unknown,
            foc_pos: None,
            foc_tar: None,
            repeat: 0,
            fwhm: 0.0,
            derot_enabled: false,
            derot_utc: String::new(),
            derot_state: -1,
            derot_pos: 0.0,
            derot_tar: 0.0,
            camset: None,
        }
    }
}

struct Obss {
    gid: String,
    uid: String,
    kind: ObssType,
    bus: Bus<ObssEvent>,
    encoder: GwacEncoder,
    links: Arc<DeviceLinks>,
    rq: Arc<RetransmitQueue>,
    plan_gate: Arc<Notify>,
    cameras: Vec<CameraSlot>,
    mount: MountReport,
    mount_utc: String,
    /// Last commanded target; 1000° marks "no target".
    obj_ra: f64,
    obj_dec: f64,
    count_mount_pos: u64,
    plan: Option<ObsPlan>,
    /// True while the active plan came from `take_image`.
    manual_plan: bool,
    plan_status: PlanReport,
    plan_deadline: Option<DateTime<Utc>>,
    camonline: usize,
    exposing: usize,
    waitflat: usize,
    last_closed: DateTime<Utc>,
    old_day: u32,
    plan_seq: u32,
    plan_cb: mpsc::UnboundedSender<KvFrame>,
    status: Arc<RwLock<ObssStatus>>,
}

/// Launch one observation system: bus consumer, plan worker and (for GWAC)
/// the retransmit worker. Fails only on an unaddressable unit.
pub fn spawn(
    gid: &str,
    uid: &str,
    kind: ObssType,
    plan_cb: mpsc::UnboundedSender<KvFrame>,
) -> Option<ObssHandle> {
    if gid.is_empty() || uid.is_empty() {
        error!("failed to create observation system <{gid}:{uid}>");
        return None;
    }
    info!("observation system <{gid}:{uid}> created");

    let (bus_tx, mut bus_rx) = bus::channel::<ObssEvent>();
    let links = Arc::new(DeviceLinks::default());
    let rq = Arc::new(RetransmitQueue::default());
    let plan_gate = Arc::new(Notify::new());
    let (shutdown_tx, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);

    let status = Arc::new(RwLock::new(ObssStatus {
        mount: MountReport::default(),
        mount_utc: String::new(),
        cameras: Vec::new(),
        plan: PlanReport::default(),
        links_online: 0,
        last_closed: Utc::now(),
    }));

    let mut obss = Obss {
        gid: gid.to_string(),
        uid: uid.to_string(),
        kind,
        bus: bus_tx.clone(),
        encoder: GwacEncoder::new(gid, uid),
        links: links.clone(),
        rq: rq.clone(),
        plan_gate: plan_gate.clone(),
        cameras: Vec::new(),
        mount: MountReport::default(),
        mount_utc: String::new(),
        obj_ra: 1000.0,
        obj_dec: 1000.0,
        count_mount_pos: 0,
        plan: None,
        manual_plan: false,
        plan_status: PlanReport::default(),
        plan_deadline: None,
        camonline: 0,
        exposing: 0,
        waitflat: 0,
        last_closed: Utc::now(),
        old_day: 0,
        plan_seq: 0,
        plan_cb,
        status: status.clone(),
    };

    // Bus consumer: the only mutator.
    tokio::spawn(async move {
        while let Some(ev) = bus_rx.recv().await {
            let quit = matches!(ev, ObssEvent::Quit);
            obss.handle(ev).await;
            obss.publish_status().await;
            if quit {
                break;
            }
        }
    });

    // Plan worker: wakes on a new plan or every 10 s.
    {
        let gate = plan_gate;
        let bus = bus_tx.clone();
        let mut sd = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sd.changed() => break,
                    _ = gate.notified() => {}
                    _ = sleep(Duration::from_secs(10)) => {}
                }
                bus.post(ObssEvent::PlanTick).await;
            }
        });
    }

    // Retransmit worker: GWAC commands have no in-band ACK.
    if kind == ObssType::Gwac {
        let rq = rq.clone();
        let links = links.clone();
        let gid = gid.to_string();
        let uid = uid.to_string();
        let mut sd = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sd.changed() => break,
                    // A fresh push restarts the one-second wait.
                    _ = rq.pushed() => {}
                    _ = sleep(Duration::from_secs(1)) => {
                        match rq.tick() {
                            RetryAction::Idle => {}
                            RetryAction::Resend(device, line) => {
                                if let Some(link) = links.for_device(device) {
                                    link.send_line(&line);
                                }
                            }
                            RetryAction::GaveUp(serial) => {
                                warn!("OBSS<{gid}:{uid}> gave up on command {serial:05} after {RETRY_MAX} retries");
                            }
                        }
                    }
                }
            }
        });
    }

    Some(ObssHandle {
        gid: gid.to_string(),
        uid: uid.to_string(),
        kind,
        bus: bus_tx,
        status,
        shutdown,
    })
}

// ── Event handling ────────────────────────────────────────────────────────────

impl Obss {
    async fn handle(&mut self, ev: ObssEvent) {
        match ev {
            ObssEvent::Client(frame) => self.on_client(frame).await,
            ObssEvent::CoupleMount(link) => self.couple_mount(link),
            ObssEvent::CoupleFocus(link) => self.couple_focus(link),
            ObssEvent::CoupleCamera { link, cid } => self.couple_camera(link, &cid),
            ObssEvent::DecoupleMount(link) => self.decouple_mount(&link),
            ObssEvent::DecoupleFocus(link) => self.decouple_focus(&link),
            ObssEvent::MountState(state) => self.notify_mount_state(state),
            ObssEvent::MountPosition { ra, dec, utc } => self.notify_mount_position(ra, dec, &utc),
            ObssEvent::FocusPosition { cid, pos } => self.notify_focus(&cid, pos),
            ObssEvent::Response { serial } => {
                self.rq.pop_serial(serial);
            }
            ObssEvent::DeviceLine { link, line } => self.on_device_line(link, &line).await,
            ObssEvent::DeviceClosed { link } => self.on_device_closed(&link),
            ObssEvent::PlanTick => self.on_plan_tick(),
            ObssEvent::FlatReslew => self.on_flat_reslew(),
            ObssEvent::Quit => self.on_quit(),
        }
    }

    async fn on_client(&mut self, frame: KvFrame) {
        let ty = frame.body.type_str();
        let env = frame.env;
        match frame.body {
            KvBody::AppendPlan(plan) | KvBody::AppendGwac(plan) => self.notify_plan(plan),
            KvBody::TakeImage(plan) => self.take_image(plan, &env.cid),
            KvBody::Abort => self.abort(),
            KvBody::RemovePlan(q) => {
                self.remove_plan(&q.plan_sn);
            }
            KvBody::Slew(cmd) => self.slewto(&cmd),
            KvBody::Park => self.park(),
            KvBody::Home => self.find_home(),
            KvBody::Sync(cmd) => self.home_sync(&cmd),
            KvBody::Guide(cmd) => self.guide(&cmd),
            KvBody::Track => self.track(),
            KvBody::TrackVel(cmd) => self.track_vel(&cmd),
            KvBody::Focus(cmd) => self.focus(&env.cid, &cmd),
            KvBody::FocusSync => self.focus_sync(&env.cid),
            KvBody::Fwhm(report) => self.notify_fwhm(&env.cid, &report),
            KvBody::CamSet(_)
            | KvBody::Derot(_)
            | KvBody::Dome(_)
            | KvBody::MirrorCover(_)
            | KvBody::Filter(_)
            | KvBody::GeoSite(_) => {
                debug!("OBSS<{}:{}> ignores auxiliary verb {ty}", self.gid, self.uid);
            }
            _ => {
                warn!(
                    "OBSS<{}:{}> unexpected client record {ty}",
                    self.gid, self.uid
                );
            }
        }
    }

    // ── Coupling ─────────────────────────────────────────────────────────────

    fn couple_mount(&mut self, link: Link) {
        let current = self.links.mount();
        match self.kind {
            ObssType::Gwac => {
                // Re-bind on every status frame is idempotent; only a new
                // endpoint resets the state machine.
                if current.as_ref().map(|l| TcpLink::id(l)) != Some(link.id()) {
                    info!("Mount<{}:{}> is on-line", self.gid, self.uid);
                    self.links.set_mount(Some(link));
                    self.count_mount_pos = 0;
                    self.mount.state = -1;
                }
            }
            ObssType::Gft => {
                if current.is_none() {
                    info!("Mount<{}:{}> is on-line", self.gid, self.uid);
                    // This unit owns the frame stream from now on.
                    link.retarget(LineSink::Obss(self.bus.clone()));
                    self.links.set_mount(Some(link));
                    self.count_mount_pos = 0;
                    self.mount.state = -1;
                }
            }
        }
    }

    fn decouple_mount(&mut self, link: &Link) {
        if self.links.mount().map(|l| l.id()) == Some(link.id()) {
            info!("Mount<{}:{}> is off-line", self.gid, self.uid);
            self.links.set_mount(None);
            self.mount.state = MountState::Error as i32;
            self.mount.errcode = 1;
            self.rq.clear_device(GwacDevice::Mount);
            self.last_closed = Utc::now();
        }
    }

    fn couple_focus(&mut self, link: Link) {
        if self.links.focus().map(|l| l.id()) != Some(link.id()) {
            info!("Focuser<{}:{}> is on-line", self.gid, self.uid);
            self.links.set_focus(Some(link));
        }
    }

    fn decouple_focus(&mut self, link: &Link) {
        if self.links.focus().map(|l| l.id()) == Some(link.id()) {
            info!("Focuser<{}:{}> is off-line", self.gid, self.uid);
            self.links.set_focus(None);
            self.rq.clear_device(GwacDevice::Focus);
            self.last_closed = Utc::now();
        }
    }

    fn couple_camera(&mut self, link: Link, cid: &str) {
        let mut found = false;
        if let Some(slot) = self
            .cameras
            .iter_mut()
            .find(|c| c.cid.eq_ignore_ascii_case(cid))
        {
            if slot.link.is_some() {
                error!(
                    "OBSS<{}:{}> already owns camera <{}>, rejecting duplicate",
                    self.gid, self.uid, cid
                );
                link.close();
                return;
            }
            found = true;
            slot.link = Some(link.clone());
            // A settled focus position is replayed so the camera header
            // carries it from the first frame.
            if slot.foc_state == FocusState::Idle {
                if let Some(pos) = slot.foc_pos {
                    let frame = KvFrame::new(
                        Envelope::with_cid(&self.gid, &self.uid, cid),
                        KvBody::Focus(FocusCmd {
                            op_type: 0,
                            state: FocusState::Idle.code(),
                            rel_pos: 0,
                            pos,
                            pos_tar: slot.foc_tar.unwrap_or(FOCUS_UNKNOWN),
                        }),
                    );
                    link.send_line(&frame.encode());
                }
            }
        }

        info!("Camera<{}:{}:{}> is on-line", self.gid, self.uid, cid);
        self.camonline += 1;
        if !found {
            let mut slot = CameraSlot::new(cid);
            slot.link = Some(link.clone());
            self.cameras.push(slot);
        }
        link.retarget(LineSink::Obss(self.bus.clone()));

        // Mid-sequence recovery: a camera rejoining a running plan resumes
        // from the highest frame number any sibling has reached.
        if found && self.plan.is_some() {
            let plan = self.plan.clone().unwrap();
            let frame = KvFrame::new(
                Envelope::new(&self.gid, &self.uid),
                KvBody::AppendGwac(plan),
            );
            link.send_line(&frame.encode());
            if self.mount.state == MountState::Tracking as i32 {
                let frmno = self.cameras.iter().map(|c| c.info.frmno).max().unwrap_or(0);
                self.expose_cameras(EXP_START, frmno.max(0), Some(cid));
            }
        }
    }

    fn on_device_closed(&mut self, link: &Link) {
        if self.links.mount().map(|l| l.id()) == Some(link.id()) {
            self.decouple_mount(link);
            return;
        }
        if let Some(slot) = self
            .cameras
            .iter_mut()
            .find(|c| c.link.as_ref().map(|l| l.id()) == Some(link.id()))
        {
            info!(
                "Camera<{}:{}:{}> is off-line",
                self.gid, self.uid, slot.cid
            );
            if slot.info.state > CAMERA_IDLE {
                self.exposing = self.exposing.saturating_sub(1);
            }
            self.camonline = self.camonline.saturating_sub(1);
            slot.info.state = CAMERA_ERROR;
            slot.info.errcode = 1;
            slot.link = None;
            self.last_closed = Utc::now();
        }
    }

    // ── Device-initiated notifications ───────────────────────────────────────

    fn notify_mount_state(&mut self, state: i32) {
        if state == self.mount.state {
            return;
        }
        let Some(new_state) = MountState::from_code(state) else {
            warn!(
                "Mount<{}:{}> received undefined state [{state}]",
                self.gid, self.uid
            );
            return;
        };
        info!("Mount<{}:{}> state is {new_state}", self.gid, self.uid);

        if new_state == MountState::Tracking && self.mount.state >= 0 {
            info!(
                "Mount<{}:{}> arrived at <{:.4}, {:.4}> degree",
                self.gid, self.uid, self.mount.ra, self.mount.dec
            );
            if self.plan.is_some() {
                if self.mount.state == MountState::Guiding as i32 {
                    // Guiding converged: tell the cameras the field is final.
                    let frame = KvFrame::new(
                        Envelope::new(&self.gid, &self.uid),
                        KvBody::Guide(GuideCmd::default()),
                    );
                    self.write_cameras(&frame.encode(), None);
                } else {
                    self.expose_cameras(EXP_START, 0, None);
                }
            }
        }
        self.mount.state = state;
        self.mount.errcode = 0;
        self.mount_utc = utc_now();
    }

    fn notify_mount_position(&mut self, ra: f64, dec: f64, utc: &str) {
        self.mount.ra = ra;
        self.mount.dec = dec;
        if self.count_mount_pos % CLOCK_SKEW_SAMPLE == 0 {
            if let Ok(reported) = NaiveDateTime::parse_from_str(utc, "%Y-%m-%dT%H:%M:%S") {
                let bias = (reported.and_utc() - Utc::now()).num_seconds();
                if bias.abs() >= CLOCK_SKEW_WARN_SECS {
                    warn!(
                        "Mount<{}:{}> clock is {} by {} seconds",
                        self.gid,
                        self.uid,
                        if bias > 0 { "fast" } else { "slow" },
                        bias.abs()
                    );
                }
            }
        }
        self.count_mount_pos += 1;
    }

    fn notify_focus(&mut self, cid: &str, pos: i32) {
        let gid = self.gid.clone();
        let uid = self.uid.clone();
        let Some(slot) = self
            .cameras
            .iter_mut()
            .find(|c| c.cid.eq_ignore_ascii_case(cid))
        else {
            // Channels without a camera are legal; the frame always carries
            // all five.
            return;
        };
        let state0 = slot.foc_state;
        slot.foc_utc = utc_now();

        if slot.foc_pos != Some(pos) {
            slot.foc_pos = Some(pos);
            slot.repeat = 0;
            if slot.foc_state == FocusState::Unknown {
                slot.foc_tar = Some(pos);
            }
        } else if slot.foc_state != FocusState::Idle {
            slot.repeat += 1;
            if slot.repeat >= FOCUS_SETTLED_REPEATS {
                if slot.foc_state == FocusState::Moving && slot.foc_tar != Some(pos) {
                    warn!(
                        "Focus<{gid}:{uid}:{cid}> position <{pos}> differs from target <{}>",
                        slot.foc_tar.map_or(FOCUS_UNKNOWN, |t| t)
                    );
                }
                slot.foc_state = FocusState::Idle;
                let frame = KvFrame::new(
                    Envelope::with_cid(&gid, &uid, cid),
                    KvBody::Focus(FocusCmd {
                        op_type: 0,
                        state: FocusState::Idle.code(),
                        rel_pos: 0,
                        pos,
                        pos_tar: slot.foc_tar.unwrap_or(pos),
                    }),
                );
                if let Some(link) = &slot.link {
                    link.send_line(&frame.encode());
                }
            }
        }
        if state0 != slot.foc_state {
            info!("Focus<{gid}:{uid}:{cid}> position is {pos}");
        }
    }

    async fn on_device_line(&mut self, link: Link, line: &str) {
        let frame = match KvFrame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    "undefined protocol from device of OBSS<{}:{}>: {e}",
                    self.gid, self.uid
                );
                link.close();
                return;
            }
        };
        if self.links.mount().map(|l| l.id()) == Some(link.id()) {
            self.on_mount_report(&frame);
            return;
        }
        let Some(at) = self
            .cameras
            .iter()
            .position(|c| c.link.as_ref().map(|l| l.id()) == Some(link.id()))
        else {
            return;
        };
        match frame.body {
            KvBody::Camera(report) => self.on_camera_report(at, report).await,
            KvBody::CamSet(camset) => self.cameras[at].camset = Some(camset),
            _ => {}
        }
    }

    /// Status from a GFT mount: position and timing ride in the same record
    /// as the state code.
    fn on_mount_report(&mut self, frame: &KvFrame) {
        let KvBody::Mount(m) = &frame.body else {
            return;
        };
        self.mount.mjd = m.mjd;
        self.mount.lst = m.lst;
        self.mount.ra2k = m.ra2k;
        self.mount.dec2k = m.dec2k;
        self.mount.azi = m.azi;
        self.mount.ele = m.ele;
        self.notify_mount_position(m.ra, m.dec, &frame.env.utc);
        self.notify_mount_state(m.state);
    }

    async fn on_camera_report(&mut self, at: usize, report: CameraReport) {
        let state_old = self.cameras[at].info.state;
        let state_new = report.state;
        self.cameras[at].info = report;

        if state_new == state_old {
            return;
        }
        if state_new <= CAMERA_IDLE && state_old > CAMERA_IDLE {
            self.exposing = self.exposing.saturating_sub(1);
            if self.exposing == 0 {
                if let Some(plan) = self.plan.take() {
                    info!("plan <{}> is over", plan.plan_sn);
                    self.manual_plan = false;
                    self.plan_status.tm_stop = utc_now();
                    self.plan_status.state = PlanState::Over;
                    self.emit_plan_status();
                }
            }
        } else if state_new > CAMERA_IDLE && state_old <= CAMERA_IDLE {
            self.exposing += 1;
        } else if state_new == CAMERA_WAIT_FLAT {
            self.waitflat += 1;
            if self.exposing > 0 && self.exposing == self.waitflat {
                // Every exposing camera is parked on the flat gate; queue a
                // re-pointing pass behind whatever is already in flight.
                self.bus.post(ObssEvent::FlatReslew).await;
            }
        } else if state_old == CAMERA_WAIT_FLAT {
            self.waitflat = self.waitflat.saturating_sub(1);
        }
    }

    fn on_flat_reslew(&mut self) {
        // TODO: derive a fresh flat-field pointing from the site's sidereal
        // time instead of holding the current field.
        info!(
            "OBSS<{}:{}> flat re-pointing requested by {} waiting cameras",
            self.gid, self.uid, self.waitflat
        );
    }

    // ── Client verbs ─────────────────────────────────────────────────────────

    fn notify_plan(&mut self, plan: ObsPlan) {
        info!(
            "new plan <{}> for OBSS<{}:{}>: imgtype={}, exptime={}, frmcnt={}",
            plan.plan_sn, self.gid, self.uid, plan.imgtype, plan.exptime, plan.frmcnt
        );
        if self.plan.is_some() && self.manual_plan && self.exposing > 0 {
            warn!(
                "OBSS<{}:{}> rejects plan <{}>: manual exposure in flight",
                self.gid, self.uid, plan.plan_sn
            );
            return;
        }
        if self.plan.is_some() {
            self.abort();
        }
        self.plan_deadline = parse_plan_time(&plan.plan_end);
        self.plan_status = PlanReport {
            plan_sn: plan.plan_sn.clone(),
            tm_start: String::new(),
            tm_stop: String::new(),
            state: PlanState::Cataloged,
        };
        self.plan = Some(plan);
        self.manual_plan = false;
        self.emit_plan_status();
        self.plan_gate.notify_one();
    }

    fn on_plan_tick(&mut self) {
        match self.plan_status.state {
            PlanState::Cataloged if self.plan.is_some() => {
                if let Some(deadline) = self.plan_deadline {
                    if Utc::now() > deadline {
                        let plan = self.plan.take().unwrap();
                        warn!("plan <{}> expired before it could start", plan.plan_sn);
                        self.plan_status.tm_stop = utc_now();
                        self.plan_status.state = PlanState::Abandoned;
                        self.emit_plan_status();
                        return;
                    }
                }
                let ready =
                    self.links.mount().is_some() && self.camonline > 0 && self.exposing == 0;
                if ready {
                    self.process_new_plan();
                }
            }
            PlanState::Running if self.plan.is_some() => {
                if let Some(deadline) = self.plan_deadline {
                    let exptime = self.plan.as_ref().map_or(0.0, |p| p.exptime);
                    let grace = ChronoDuration::milliseconds((exptime * 1000.0) as i64);
                    if Utc::now() > deadline + grace {
                        warn!(
                            "plan <{}> ran past its deadline, aborting",
                            self.plan_status.plan_sn
                        );
                        self.abort();
                    }
                }
            }
            _ => {}
        }
    }

    fn process_new_plan(&mut self) {
        let Some(plan) = self.plan.clone() else {
            return;
        };
        let mut slew_req =
            !(plan.imgtype.eq_ignore_ascii_case("bias") || plan.imgtype.eq_ignore_ascii_case("dark"));
        if slew_req {
            let err_ra = (plan.ra - self.obj_ra) * 3600.0;
            let err_dec = (plan.dec - self.obj_dec) * 3600.0;
            slew_req = err_ra.abs() > SLEW_TOLERANCE_ARCSEC || err_dec.abs() > SLEW_TOLERANCE_ARCSEC;
        }
        if slew_req {
            info!(
                "plan <{}> in OBSS<{}:{}> slews to <{:.4} {:.4}>",
                plan.plan_sn, self.gid, self.uid, plan.ra, plan.dec
            );
            self.send_slew(plan.ra, plan.dec);
        }

        // Cameras get the plan description either way; without a slew the
        // exposure starts immediately.
        let desc = KvFrame::new(
            Envelope::new(&self.gid, &self.uid),
            KvBody::AppendGwac(plan),
        );
        self.write_cameras(&desc.encode(), None);
        if !slew_req {
            self.expose_cameras(EXP_START, 0, None);
        }

        self.plan_status.tm_start = utc_now();
        self.plan_status.state = PlanState::Running;
        self.emit_plan_status();
    }

    fn remove_plan(&mut self, plan_sn: &str) -> bool {
        if !self.plan_status.plan_sn.eq_ignore_ascii_case(plan_sn) {
            return false;
        }
        if self.plan.take().is_some() {
            info!("plan <{plan_sn}> is deleted");
            self.manual_plan = false;
            self.plan_status.tm_stop = utc_now();
            self.plan_status.state = PlanState::Deleted;
            self.emit_plan_status();
        }
        true
    }

    fn abort(&mut self) {
        info!("abort OBSS<{}:{}> current operations", self.gid, self.uid);
        if let Some(mount) = self.links.mount() {
            match self.kind {
                ObssType::Gwac => {
                    let cmd = self.encoder.abort_slew();
                    self.send_mount_cmd(cmd, &mount);
                }
                ObssType::Gft => {
                    let frame =
                        KvFrame::new(Envelope::new(&self.gid, &self.uid), KvBody::Abort);
                    mount.send_line(&frame.encode());
                }
            }
            self.obj_ra = 1000.0;
            self.obj_dec = 1000.0;
        }
        if self.exposing > 0 {
            self.expose_cameras(EXP_STOP, 0, None);
        }
        if let Some(plan) = self.plan.take() {
            info!("plan <{}> is aborted", plan.plan_sn);
            self.manual_plan = false;
            self.plan_status.tm_stop = utc_now();
            self.plan_status.state = PlanState::Interrupted;
            self.emit_plan_status();
        }
    }

    fn slewto(&mut self, cmd: &SlewCmd) {
        if let Some(plan) = &self.plan {
            warn!(
                "plan <{}> in OBSS<{}:{}> rejects command slew",
                plan.plan_sn, self.gid, self.uid
            );
            return;
        }
        let Some(mount) = self.links.mount() else {
            warn!("Mount<{}:{}> is off-line, slew rejected", self.gid, self.uid);
            return;
        };
        match self.kind {
            ObssType::Gwac => {
                if cmd.coorsys != CoordSystem::Equatorial {
                    warn!(
                        "Mount<{}:{}> only slews equatorial targets",
                        self.gid, self.uid
                    );
                    return;
                }
                info!(
                    "Mount<{}:{}> points to <{:.4}, {:.4}> degree",
                    self.gid, self.uid, cmd.ra, cmd.dec
                );
                let wire = self.encoder.slew(cmd.ra, cmd.dec);
                self.send_mount_cmd(wire, &mount);
            }
            ObssType::Gft => {
                info!(
                    "Mount<{}:{}> points to <{:.4}, {:.4}> degree",
                    self.gid, self.uid, cmd.ra, cmd.dec
                );
                let frame = KvFrame::new(
                    Envelope::new(&self.gid, &self.uid),
                    KvBody::Slew(cmd.clone()),
                );
                mount.send_line(&frame.encode());
            }
        }
        if cmd.coorsys == CoordSystem::Equatorial {
            self.obj_ra = cmd.ra;
            self.obj_dec = cmd.dec;
        }
    }

    fn park(&mut self) {
        info!("parking Mount<{}:{}>", self.gid, self.uid);
        if let Some(mount) = self.links.mount() {
            let busy_parking = self.mount.state == MountState::Parking as i32
                || self.mount.state == MountState::Parked as i32;
            if !busy_parking {
                match self.kind {
                    ObssType::Gwac => {
                        let cmd = self.encoder.park();
                        self.send_mount_cmd(cmd, &mount);
                    }
                    ObssType::Gft => {
                        let frame =
                            KvFrame::new(Envelope::new(&self.gid, &self.uid), KvBody::Park);
                        mount.send_line(&frame.encode());
                    }
                }
                self.obj_ra = 1000.0;
                self.obj_dec = 1000.0;
            }
        }
        if self.exposing > 0 {
            info!("abort exposing <{}:{}>", self.gid, self.uid);
            self.expose_cameras(EXP_STOP, 0, None);
        }
        if let Some(plan) = self.plan.take() {
            info!("plan <{}> is aborted", plan.plan_sn);
            self.manual_plan = false;
            self.plan_status.tm_stop = utc_now();
            self.plan_status.state = PlanState::Interrupted;
            self.emit_plan_status();
        }
    }

    fn find_home(&mut self) {
        let Some(mount) = self.links.mount() else {
            warn!("Mount<{}:{}> is off-line, home rejected", self.gid, self.uid);
            return;
        };
        info!("Mount<{}:{}> finds home", self.gid, self.uid);
        match self.kind {
            ObssType::Gwac => {
                let cmd = self.encoder.find_home(true, true);
                self.send_mount_cmd(cmd, &mount);
            }
            ObssType::Gft => {
                let frame = KvFrame::new(Envelope::new(&self.gid, &self.uid), KvBody::Home);
                mount.send_line(&frame.encode());
            }
        }
        self.obj_ra = 1000.0;
        self.obj_dec = 1000.0;
    }

    fn home_sync(&mut self, cmd: &SyncCmd) {
        let Some(mount) = self.links.mount() else {
            warn!("Mount<{}:{}> is off-line, sync rejected", self.gid, self.uid);
            return;
        };
        info!(
            "Mount<{}:{}> syncs home to <{:.4} {:.4}>",
            self.gid, self.uid, cmd.ra, cmd.dec
        );
        match self.kind {
            ObssType::Gwac => {
                let wire = self.encoder.home_sync(cmd.ra, cmd.dec);
                self.send_mount_cmd(wire, &mount);
            }
            ObssType::Gft => {
                let frame = KvFrame::new(
                    Envelope::new(&self.gid, &self.uid),
                    KvBody::Sync(cmd.clone()),
                );
                mount.send_line(&frame.encode());
            }
        }
    }

    fn guide(&mut self, cmd: &GuideCmd) {
        info!(
            "Guide<{}:{}>: result = {}, op = {}, ra = {}, dec = {}",
            self.gid, self.uid, cmd.result, cmd.op, cmd.ra, cmd.dec
        );
        if cmd.result == 0 {
            if let Some(mount) = self.links.mount() {
                match self.kind {
                    ObssType::Gwac => {
                        let wire = self.encoder.guide(cmd.ra, cmd.dec);
                        self.send_mount_cmd(wire, &mount);
                    }
                    ObssType::Gft => {
                        let frame = KvFrame::new(
                            Envelope::new(&self.gid, &self.uid),
                            KvBody::Guide(cmd.clone()),
                        );
                        mount.send_line(&frame.encode());
                    }
                }
            }
        }
        // Cameras learn whether guiding is starting or already done.
        let mut fwd = cmd.clone();
        fwd.op = if cmd.result != 0 { 0 } else { 1 };
        let frame = KvFrame::new(Envelope::new(&self.gid, &self.uid), KvBody::Guide(fwd));
        self.write_cameras(&frame.encode(), None);
    }

    fn track(&mut self) {
        let Some(mount) = self.links.mount() else {
            warn!("Mount<{}:{}> is off-line, track rejected", self.gid, self.uid);
            return;
        };
        if self.kind == ObssType::Gft {
            warn!("Mount<{}:{}> does not support track", self.gid, self.uid);
            return;
        }
        let stationary = MountState::from_code(self.mount.state)
            .map(MountState::is_stationary)
            .unwrap_or(false);
        if !stationary {
            warn!(
                "Mount<{}:{}> must be stationary before tracking",
                self.gid, self.uid
            );
            return;
        }
        info!("Mount<{}:{}> starts tracking", self.gid, self.uid);
        let cmd = self.encoder.track();
        self.send_mount_cmd(cmd, &mount);
    }

    fn track_vel(&mut self, cmd: &TrackVelCmd) {
        let Some(mount) = self.links.mount() else {
            warn!(
                "Mount<{}:{}> is off-line, trackvel rejected",
                self.gid, self.uid
            );
            return;
        };
        if self.kind == ObssType::Gft {
            warn!("Mount<{}:{}> does not support trackvel", self.gid, self.uid);
            return;
        }
        if self.mount.state != MountState::Tracking as i32 {
            warn!(
                "Mount<{}:{}> must be tracking before a rate change",
                self.gid, self.uid
            );
            return;
        }
        info!(
            "Mount<{}:{}> track rate <{:.4} {:.4}>",
            self.gid, self.uid, cmd.ra, cmd.dec
        );
        let wire = self.encoder.track_vel(cmd.ra, cmd.dec);
        self.send_mount_cmd(wire, &mount);
    }

    fn take_image(&mut self, mut plan: ObsPlan, cid: &str) {
        if let Some(active) = &self.plan {
            warn!(
                "plan <{}> in OBSS<{}:{}> rejects take_image",
                active.plan_sn, self.gid, self.uid
            );
            return;
        }
        if plan.plan_sn.is_empty() {
            plan.plan_sn = take_image_serial(
                &self.gid,
                &self.uid,
                Utc::now().date_naive(),
                &mut self.old_day,
                &mut self.plan_seq,
            );
        }
        if plan.exptime < 0.0 {
            plan.exptime = 0.0;
        }
        if plan.imgtype.is_empty() {
            plan.imgtype = if plan.exptime == 0.0 { "bias" } else { "object" }.to_string();
        }
        if plan.objid.is_empty() {
            plan.objid = plan.imgtype.clone();
        }
        if plan.frmcnt <= 0 {
            plan.frmcnt = 1;
        }
        info!(
            "TakeImage<{}:{}>: imgtype = {}, exptime = {:.3}, frmcnt = {}",
            self.gid, self.uid, plan.imgtype, plan.exptime, plan.frmcnt
        );

        // The camera sees an ordinary plan description.
        let desc = KvFrame::new(
            Envelope::new(&self.gid, &self.uid),
            KvBody::AppendGwac(plan.clone()),
        );
        let cid_filter = (!cid.is_empty()).then_some(cid);
        self.write_cameras(&desc.encode(), cid_filter);
        self.expose_cameras(EXP_START, 0, cid_filter);

        self.plan_status = PlanReport {
            plan_sn: plan.plan_sn.clone(),
            tm_start: utc_now(),
            tm_stop: String::new(),
            state: PlanState::Running,
        };
        self.plan_deadline = parse_plan_time(&plan.plan_end);
        self.plan = Some(plan);
        self.manual_plan = true;
        self.emit_plan_status();
    }

    fn focus(&mut self, cid: &str, cmd: &FocusCmd) {
        info!(
            "Focus<{}:{}:{cid}>: optype = {}, relpos = {}",
            self.gid, self.uid, cmd.op_type, cmd.rel_pos
        );
        let Some(focus) = self.links.focus() else {
            error!("Focuser<{}:{}> is not on-line", self.gid, self.uid);
            return;
        };
        if cmd.op_type != 1 || cmd.rel_pos == 0 {
            return;
        }
        let gid = self.gid.clone();
        let uid = self.uid.clone();
        let Some(slot) = self
            .cameras
            .iter_mut()
            .find(|c| c.cid.eq_ignore_ascii_case(cid))
        else {
            error!("Camera<{gid}:{uid}:{cid}> off-line rejects focus");
            return;
        };
        let pos_now = slot.foc_pos;
        slot.foc_tar = pos_now.map(|p| p + cmd.rel_pos);
        slot.foc_state = FocusState::Moving;
        slot.repeat = 0;
        info!(
            "Focus<{gid}:{uid}:{cid}> moves from <{}> to <{}>",
            pos_now.map_or(FOCUS_UNKNOWN, |p| p),
            slot.foc_tar.map_or(FOCUS_UNKNOWN, |t| t)
        );
        let wire = self.encoder.focus(cid, cmd.rel_pos);
        self.rq.push(&wire);
        focus.send_line(&wire.line);
    }

    fn focus_sync(&mut self, cid: &str) {
        let Some(focus) = self.links.focus() else {
            error!("Focuser<{}:{}> is not on-line", self.gid, self.uid);
            return;
        };
        let targets: Vec<String> = self
            .cameras
            .iter()
            .filter(|c| cid.is_empty() || c.cid.eq_ignore_ascii_case(cid))
            .map(|c| c.cid.clone())
            .collect();
        for cam_cid in targets {
            info!("Focus<{}:{}:{cam_cid}> re-zeroes", self.gid, self.uid);
            if let Some(slot) = self
                .cameras
                .iter_mut()
                .find(|c| c.cid.eq_ignore_ascii_case(&cam_cid))
            {
                slot.foc_state = FocusState::Unknown;
            }
            let wire = self.encoder.focus_sync(&cam_cid);
            self.rq.push(&wire);
            focus.send_line(&wire.line);
        }
    }

    fn notify_fwhm(&mut self, cid: &str, report: &FwhmReport) {
        let Some(focus) = self.links.focus() else {
            error!("Focuser<{}:{}> is not on-line", self.gid, self.uid);
            return;
        };
        if cid.is_empty() {
            warn!("fwhm for OBSS<{}:{}> without camera id", self.gid, self.uid);
            return;
        }
        let Ok(tmimg) = NaiveDateTime::parse_from_str(&report.tmimg, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(&report.tmimg, "%Y-%m-%dT%H:%M:%S"))
        else {
            warn!(
                "fwhm for Camera<{}:{}:{cid}> carries bad image time <{}>",
                self.gid, self.uid, report.tmimg
            );
            return;
        };
        let gid = self.gid.clone();
        let uid = self.uid.clone();
        let Some(slot) = self
            .cameras
            .iter_mut()
            .find(|c| c.cid.eq_ignore_ascii_case(cid))
        else {
            warn!("fwhm for unknown Camera<{gid}:{uid}:{cid}>");
            return;
        };
        if (slot.fwhm - report.fwhm).abs() < 1e-6 {
            return;
        }
        slot.fwhm = report.fwhm;
        debug!("Fwhm<{gid}:{uid}:{cid}> = {:.3}", report.fwhm);
        let wire = self.encoder.fwhm(cid, report.fwhm, tmimg);
        self.rq.push(&wire);
        focus.send_line(&wire.line);
    }

    // ── Outbound helpers ─────────────────────────────────────────────────────

    /// GWAC mount command: queued for retransmission before the wire write
    /// so an instant response still finds the serial.
    fn send_mount_cmd(&mut self, cmd: GwacCommand, mount: &Link) {
        self.rq.push(&cmd);
        mount.send_line(&cmd.line);
    }

    fn send_slew(&mut self, ra: f64, dec: f64) {
        if let Some(mount) = self.links.mount() {
            match self.kind {
                ObssType::Gwac => {
                    let cmd = self.encoder.slew(ra, dec);
                    self.send_mount_cmd(cmd, &mount);
                }
                ObssType::Gft => {
                    let frame = KvFrame::new(
                        Envelope::new(&self.gid, &self.uid),
                        KvBody::Slew(SlewCmd {
                            ra,
                            dec,
                            ..Default::default()
                        }),
                    );
                    mount.send_line(&frame.encode());
                }
            }
            self.obj_ra = ra;
            self.obj_dec = dec;
        }
    }

    fn write_cameras(&self, line: &str, cid: Option<&str>) {
        for slot in &self.cameras {
            let matched = cid.map_or(true, |c| slot.cid.eq_ignore_ascii_case(c));
            if !matched {
                continue;
            }
            if let Some(link) = &slot.link {
                link.send_line(line);
            }
            if cid.is_some() {
                break;
            }
        }
    }

    fn expose_cameras(&self, command: i32, frmno: i32, cid: Option<&str>) {
        let mut env = Envelope::new(&self.gid, &self.uid);
        if let Some(c) = cid {
            env.cid = c.to_string();
        }
        let frame = KvFrame::new(
            env,
            KvBody::Expose(ExposeCmd {
                command,
                frmno,
                loopno: 0,
            }),
        );
        self.write_cameras(&frame.encode(), cid);
    }

    fn emit_plan_status(&self) {
        let frame = KvFrame::new(
            Envelope::new(&self.gid, &self.uid),
            KvBody::Plan(self.plan_status.clone()),
        );
        let _ = self.plan_cb.send(frame);
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn on_quit(&mut self) {
        // Shared GWAC endpoints stay alive for sibling units; only links
        // whose frame stream this unit owns are closed here.
        for slot in &mut self.cameras {
            if let Some(link) = slot.link.take() {
                link.close();
            }
        }
        if self.kind == ObssType::Gft {
            if let Some(mount) = self.links.mount() {
                mount.close();
            }
        }
        self.links.set_mount(None);
        self.links.set_focus(None);
        info!("observation system <{}:{}> stopped", self.gid, self.uid);
    }

    async fn publish_status(&self) {
        let links_online = self.links.mount().is_some() as usize
            + self.links.focus().is_some() as usize
            + self.cameras.iter().filter(|c| c.link.is_some()).count();
        let cameras = self
            .cameras
            .iter()
            .map(|c| CameraSnapshot {
                cid: c.cid.clone(),
                online: c.link.is_some(),
                info: c.info.clone(),
                foc_utc: c.foc_utc.clone(),
                foc_state: c.foc_state,
                foc_pos: c.foc_pos,
                foc_tar: c.foc_tar,
                derot_enabled: c.derot_enabled,
                derot_utc: c.derot_utc.clone(),
                derot_state: c.derot_state,
                derot_pos: c.derot_pos,
                derot_tar: c.derot_tar,
            })
            .collect();
        *self.status.write().await = ObssStatus {
            mount: self.mount.clone(),
            mount_utc: self.mount_utc.clone(),
            cameras,
            plan: self.plan_status.clone(),
            links_online,
            last_closed: self.last_closed,
        };
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_plan_time(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

/// Serial for a manual exposure: `gid + uid + "_" + YYMMDDnnn`, with `nnn`
/// restarting at dawn of each UTC day.
fn take_image_serial(
    gid: &str,
    uid: &str,
    day: NaiveDate,
    old_day: &mut u32,
    seq: &mut u32,
) -> String {
    if day.day() != *old_day {
        *old_day = day.day();
        *seq = 0;
    }
    *seq += 1;
    format!(
        "{}{}_{:02}{:02}{:02}{:03}",
        gid,
        uid,
        day.year() % 100,
        day.month(),
        day.day(),
        seq
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_proto::gwac::GwacEncoder;

    #[test]
    fn matching_follows_empty_propagation() {
        // (gid, uid, expected) against an OBSS keyed (001, 002).
        let table = [
            ("", "", true),
            ("001", "", true),
            ("001", "002", true),
            ("001", "003", false),
            ("002", "002", false),
            ("002", "", false),
            // A unit match alone never qualifies.
            ("", "002", false),
        ];
        for (gid, uid, expect) in table {
            assert_eq!(
                is_matched("001", "002", gid, uid),
                expect,
                "gid={gid:?} uid={uid:?}"
            );
        }
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(is_matched("G01", "U02", "g01", "u02"));
    }

    #[test]
    fn take_image_serials_reset_per_day() {
        let mut old_day = 0;
        let mut seq = 0;
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 29).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 3, 30).unwrap();
        assert_eq!(
            take_image_serial("001", "001", day1, &mut old_day, &mut seq),
            "001001_240329001"
        );
        assert_eq!(
            take_image_serial("001", "001", day1, &mut old_day, &mut seq),
            "001001_240329002"
        );
        assert_eq!(
            take_image_serial("001", "001", day2, &mut old_day, &mut seq),
            "001001_240330001"
        );
    }

    #[test]
    fn retransmit_queue_pops_on_response() {
        let rq = RetransmitQueue::default();
        let mut enc = GwacEncoder::new("001", "001");
        let first = enc.slew(10.0, 20.0);
        let second = enc.park();
        rq.push(&first);
        rq.push(&second);
        assert_eq!(rq.len(), 2);
        assert!(rq.pop_serial(first.serial));
        assert_eq!(rq.len(), 1);
        assert!(!rq.pop_serial(first.serial));
    }

    #[test]
    fn retransmit_queue_gives_up_after_three_retries() {
        let rq = RetransmitQueue::default();
        let mut enc = GwacEncoder::new("001", "001");
        let cmd = enc.slew(10.0, 20.0);
        rq.push(&cmd);
        for _ in 0..RETRY_MAX {
            match rq.tick() {
                RetryAction::Resend(device, line) => {
                    assert_eq!(device, GwacDevice::Mount);
                    assert_eq!(line, cmd.line);
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert_eq!(rq.tick(), RetryAction::GaveUp(cmd.serial));
        assert!(rq.is_empty());
        assert_eq!(rq.tick(), RetryAction::Idle);
    }

    #[test]
    fn retransmit_queue_clears_per_device() {
        let rq = RetransmitQueue::default();
        let mut enc = GwacEncoder::new("001", "001");
        rq.push(&enc.slew(1.0, 2.0));
        rq.push(&enc.focus("001", 30));
        rq.push(&enc.park());
        rq.clear_device(GwacDevice::Mount);
        assert_eq!(rq.len(), 1);
        rq.clear_device(GwacDevice::Focus);
        assert!(rq.is_empty());
    }

    #[test]
    fn idle_clock_only_runs_with_no_links() {
        let now = Utc::now();
        let mut status = ObssStatus {
            mount: MountReport::default(),
            mount_utc: String::new(),
            cameras: Vec::new(),
            plan: PlanReport::default(),
            links_online: 1,
            last_closed: now - ChronoDuration::seconds(1000),
        };
        assert_eq!(status.idle_secs(now), 0);
        status.links_online = 0;
        assert!(status.idle_secs(now) >= 1000);
        assert!(status.idle_secs(now) > GC_IDLE_SECS);
    }

    #[test]
    fn plan_time_parses_iso_seconds() {
        assert!(parse_plan_time("2099-01-01T00:00:00").is_some());
        assert!(parse_plan_time("").is_none());
        assert!(parse_plan_time("not-a-time").is_none());
    }
}
