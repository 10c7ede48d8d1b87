//! Key/value dialect: `type key=value,key=value,...\n`.
//!
//! Spoken by operator clients, cameras and GFT mounts. Every record opens
//! with the shared envelope keys (`utc`, `gid`, `uid`, `cid`); the remaining
//! pairs are interpreted per record type. Unknown keys on plan records are
//! preserved and re-emitted; a numeric field that fails to parse fails the
//! whole record.

use std::fmt::Write as _;

use crate::types::{default_objid, CoordSystem, PlanState};
use crate::{utc_now, ProtoError};

/// Sentinel for "focus position not known", carried on the wire as-is.
pub const FOCUS_UNKNOWN: i32 = 999_999;

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Common addressing header of every KV record. Empty fields are omitted on
/// serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub utc: String,
    pub gid: String,
    pub uid: String,
    pub cid: String,
}

impl Envelope {
    pub fn new(gid: &str, uid: &str) -> Self {
        Self {
            utc: utc_now(),
            gid: gid.to_string(),
            uid: uid.to_string(),
            cid: String::new(),
        }
    }

    pub fn with_cid(gid: &str, uid: &str, cid: &str) -> Self {
        Self {
            utc: utc_now(),
            gid: gid.to_string(),
            uid: uid.to_string(),
            cid: cid.to_string(),
        }
    }

    fn write(&self, out: &mut String, ty: &str) {
        out.push_str(ty);
        out.push(' ');
        if !self.utc.is_empty() {
            push_kv(out, "utc", &self.utc);
        }
        if !self.gid.is_empty() {
            push_kv(out, "gid", &self.gid);
        }
        if !self.uid.is_empty() {
            push_kv(out, "uid", &self.uid);
        }
        if !self.cid.is_empty() {
            push_kv(out, "cid", &self.cid);
        }
    }
}

fn push_kv<T: std::fmt::Display>(out: &mut String, key: &str, val: T) {
    let _ = write!(out, "{key}={val},");
}

// ── Record payloads ───────────────────────────────────────────────────────────

/// An observation plan: one target, one exposure sequence.
///
/// Shared by `append_plan`, `append_gwac` and `take_image`; the record type
/// is the only difference between the three on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsPlan {
    pub plan_sn: String,
    pub objid: String,
    pub obstype: String,
    pub coorsys: CoordSystem,
    pub ra: f64,
    pub dec: f64,
    pub epoch: f64,
    pub azi: f64,
    pub ele: f64,
    pub tle1: String,
    pub tle2: String,
    /// BIAS / DARK / FLAT / OBJECT / FOCUS.
    pub imgtype: String,
    pub filter: String,
    pub exptime: f64,
    /// Inter-frame delay, seconds.
    pub delay: f64,
    pub frmcnt: i32,
    pub loopcnt: i32,
    pub priority: i32,
    pub grid_id: String,
    pub field_id: String,
    /// `CCYY-MM-DDThh:mm:ss`.
    pub plan_begin: String,
    pub plan_end: String,
    /// Unrecognized pairs, re-emitted in arrival order.
    pub extras: Vec<(String, String)>,
}

impl Default for ObsPlan {
    fn default() -> Self {
        Self {
            plan_sn: String::new(),
            objid: String::new(),
            obstype: String::new(),
            coorsys: CoordSystem::Equatorial,
            ra: 0.0,
            dec: 0.0,
            epoch: 2000.0,
            azi: 0.0,
            ele: 0.0,
            tle1: String::new(),
            tle2: String::new(),
            imgtype: String::new(),
            filter: String::new(),
            exptime: 0.0,
            delay: 0.0,
            frmcnt: 0,
            loopcnt: 0,
            priority: 0,
            grid_id: String::new(),
            field_id: String::new(),
            plan_begin: String::new(),
            plan_end: String::new(),
            extras: Vec::new(),
        }
    }
}

/// `check_plan` / `remove_plan`: address a plan by serial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanQuery {
    pub plan_sn: String,
}

/// `plan`: plan lifecycle broadcast to clients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanReport {
    pub plan_sn: String,
    pub tm_start: String,
    pub tm_stop: String,
    pub state: PlanState,
}

/// `obss`: system-level summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObssReport {
    pub state: i32,
    pub mount: i32,
    pub camera: i32,
}

/// `mount`: mount status as cached and re-broadcast by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct MountReport {
    /// Wire code per [`crate::types::MountState`]; -1 = not yet reported.
    pub state: i32,
    pub errcode: i32,
    pub mjd: f64,
    /// Local sidereal time, hours.
    pub lst: f64,
    pub ra: f64,
    pub dec: f64,
    pub ra2k: f64,
    pub dec2k: f64,
    pub azi: f64,
    pub ele: f64,
}

impl Default for MountReport {
    fn default() -> Self {
        Self {
            state: -1,
            errcode: 1,
            mjd: -1.0,
            lst: -1.0,
            ra: 1000.0,
            dec: 1000.0,
            ra2k: 1000.0,
            dec2k: 1000.0,
            azi: 1000.0,
            ele: 1000.0,
        }
    }
}

/// `camera`: camera status as reported by the camera process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraReport {
    pub state: i32,
    pub errcode: i32,
    /// Remaining exposure time, seconds.
    pub left: f64,
    pub percent: f64,
    pub coolget: i32,
    pub imgtype: String,
    pub filter: String,
    /// Free disk space, GB.
    pub freedisk: i32,
    pub plan_sn: String,
    pub loopno: i32,
    pub frmno: i32,
    pub filename: String,
}

/// `slew`: point the mount, then track.
#[derive(Debug, Clone, PartialEq)]
pub struct SlewCmd {
    pub coorsys: CoordSystem,
    pub ra: f64,
    pub dec: f64,
    pub epoch: f64,
    pub azi: f64,
    pub ele: f64,
    pub tle1: String,
    pub tle2: String,
}

impl Default for SlewCmd {
    fn default() -> Self {
        Self {
            coorsys: CoordSystem::Equatorial,
            ra: 0.0,
            dec: 0.0,
            epoch: 2000.0,
            azi: 0.0,
            ele: 0.0,
            tle1: String::new(),
            tle2: String::new(),
        }
    }
}

/// `sync`: align the mount zero point with the given position.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCmd {
    pub ra: f64,
    pub dec: f64,
    pub epoch: f64,
}

impl Default for SyncCmd {
    fn default() -> Self {
        Self {
            ra: 0.0,
            dec: 0.0,
            epoch: 2000.0,
        }
    }
}

/// `guide`: closed-loop pointing correction from image analysis.
/// Offsets are arcseconds; zero offsets are suppressed on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuideCmd {
    /// 1: residual below threshold, nothing to correct.
    pub result: i32,
    /// 1: guiding starts; 0: guiding done.
    pub op: i32,
    pub ra: i32,
    pub dec: i32,
}

/// `trackvel`: non-sidereal tracking rate, degrees per second per axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackVelCmd {
    pub ra: f64,
    pub dec: f64,
}

/// `expose`: low-level exposure control toward cameras.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposeCmd {
    /// See [`crate::types::EXP_START`] and friends.
    pub command: i32,
    /// First frame number, used to resume an interrupted sequence.
    pub frmno: i32,
    pub loopno: i32,
}

/// `camset`: camera gear query/state/modification.
#[derive(Debug, Clone, PartialEq)]
pub struct CamSet {
    /// 0: query; 1: state; 2: modify.
    pub op_type: i32,
    pub bit_depth: i32,
    pub i_adc: i32,
    pub i_read_port: i32,
    pub i_read_rate: i32,
    pub i_vs_rate: i32,
    pub i_gain: i32,
    pub cool_set: i32,
    pub bit_pixel: i32,
    pub adc: String,
    pub read_port: String,
    pub read_rate: String,
    pub vs_rate: f64,
    pub gain: f64,
}

impl Default for CamSet {
    fn default() -> Self {
        Self {
            op_type: -1,
            bit_depth: 0,
            i_adc: 0,
            i_read_port: 0,
            i_read_rate: 0,
            i_vs_rate: 0,
            i_gain: 0,
            cool_set: 0,
            bit_pixel: 0,
            adc: String::new(),
            read_port: String::new(),
            read_rate: String::new(),
            vs_rate: 0.0,
            gain: 0.0,
        }
    }
}

/// `focus`: open-loop focuser control and position feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusCmd {
    /// 0: position report; 1: relative move command.
    pub op_type: i32,
    /// 0: idle; 1: moving.
    pub state: i32,
    pub rel_pos: i32,
    pub pos: i32,
    pub pos_tar: i32,
}

impl Default for FocusCmd {
    fn default() -> Self {
        Self {
            op_type: 0,
            state: 0,
            rel_pos: 0,
            pos: FOCUS_UNKNOWN,
            pos_tar: FOCUS_UNKNOWN,
        }
    }
}

/// `fwhm`: measured image quality driving the closed focus loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FwhmReport {
    pub fwhm: f64,
    /// Observation time of the measured image, `CCYY-MM-DDThh:mm:ss`.
    pub tmimg: String,
}

/// `derot`: field derotator control and position.
#[derive(Debug, Clone, PartialEq)]
pub struct DerotCmd {
    pub op_type: i32,
    pub command: i32,
    pub state: i32,
    pub pos_tar: f64,
    pub pos: f64,
}

impl Default for DerotCmd {
    fn default() -> Self {
        Self {
            op_type: -1,
            command: -1,
            state: 0,
            pos_tar: 0.0,
            pos: 0.0,
        }
    }
}

/// `dome`: dome slit control and position.
#[derive(Debug, Clone, PartialEq)]
pub struct DomeCmd {
    pub op_type: i32,
    pub command: i32,
    pub state: i32,
    pub azi: f64,
    pub ele: f64,
    pub azi_obj: f64,
    pub ele_obj: f64,
}

impl Default for DomeCmd {
    fn default() -> Self {
        Self {
            op_type: -1,
            command: -1,
            state: 0,
            azi: 0.0,
            ele: 0.0,
            azi_obj: 0.0,
            ele_obj: 0.0,
        }
    }
}

/// `mcover`: mirror cover control and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCoverCmd {
    pub op_type: i32,
    pub command: i32,
    pub state: i32,
}

impl Default for MirrorCoverCmd {
    fn default() -> Self {
        Self {
            op_type: -1,
            command: -1,
            state: 0,
        }
    }
}

/// `filter`: stand-alone filter wheel control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCmd {
    pub op_type: i32,
    pub name: String,
}

impl Default for FilterCmd {
    fn default() -> Self {
        Self {
            op_type: -1,
            name: String::new(),
        }
    }
}

/// `geosite`: geographic site query/state/modification.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoSiteCmd {
    pub op_type: i32,
    pub name: String,
    pub lon: f64,
    pub lat: f64,
    pub alt: f64,
}

impl Default for GeoSiteCmd {
    fn default() -> Self {
        Self {
            op_type: -1,
            name: String::new(),
            lon: 0.0,
            lat: 0.0,
            alt: 0.0,
        }
    }
}

// ── Record ────────────────────────────────────────────────────────────────────

/// Tagged payload of a KV record; the record type is the discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum KvBody {
    AppendPlan(ObsPlan),
    AppendGwac(ObsPlan),
    TakeImage(ObsPlan),
    CheckPlan(PlanQuery),
    RemovePlan(PlanQuery),
    Plan(PlanReport),
    Abort,
    Obss(ObssReport),
    Mount(MountReport),
    Camera(CameraReport),
    Home,
    Sync(SyncCmd),
    Park,
    Slew(SlewCmd),
    Guide(GuideCmd),
    Track,
    TrackVel(TrackVelCmd),
    Expose(ExposeCmd),
    CamSet(CamSet),
    Focus(FocusCmd),
    FocusSync,
    Fwhm(FwhmReport),
    Derot(DerotCmd),
    Dome(DomeCmd),
    MirrorCover(MirrorCoverCmd),
    Filter(FilterCmd),
    GeoSite(GeoSiteCmd),
}

impl KvBody {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::AppendPlan(_) => "append_plan",
            Self::AppendGwac(_) => "append_gwac",
            Self::TakeImage(_) => "take_image",
            Self::CheckPlan(_) => "check_plan",
            Self::RemovePlan(_) => "remove_plan",
            Self::Plan(_) => "plan",
            Self::Abort => "abort",
            Self::Obss(_) => "obss",
            Self::Mount(_) => "mount",
            Self::Camera(_) => "camera",
            Self::Home => "home",
            Self::Sync(_) => "sync",
            Self::Park => "park",
            Self::Slew(_) => "slew",
            Self::Guide(_) => "guide",
            Self::Track => "track",
            Self::TrackVel(_) => "trackvel",
            Self::Expose(_) => "expose",
            Self::CamSet(_) => "camset",
            Self::Focus(_) => "focus",
            Self::FocusSync => "focus_sync",
            Self::Fwhm(_) => "fwhm",
            Self::Derot(_) => "derot",
            Self::Dome(_) => "dome",
            Self::MirrorCover(_) => "mcover",
            Self::Filter(_) => "filter",
            Self::GeoSite(_) => "geosite",
        }
    }
}

/// One decoded KV record: envelope plus typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct KvFrame {
    pub env: Envelope,
    pub body: KvBody,
}

impl KvFrame {
    pub fn new(env: Envelope, body: KvBody) -> Self {
        Self { env, body }
    }

    // ── Serialization ────────────────────────────────────────────────────────

    /// Encode as a newline-terminated wire line.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(128);
        self.env.write(&mut out, self.body.type_str());
        match &self.body {
            KvBody::AppendPlan(p) | KvBody::AppendGwac(p) | KvBody::TakeImage(p) => {
                write_plan(&mut out, p)
            }
            KvBody::CheckPlan(q) | KvBody::RemovePlan(q) => {
                if !q.plan_sn.is_empty() {
                    push_kv(&mut out, "plan_sn", &q.plan_sn);
                }
            }
            KvBody::Plan(p) => {
                if !p.plan_sn.is_empty() {
                    push_kv(&mut out, "plan_sn", &p.plan_sn);
                }
                if !p.tm_start.is_empty() {
                    push_kv(&mut out, "tm_start", &p.tm_start);
                }
                if !p.tm_stop.is_empty() {
                    push_kv(&mut out, "tm_stop", &p.tm_stop);
                }
                push_kv(&mut out, "state", p.state as i32);
            }
            KvBody::Abort | KvBody::Home | KvBody::Park | KvBody::Track | KvBody::FocusSync => {}
            KvBody::Obss(o) => {
                push_kv(&mut out, "state", o.state);
                push_kv(&mut out, "mount", o.mount);
                push_kv(&mut out, "camera", o.camera);
            }
            KvBody::Mount(m) => {
                push_kv(&mut out, "state", m.state);
                push_kv(&mut out, "errcode", m.errcode);
                push_kv(&mut out, "mjd", m.mjd);
                push_kv(&mut out, "lst", m.lst);
                push_kv(&mut out, "ra", m.ra);
                push_kv(&mut out, "dec", m.dec);
                push_kv(&mut out, "ra2k", m.ra2k);
                push_kv(&mut out, "dec2k", m.dec2k);
                push_kv(&mut out, "azi", m.azi);
                push_kv(&mut out, "ele", m.ele);
            }
            KvBody::Camera(c) => {
                push_kv(&mut out, "state", c.state);
                push_kv(&mut out, "errcode", c.errcode);
                push_kv(&mut out, "left", c.left);
                push_kv(&mut out, "percent", c.percent);
                push_kv(&mut out, "coolget", c.coolget);
                push_kv(&mut out, "imgtype", &c.imgtype);
                push_kv(&mut out, "filter", &c.filter);
                push_kv(&mut out, "freedisk", c.freedisk);
                push_kv(&mut out, "plan_sn", &c.plan_sn);
                push_kv(&mut out, "loopno", c.loopno);
                push_kv(&mut out, "frmno", c.frmno);
                push_kv(&mut out, "filename", &c.filename);
            }
            KvBody::Sync(s) => {
                push_kv(&mut out, "ra", s.ra);
                push_kv(&mut out, "dec", s.dec);
                push_kv(&mut out, "epoch", s.epoch);
            }
            KvBody::Slew(s) => {
                push_kv(&mut out, "coor_sys", s.coorsys as i32);
                match s.coorsys {
                    CoordSystem::Equatorial => {
                        push_kv(&mut out, "ra", s.ra);
                        push_kv(&mut out, "dec", s.dec);
                        push_kv(&mut out, "epoch", s.epoch);
                    }
                    CoordSystem::AltAzimuth => {
                        push_kv(&mut out, "azi", s.azi);
                        push_kv(&mut out, "ele", s.ele);
                    }
                    CoordSystem::Tle => {
                        push_kv(&mut out, "tle1", &s.tle1);
                        push_kv(&mut out, "tle2", &s.tle2);
                    }
                }
            }
            KvBody::Guide(g) => {
                push_kv(&mut out, "result", g.result);
                push_kv(&mut out, "op", g.op);
                if g.ra != 0 || g.dec != 0 {
                    push_kv(&mut out, "ra", g.ra);
                    push_kv(&mut out, "dec", g.dec);
                }
            }
            KvBody::TrackVel(t) => {
                push_kv(&mut out, "ra", t.ra);
                push_kv(&mut out, "dec", t.dec);
            }
            KvBody::Expose(e) => {
                push_kv(&mut out, "command", e.command);
                push_kv(&mut out, "frmno", e.frmno);
                push_kv(&mut out, "loopno", e.loopno);
            }
            KvBody::CamSet(c) => {
                push_kv(&mut out, "optype", c.op_type);
                if c.op_type != 0 {
                    if c.op_type == 2 {
                        push_kv(&mut out, "bitDepth", c.bit_depth);
                        push_kv(&mut out, "iADC", c.i_adc);
                        push_kv(&mut out, "iReadPort", c.i_read_port);
                        push_kv(&mut out, "iReadRate", c.i_read_rate);
                        push_kv(&mut out, "iVSRate", c.i_vs_rate);
                        push_kv(&mut out, "iGain", c.i_gain);
                        push_kv(&mut out, "coolSet", c.cool_set);
                    }
                    push_kv(&mut out, "bitPixel", c.bit_pixel);
                    push_kv(&mut out, "ADC", &c.adc);
                    push_kv(&mut out, "readPort", &c.read_port);
                    push_kv(&mut out, "readRate", &c.read_rate);
                    push_kv(&mut out, "vsRate", c.vs_rate);
                    push_kv(&mut out, "gain", c.gain);
                }
            }
            KvBody::Focus(f) => {
                push_kv(&mut out, "optype", f.op_type);
                if f.op_type == 0 {
                    push_kv(&mut out, "state", f.state);
                    push_kv(&mut out, "pos", f.pos);
                    push_kv(&mut out, "posTar", f.pos_tar);
                } else if f.op_type == 1 {
                    push_kv(&mut out, "relpos", f.rel_pos);
                }
            }
            KvBody::Fwhm(f) => {
                push_kv(&mut out, "fwhm", f.fwhm);
                push_kv(&mut out, "tmimg", &f.tmimg);
            }
            KvBody::Derot(d) => {
                push_kv(&mut out, "optype", d.op_type);
                if d.op_type == 0 {
                    push_kv(&mut out, "state", d.state);
                    push_kv(&mut out, "pos", d.pos);
                } else if d.op_type == 1 {
                    push_kv(&mut out, "command", d.command);
                    push_kv(&mut out, "postar", d.pos_tar);
                }
            }
            KvBody::Dome(d) => {
                push_kv(&mut out, "optype", d.op_type);
                if d.op_type == 0 {
                    push_kv(&mut out, "state", d.state);
                    push_kv(&mut out, "azi", d.azi);
                    push_kv(&mut out, "ele", d.ele);
                } else if d.op_type == 1 {
                    push_kv(&mut out, "command", d.command);
                }
                push_kv(&mut out, "aziobj", d.azi_obj);
                push_kv(&mut out, "eleobj", d.ele_obj);
            }
            KvBody::MirrorCover(m) => {
                push_kv(&mut out, "optype", m.op_type);
                if m.op_type == 0 {
                    push_kv(&mut out, "state", m.state);
                } else if m.op_type == 1 {
                    push_kv(&mut out, "command", m.command);
                }
            }
            KvBody::Filter(f) => {
                push_kv(&mut out, "optype", f.op_type);
                push_kv(&mut out, "name", &f.name);
            }
            KvBody::GeoSite(g) => {
                push_kv(&mut out, "optype", g.op_type);
                if g.op_type != 0 {
                    push_kv(&mut out, "name", &g.name);
                    push_kv(&mut out, "lon", g.lon);
                    push_kv(&mut out, "lat", g.lat);
                    push_kv(&mut out, "alt", g.alt);
                }
            }
        }
        out.push('\n');
        out
    }

    // ── Parsing ──────────────────────────────────────────────────────────────

    /// Decode one wire line. The trailing newline is optional.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let rest = line.trim_start();
        let (ty, rest) = match rest.find(' ') {
            Some(i) => (&rest[..i], rest[i + 1..].trim_start()),
            None => (rest, ""),
        };
        if ty.is_empty() {
            return Err(ProtoError::UnknownType(String::new()));
        }

        let mut env = Envelope::default();
        let mut pairs: Vec<(String, String)> = Vec::new();
        for tok in rest.split(',') {
            let Some((key, value)) = split_pair(tok) else {
                continue;
            };
            if key.eq_ignore_ascii_case("utc") {
                env.utc = value;
            } else if key.eq_ignore_ascii_case("gid") {
                env.gid = value;
            } else if key.eq_ignore_ascii_case("uid") {
                env.uid = value;
            } else if key.eq_ignore_ascii_case("cid") {
                env.cid = value;
            } else {
                pairs.push((key, value));
            }
        }

        let body = resolve_body(ty, pairs)?;
        Ok(Self { env, body })
    }
}

fn split_pair(tok: &str) -> Option<(String, String)> {
    let (key, value) = tok.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn write_plan(out: &mut String, p: &ObsPlan) {
    if !p.plan_sn.is_empty() {
        push_kv(out, "plan_sn", &p.plan_sn);
    }
    if !p.objid.is_empty() {
        push_kv(out, "objid", &p.objid);
    }
    if !p.obstype.is_empty() {
        push_kv(out, "obstype", &p.obstype);
    }
    push_kv(out, "coor_sys", p.coorsys as i32);
    match p.coorsys {
        CoordSystem::Equatorial => {
            push_kv(out, "ra", p.ra);
            push_kv(out, "dec", p.dec);
            push_kv(out, "epoch", p.epoch);
        }
        CoordSystem::AltAzimuth => {
            push_kv(out, "azi", p.azi);
            push_kv(out, "ele", p.ele);
        }
        CoordSystem::Tle => {
            push_kv(out, "tle1", &p.tle1);
            push_kv(out, "tle2", &p.tle2);
        }
    }
    push_kv(out, "imgtype", &p.imgtype);
    if !p.filter.is_empty() {
        push_kv(out, "filter", &p.filter);
    }
    push_kv(out, "exptime", p.exptime);
    if p.delay != 0.0 {
        push_kv(out, "delay", p.delay);
    }
    push_kv(out, "frmcnt", p.frmcnt);
    push_kv(out, "loopcnt", p.loopcnt);
    push_kv(out, "priority", p.priority);
    if !p.grid_id.is_empty() {
        push_kv(out, "grid_id", &p.grid_id);
    }
    if !p.field_id.is_empty() {
        push_kv(out, "field_id", &p.field_id);
    }
    if !p.plan_begin.is_empty() {
        push_kv(out, "plan_beg", &p.plan_begin);
    }
    if !p.plan_end.is_empty() {
        push_kv(out, "plan_end", &p.plan_end);
    }
    for (k, v) in &p.extras {
        push_kv(out, k, v);
    }
}

// ── Numeric helpers ───────────────────────────────────────────────────────────

fn num_i32(key: &str, value: &str) -> Result<i32, ProtoError> {
    value.parse().map_err(|_| ProtoError::BadNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn num_f64(key: &str, value: &str) -> Result<f64, ProtoError> {
    let v: f64 = value.parse().map_err(|_| ProtoError::BadNumber {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    // `NaN`/`inf` parse as valid f64 but have no place on this wire.
    if !v.is_finite() {
        return Err(ProtoError::BadNumber {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(v)
}

// ── Per-type resolvers ────────────────────────────────────────────────────────

/// First-letter prefilter, then case-insensitive full match.
fn resolve_body(ty: &str, pairs: Vec<(String, String)>) -> Result<KvBody, ProtoError> {
    let eq = |name: &str| ty.eq_ignore_ascii_case(name);
    let first = ty.as_bytes()[0].to_ascii_lowercase();
    match first {
        b'a' => {
            if eq("append_plan") {
                return Ok(KvBody::AppendPlan(resolve_plan(pairs)?));
            }
            if eq("append_gwac") {
                return Ok(KvBody::AppendGwac(resolve_plan(pairs)?));
            }
            if eq("abort") {
                return Ok(KvBody::Abort);
            }
        }
        b'c' => {
            if eq("check_plan") {
                return Ok(KvBody::CheckPlan(resolve_plan_query(pairs)));
            }
            if eq("camera") {
                return Ok(KvBody::Camera(resolve_camera(pairs)?));
            }
            if eq("camset") {
                return Ok(KvBody::CamSet(resolve_camset(pairs)?));
            }
        }
        b'd' => {
            if eq("derot") {
                return Ok(KvBody::Derot(resolve_derot(pairs)?));
            }
            if eq("dome") {
                return Ok(KvBody::Dome(resolve_dome(pairs)?));
            }
        }
        b'e' => {
            if eq("expose") {
                return Ok(KvBody::Expose(resolve_expose(pairs)?));
            }
        }
        b'f' => {
            if eq("focus") {
                return Ok(KvBody::Focus(resolve_focus(pairs)?));
            }
            if eq("focus_sync") {
                return Ok(KvBody::FocusSync);
            }
            if eq("fwhm") {
                return Ok(KvBody::Fwhm(resolve_fwhm(pairs)?));
            }
            if eq("filter") {
                return Ok(KvBody::Filter(resolve_filter(pairs)?));
            }
        }
        b'g' => {
            if eq("guide") {
                return Ok(KvBody::Guide(resolve_guide(pairs)?));
            }
            if eq("geosite") {
                return Ok(KvBody::GeoSite(resolve_geosite(pairs)?));
            }
        }
        b'h' => {
            if eq("home") {
                return Ok(KvBody::Home);
            }
        }
        b'm' => {
            if eq("mount") {
                return Ok(KvBody::Mount(resolve_mount(pairs)?));
            }
            if eq("mcover") {
                return Ok(KvBody::MirrorCover(resolve_mcover(pairs)?));
            }
        }
        b'o' => {
            if eq("obss") {
                return Ok(KvBody::Obss(resolve_obss(pairs)?));
            }
        }
        b'p' => {
            if eq("plan") {
                return Ok(KvBody::Plan(resolve_plan_report(pairs)?));
            }
            if eq("park") {
                return Ok(KvBody::Park);
            }
        }
        b'r' => {
            if eq("remove_plan") {
                return Ok(KvBody::RemovePlan(resolve_plan_query(pairs)));
            }
        }
        b's' => {
            if eq("slew") {
                return Ok(KvBody::Slew(resolve_slew(pairs)?));
            }
            if eq("sync") {
                return Ok(KvBody::Sync(resolve_sync(pairs)?));
            }
        }
        b't' => {
            if eq("take_image") {
                return Ok(KvBody::TakeImage(resolve_plan(pairs)?));
            }
            if eq("track") {
                return Ok(KvBody::Track);
            }
            if eq("trackvel") {
                return Ok(KvBody::TrackVel(resolve_trackvel(pairs)?));
            }
        }
        _ => {}
    }
    Err(ProtoError::UnknownType(ty.to_string()))
}

fn resolve_plan(pairs: Vec<(String, String)>) -> Result<ObsPlan, ProtoError> {
    let mut p = ObsPlan::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("plan_sn") {
            p.plan_sn = v;
        } else if k.eq_ignore_ascii_case("objid") {
            p.objid = v;
        } else if k.eq_ignore_ascii_case("obstype") {
            p.obstype = v;
        } else if k.eq_ignore_ascii_case("coor_sys") {
            p.coorsys = CoordSystem::from_code(num_i32(&k, &v)?).unwrap_or_default();
        } else if k.eq_ignore_ascii_case("ra") {
            p.ra = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("dec") {
            p.dec = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("epoch") {
            p.epoch = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("azi") {
            p.azi = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ele") {
            p.ele = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("tle1") {
            p.tle1 = v;
        } else if k.eq_ignore_ascii_case("tle2") {
            p.tle2 = v;
        } else if k.eq_ignore_ascii_case("imgtype") {
            p.imgtype = v;
        } else if k.eq_ignore_ascii_case("filter") {
            p.filter = v;
        } else if k.eq_ignore_ascii_case("exptime") {
            p.exptime = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("delay") {
            p.delay = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("frmcnt") {
            p.frmcnt = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("loopcnt") {
            p.loopcnt = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("priority") {
            p.priority = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("grid_id") {
            p.grid_id = v;
        } else if k.eq_ignore_ascii_case("field_id") {
            p.field_id = v;
        } else if k.eq_ignore_ascii_case("plan_beg") {
            p.plan_begin = v;
        } else if k.eq_ignore_ascii_case("plan_end") {
            p.plan_end = v;
        } else {
            p.extras.push((k, v));
        }
    }

    // Defaults: a plan without an exposure time is a bias sequence.
    if p.imgtype.is_empty() {
        p.imgtype = if p.exptime.abs() < 1e-3 { "BIAS" } else { "OBJECT" }.to_string();
    }
    if p.objid.is_empty() {
        p.objid = default_objid(&p.imgtype).to_string();
    }
    Ok(p)
}

fn resolve_plan_query(pairs: Vec<(String, String)>) -> PlanQuery {
    let mut q = PlanQuery::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("plan_sn") {
            q.plan_sn = v;
        }
    }
    q
}

fn resolve_plan_report(pairs: Vec<(String, String)>) -> Result<PlanReport, ProtoError> {
    let mut p = PlanReport::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("plan_sn") {
            p.plan_sn = v;
        } else if k.eq_ignore_ascii_case("tm_start") {
            p.tm_start = v;
        } else if k.eq_ignore_ascii_case("tm_stop") {
            p.tm_stop = v;
        } else if k.eq_ignore_ascii_case("state") {
            p.state = PlanState::from_code(num_i32(&k, &v)?);
        }
    }
    Ok(p)
}

fn resolve_obss(pairs: Vec<(String, String)>) -> Result<ObssReport, ProtoError> {
    let mut o = ObssReport::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("state") {
            o.state = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("mount") {
            o.mount = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("camera") {
            o.camera = num_i32(&k, &v)?;
        }
    }
    Ok(o)
}

fn resolve_mount(pairs: Vec<(String, String)>) -> Result<MountReport, ProtoError> {
    let mut m = MountReport::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("state") {
            m.state = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("errcode") {
            m.errcode = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("mjd") {
            m.mjd = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("lst") {
            m.lst = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ra") {
            m.ra = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("dec") {
            m.dec = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ra2k") {
            m.ra2k = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("dec2k") {
            m.dec2k = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("azi") {
            m.azi = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ele") {
            m.ele = num_f64(&k, &v)?;
        }
    }
    Ok(m)
}

fn resolve_camera(pairs: Vec<(String, String)>) -> Result<CameraReport, ProtoError> {
    let mut c = CameraReport::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("state") {
            c.state = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("errcode") {
            c.errcode = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("left") {
            c.left = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("percent") {
            c.percent = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("coolget") {
            c.coolget = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("imgtype") {
            c.imgtype = v;
        } else if k.eq_ignore_ascii_case("filter") {
            c.filter = v;
        } else if k.eq_ignore_ascii_case("freedisk") {
            c.freedisk = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("plan_sn") {
            c.plan_sn = v;
        } else if k.eq_ignore_ascii_case("loopno") {
            c.loopno = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("frmno") {
            c.frmno = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("filename") {
            c.filename = v;
        }
    }
    Ok(c)
}

fn resolve_slew(pairs: Vec<(String, String)>) -> Result<SlewCmd, ProtoError> {
    let mut s = SlewCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("coor_sys") {
            s.coorsys = CoordSystem::from_code(num_i32(&k, &v)?).unwrap_or_default();
        } else if k.eq_ignore_ascii_case("ra") {
            s.ra = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("dec") {
            s.dec = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("epoch") {
            s.epoch = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("azi") {
            s.azi = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ele") {
            s.ele = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("tle1") {
            s.tle1 = v;
        } else if k.eq_ignore_ascii_case("tle2") {
            s.tle2 = v;
        }
    }
    Ok(s)
}

fn resolve_sync(pairs: Vec<(String, String)>) -> Result<SyncCmd, ProtoError> {
    let mut s = SyncCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("ra") {
            s.ra = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("dec") {
            s.dec = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("epoch") {
            s.epoch = num_f64(&k, &v)?;
        }
    }
    Ok(s)
}

fn resolve_guide(pairs: Vec<(String, String)>) -> Result<GuideCmd, ProtoError> {
    let mut g = GuideCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("result") {
            g.result = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("op") {
            g.op = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ra") {
            g.ra = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("dec") {
            g.dec = num_i32(&k, &v)?;
        }
    }
    Ok(g)
}

fn resolve_trackvel(pairs: Vec<(String, String)>) -> Result<TrackVelCmd, ProtoError> {
    let mut t = TrackVelCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("ra") {
            t.ra = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("dec") {
            t.dec = num_f64(&k, &v)?;
        }
    }
    Ok(t)
}

fn resolve_expose(pairs: Vec<(String, String)>) -> Result<ExposeCmd, ProtoError> {
    let mut e = ExposeCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("command") {
            e.command = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("frmno") {
            e.frmno = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("loopno") {
            e.loopno = num_i32(&k, &v)?;
        }
    }
    Ok(e)
}

fn resolve_camset(pairs: Vec<(String, String)>) -> Result<CamSet, ProtoError> {
    let mut c = CamSet::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("optype") {
            c.op_type = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("bitDepth") {
            c.bit_depth = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("iADC") {
            c.i_adc = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("iReadPort") {
            c.i_read_port = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("iReadRate") {
            c.i_read_rate = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("iVSRate") {
            c.i_vs_rate = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("iGain") {
            c.i_gain = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("coolSet") {
            c.cool_set = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("bitPixel") {
            c.bit_pixel = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ADC") {
            c.adc = v;
        } else if k.eq_ignore_ascii_case("readPort") {
            c.read_port = v;
        } else if k.eq_ignore_ascii_case("readRate") {
            c.read_rate = v;
        } else if k.eq_ignore_ascii_case("vsRate") {
            c.vs_rate = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("gain") {
            c.gain = num_f64(&k, &v)?;
        }
    }
    Ok(c)
}

fn resolve_focus(pairs: Vec<(String, String)>) -> Result<FocusCmd, ProtoError> {
    let mut f = FocusCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("optype") {
            f.op_type = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("state") {
            f.state = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("relpos") {
            f.rel_pos = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("pos") {
            f.pos = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("posTar") {
            f.pos_tar = num_i32(&k, &v)?;
        }
    }
    Ok(f)
}

fn resolve_fwhm(pairs: Vec<(String, String)>) -> Result<FwhmReport, ProtoError> {
    let mut f = FwhmReport::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("fwhm") {
            f.fwhm = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("tmimg") {
            f.tmimg = v;
        }
    }
    Ok(f)
}

fn resolve_derot(pairs: Vec<(String, String)>) -> Result<DerotCmd, ProtoError> {
    let mut d = DerotCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("optype") {
            d.op_type = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("command") {
            d.command = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("state") {
            d.state = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("postar") {
            d.pos_tar = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("pos") {
            d.pos = num_f64(&k, &v)?;
        }
    }
    Ok(d)
}

fn resolve_dome(pairs: Vec<(String, String)>) -> Result<DomeCmd, ProtoError> {
    let mut d = DomeCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("optype") {
            d.op_type = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("command") {
            d.command = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("state") {
            d.state = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("azi") {
            d.azi = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("ele") {
            d.ele = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("aziobj") {
            d.azi_obj = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("eleobj") {
            d.ele_obj = num_f64(&k, &v)?;
        }
    }
    Ok(d)
}

fn resolve_mcover(pairs: Vec<(String, String)>) -> Result<MirrorCoverCmd, ProtoError> {
    let mut m = MirrorCoverCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("optype") {
            m.op_type = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("command") {
            m.command = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("state") {
            m.state = num_i32(&k, &v)?;
        }
    }
    Ok(m)
}

fn resolve_filter(pairs: Vec<(String, String)>) -> Result<FilterCmd, ProtoError> {
    let mut f = FilterCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("optype") {
            f.op_type = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("name") {
            f.name = v;
        }
    }
    Ok(f)
}

fn resolve_geosite(pairs: Vec<(String, String)>) -> Result<GeoSiteCmd, ProtoError> {
    let mut g = GeoSiteCmd::default();
    for (k, v) in pairs {
        if k.eq_ignore_ascii_case("optype") {
            g.op_type = num_i32(&k, &v)?;
        } else if k.eq_ignore_ascii_case("name") {
            g.name = v;
        } else if k.eq_ignore_ascii_case("lon") {
            g.lon = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("lat") {
            g.lat = num_f64(&k, &v)?;
        } else if k.eq_ignore_ascii_case("alt") {
            g.alt = num_f64(&k, &v)?;
        }
    }
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_and_payload() {
        let frame = KvFrame::parse(
            "camera utc=2024-03-29T13:07:26,gid=001,uid=002,cid=003,state=2,frmno=7,\n",
        )
        .unwrap();
        assert_eq!(frame.env.gid, "001");
        assert_eq!(frame.env.uid, "002");
        assert_eq!(frame.env.cid, "003");
        let KvBody::Camera(c) = frame.body else {
            panic!("wrong body");
        };
        assert_eq!(c.state, 2);
        assert_eq!(c.frmno, 7);
    }

    #[test]
    fn type_match_is_case_insensitive() {
        let frame = KvFrame::parse("APPEND_GWAC gid=001,uid=001,exptime=5,frmcnt=3").unwrap();
        assert!(matches!(frame.body, KvBody::AppendGwac(_)));
    }

    #[test]
    fn bad_numeric_fails_whole_record() {
        assert!(KvFrame::parse("append_gwac ra=NaN,dec=20.0").is_err());
        assert!(KvFrame::parse("camera state=abc").is_err());
        assert!(KvFrame::parse("mount ra=1e999").is_err());
    }

    #[test]
    fn unknown_type_is_undefined() {
        assert!(matches!(
            KvFrame::parse("warp_drive engage=1"),
            Err(ProtoError::UnknownType(_))
        ));
    }

    #[test]
    fn plan_defaults_without_exposure_is_bias() {
        let frame = KvFrame::parse("append_plan gid=001,uid=001").unwrap();
        let KvBody::AppendPlan(p) = frame.body else {
            panic!();
        };
        assert_eq!(p.imgtype, "BIAS");
        assert_eq!(p.objid, "bias");
    }

    #[test]
    fn plan_defaults_with_exposure_is_object() {
        let frame = KvFrame::parse("append_plan exptime=10").unwrap();
        let KvBody::AppendPlan(p) = frame.body else {
            panic!();
        };
        assert_eq!(p.imgtype, "OBJECT");
        assert_eq!(p.objid, "objt");
    }

    #[test]
    fn plan_keeps_unknown_keys() {
        let frame =
            KvFrame::parse("append_gwac plan_sn=P1,exptime=5,trigger=GRB240329A,burst_ra=10.5")
                .unwrap();
        let KvBody::AppendGwac(p) = &frame.body else {
            panic!();
        };
        assert_eq!(p.extras.len(), 2);
        let line = frame.encode();
        assert!(line.contains("trigger=GRB240329A,"));
        assert!(line.contains("burst_ra=10.5,"));
    }

    #[test]
    fn plan_round_trips() {
        let line = "append_gwac gid=001,uid=001,plan_sn=P1,objid=objt,coor_sys=1,ra=10,dec=20,\
                    epoch=2000,imgtype=OBJECT,exptime=5,frmcnt=3,loopcnt=0,priority=0,\
                    plan_end=2099-01-01T00:00:00,\n";
        let frame = KvFrame::parse(line).unwrap();
        assert_eq!(frame.encode(), line);
    }

    #[test]
    fn slew_serializes_by_coordinate_system() {
        let equ = KvFrame::new(
            Envelope::default(),
            KvBody::Slew(SlewCmd {
                ra: 10.0,
                dec: 20.0,
                ..Default::default()
            }),
        );
        let line = equ.encode();
        assert!(line.starts_with("slew coor_sys=1,ra=10,dec=20,epoch=2000,"));

        let tle = KvFrame::new(
            Envelope::default(),
            KvBody::Slew(SlewCmd {
                coorsys: CoordSystem::Tle,
                tle1: "1 25544U".into(),
                tle2: "2 25544".into(),
                ..Default::default()
            }),
        );
        let line = tle.encode();
        assert!(line.contains("tle1=1 25544U,"));
        assert!(!line.contains("ra="));
    }

    #[test]
    fn guide_suppresses_zero_offsets() {
        let frame = KvFrame::new(Envelope::default(), KvBody::Guide(GuideCmd::default()));
        assert_eq!(frame.encode(), "guide result=0,op=0,\n");
        let frame = KvFrame::new(
            Envelope::default(),
            KvBody::Guide(GuideCmd {
                ra: -3,
                dec: 4,
                ..Default::default()
            }),
        );
        assert_eq!(frame.encode(), "guide result=0,op=0,ra=-3,dec=4,\n");
    }

    #[test]
    fn empty_envelope_keys_are_omitted() {
        let frame = KvFrame::new(
            Envelope {
                gid: "001".into(),
                ..Default::default()
            },
            KvBody::Abort,
        );
        assert_eq!(frame.encode(), "abort gid=001,\n");
    }

    #[test]
    fn plan_report_round_trips() {
        let report = PlanReport {
            plan_sn: "P1".into(),
            tm_start: "2024-03-29T13:07:26".into(),
            tm_stop: String::new(),
            state: PlanState::Running,
        };
        let line = KvFrame::new(Envelope::new("001", "001"), KvBody::Plan(report)).encode();
        let back = KvFrame::parse(&line).unwrap();
        let KvBody::Plan(p) = back.body else {
            panic!();
        };
        assert_eq!(p.state, PlanState::Running);
        assert_eq!(p.plan_sn, "P1");
    }
}
