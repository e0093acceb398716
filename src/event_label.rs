//! Label of an execution graph event

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::ops::RangeInclusive;

use crate::event::Event;
use crate::loc::{MemAddr, MemOrdering};
use crate::thread::{main_thread_id, ThreadId};
use crate::vector_clock::VectorClock;

#[derive(Clone, Serialize, Deserialize)]
pub(crate) enum LabelEnum {
    Begin(Begin),
    End(End),
    TCreate(TCreate),
    TJoin(TJoin),
    Read(Read),
    Write(Write),
    Fence(Fence),
    Malloc(Malloc),
    Free(Free),
    Toss(Toss),
    Choice(Choice),
    Optional(Optional),
    MethodBegin(MethodBegin),
    MethodEnd(MethodEnd),
    Block(Block),
}

macro_rules! match_and_run {
    ( $lab:expr, $name:ident $( , $arg:ident )* ) => {
        match $lab {
            LabelEnum::Begin(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::End(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::TCreate(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::TJoin(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Read(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Write(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Fence(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Malloc(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Free(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Toss(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Choice(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Optional(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::MethodBegin(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::MethodEnd(l) => l.as_event_label().$name($($arg),*),
            LabelEnum::Block(l) => l.as_event_label().$name($($arg),*),
        }
    };
}

macro_rules! match_and_run_mut {
    ( $lab:expr, $name:ident $( , $arg:ident )* ) => {
        match $lab {
            LabelEnum::Begin(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::End(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::TCreate(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::TJoin(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Read(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Write(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Fence(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Malloc(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Free(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Toss(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Choice(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Optional(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::MethodBegin(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::MethodEnd(l) => l.as_event_label_mut().$name($($arg),*),
            LabelEnum::Block(l) => l.as_event_label_mut().$name($($arg),*),
        }
    };
}

impl LabelEnum {
    pub(crate) fn pos(&self) -> Event {
        match_and_run!(self, pos)
    }

    pub(crate) fn index(&self) -> u32 {
        match_and_run!(self, index)
    }

    pub(crate) fn thread(&self) -> ThreadId {
        match_and_run!(self, thread)
    }

    pub(crate) fn stamped(&self) -> bool {
        match_and_run!(self, stamped)
    }

    pub(crate) fn stamp(&self) -> usize {
        match_and_run!(self, stamp)
    }

    pub(crate) fn set_stamp(&mut self, s: usize) {
        match_and_run_mut!(self, set_stamp, s)
    }

    /// The label's po ∪ rf prefix, *without* its own direct dependency
    /// (rf for reads, create for begins, end for joins). Prefer
    /// `ExecutionGraph::porf` unless the label is a write (writes have no
    /// direct dependency).
    pub(crate) fn cached_porf(&self) -> &VectorClock {
        match_and_run!(self, cached_porf)
    }

    pub(crate) fn set_porf_cache(&mut self, v: VectorClock) {
        match_and_run_mut!(self, set_porf_cache, v)
    }

    /// The model-specific happens-before view, same caveat as `cached_porf`.
    pub(crate) fn cached_hb(&self) -> &VectorClock {
        match_and_run!(self, cached_hb)
    }

    pub(crate) fn set_hb_cache(&mut self, v: VectorClock) {
        match_and_run_mut!(self, set_hb_cache, v)
    }

    /// Happens-before at the last release fence po-before this label.
    pub(crate) fn cached_rel(&self) -> &VectorClock {
        match_and_run!(self, cached_rel)
    }

    pub(crate) fn set_rel_cache(&mut self, v: VectorClock) {
        match_and_run_mut!(self, set_rel_cache, v)
    }

    /// Union of the message views of all reads po-before this label;
    /// what an acquire fence synchronizes with.
    pub(crate) fn cached_acc(&self) -> &VectorClock {
        match_and_run!(self, cached_acc)
    }

    pub(crate) fn set_acc_cache(&mut self, v: VectorClock) {
        match_and_run_mut!(self, set_acc_cache, v)
    }

    /// Replaying a prefix must observe exactly the event recorded in the
    /// graph; any mismatch means the model is nondeterministic outside the
    /// engine's control.
    pub(crate) fn compare_for_replay(&self, other: &Self) -> Result<(), String> {
        match (self, other) {
            (LabelEnum::Begin(_), LabelEnum::Begin(_)) => return Ok(()),
            (LabelEnum::End(_), LabelEnum::End(_)) => return Ok(()),
            (LabelEnum::TCreate(s), LabelEnum::TCreate(o)) => {
                if s.name() != o.name() {
                    return Err(format!(
                        "Expected the thread to be named {:?} but it was named {:?}",
                        s.name(),
                        o.name()
                    ));
                }
                if s.sym_cid() != o.sym_cid() {
                    return Err(format!(
                        "Expected the symmetric thread id {:?} but got {:?}",
                        s.sym_cid(),
                        o.sym_cid()
                    ));
                }
                return Ok(());
            }
            (LabelEnum::TJoin(s), LabelEnum::TJoin(o)) => {
                if s.cid() != o.cid() {
                    return Err(format!(
                        "Expected to join thread {} but got thread {}",
                        s.cid(),
                        o.cid()
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Read(s), LabelEnum::Read(o)) => {
                if s.addr() != o.addr() || s.ordering() != o.ordering() || s.kind() != o.kind() {
                    return Err(format!(
                        "Expected the read {} but the thread issued {}",
                        s, o
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Write(s), LabelEnum::Write(o)) => {
                if s.addr() != o.addr() || s.ordering() != o.ordering() || s.val() != o.val() {
                    return Err(format!(
                        "Expected the write {} but the thread issued {}",
                        s, o
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Fence(s), LabelEnum::Fence(o)) => {
                if s.ordering() != o.ordering() {
                    return Err(format!(
                        "Expected a {} fence but got a {} fence",
                        s.ordering(),
                        o.ordering()
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Malloc(s), LabelEnum::Malloc(o)) => {
                if s.size() != o.size() {
                    return Err(format!(
                        "Expected an allocation of {} words but got {}",
                        s.size(),
                        o.size()
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Free(s), LabelEnum::Free(o)) => {
                if s.addr() != o.addr() {
                    return Err(format!(
                        "Expected to free {} but freed {}",
                        s.addr(),
                        o.addr()
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Toss(_), LabelEnum::Toss(_)) => return Ok(()),
            (LabelEnum::Choice(s), LabelEnum::Choice(o)) => {
                if s.range() != o.range() {
                    return Err(format!(
                        "Expected nondet over range {:?} but got {:?}",
                        s.range(),
                        o.range()
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Optional(_), LabelEnum::Optional(_)) => return Ok(()),
            (LabelEnum::MethodBegin(s), LabelEnum::MethodBegin(o)) => {
                if s.name() != o.name() {
                    return Err(format!(
                        "Expected method begin {:?} but got {:?}",
                        s.name(),
                        o.name()
                    ));
                }
                return Ok(());
            }
            (LabelEnum::MethodEnd(_), LabelEnum::MethodEnd(_)) => return Ok(()),
            (LabelEnum::Block(s), LabelEnum::Block(o)) => {
                if !Self::blocks_are_compatible(s.btype(), o.btype()) {
                    return Err(format!(
                        "Expected to block on {:?} but got {:?}",
                        s.btype(),
                        o.btype()
                    ));
                }
                return Ok(());
            }
            // A graph-resident Block can be re-observed as the blocked
            // operation itself when the thread retries it.
            (LabelEnum::Block(_), _) => return Ok(()),
            _ => {}
        }

        Err(format!(
            "At this point in the thread, it should have {} but it {} instead.",
            self.get_action_descr(),
            other.get_action_descr()
        ))
    }

    fn blocks_are_compatible(b1: &BlockType, b2: &BlockType) -> bool {
        match (b1, b2) {
            (BlockType::Assume, BlockType::Assume) => true,
            (BlockType::Assert, BlockType::Assert) => true,
            (BlockType::Spinloop, BlockType::Spinloop) => true,
            (BlockType::Join(a), BlockType::Join(b)) => a == b,
            (BlockType::Lock(a), BlockType::Lock(b)) => a == b,
            (BlockType::Barrier(a), BlockType::Barrier(b)) => a == b,
            _ => false,
        }
    }

    pub(crate) fn get_action_descr(&self) -> String {
        match self {
            LabelEnum::Begin(_) => "started".to_string(),
            LabelEnum::End(_) => "exited".to_string(),
            LabelEnum::TCreate(_) => "spawned another thread".to_string(),
            LabelEnum::TJoin(_) => "joined a thread".to_string(),
            LabelEnum::Read(rlab) => format!("read from {}", rlab.addr()),
            LabelEnum::Write(wlab) => format!("written to {}", wlab.addr()),
            LabelEnum::Fence(_) => "issued a fence".to_string(),
            LabelEnum::Malloc(_) => "allocated memory".to_string(),
            LabelEnum::Free(_) => "freed memory".to_string(),
            LabelEnum::Toss(_) => "called nondet() -> bool".to_string(),
            LabelEnum::Choice(c) => format!("called nondet over {:?}", c.range()),
            LabelEnum::Optional(_) => "entered an optional block".to_string(),
            LabelEnum::MethodBegin(_) => "entered a method".to_string(),
            LabelEnum::MethodEnd(_) => "left a method".to_string(),
            LabelEnum::Block(_) => "become blocked".to_string(),
        }
    }
}

impl fmt::Display for LabelEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelEnum::Begin(lab) => write!(f, "{}", lab),
            LabelEnum::End(lab) => write!(f, "{}", lab),
            LabelEnum::TCreate(lab) => write!(f, "{}", lab),
            LabelEnum::TJoin(lab) => write!(f, "{}", lab),
            LabelEnum::Read(lab) => write!(f, "{}", lab),
            LabelEnum::Write(lab) => write!(f, "{}", lab),
            LabelEnum::Fence(lab) => write!(f, "{}", lab),
            LabelEnum::Malloc(lab) => write!(f, "{}", lab),
            LabelEnum::Free(lab) => write!(f, "{}", lab),
            LabelEnum::Toss(lab) => write!(f, "{}", lab),
            LabelEnum::Choice(lab) => write!(f, "{}", lab),
            LabelEnum::Optional(lab) => write!(f, "{}", lab),
            LabelEnum::MethodBegin(lab) => write!(f, "{}", lab),
            LabelEnum::MethodEnd(lab) => write!(f, "{}", lab),
            LabelEnum::Block(lab) => write!(f, "{}", lab),
        }
    }
}

impl fmt::Debug for LabelEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Data common to every label: its position, its stamp, and the views the
/// consistency checker calculates on insertion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct EventLabel {
    pos: Event,
    stamp: Option<usize>,
    cached_porf: VectorClock,
    cached_hb: VectorClock,
    cached_rel: VectorClock,
    cached_acc: VectorClock,
}

impl EventLabel {
    fn new(p: Event) -> Self {
        Self {
            pos: p,
            stamp: None,
            cached_porf: VectorClock::new(),
            cached_hb: VectorClock::new(),
            cached_rel: VectorClock::new(),
            cached_acc: VectorClock::new(),
        }
    }

    fn main() -> Self {
        let mut vec = VectorClock::new();
        let pos = Event {
            thread: main_thread_id(),
            index: 0,
        };
        vec.set_tid(pos.thread);
        Self {
            pos,
            stamp: Some(0),
            cached_porf: vec.clone(),
            cached_hb: vec.clone(),
            cached_rel: VectorClock::new(),
            cached_acc: VectorClock::new(),
        }
    }

    pub(crate) fn pos(&self) -> Event {
        self.pos
    }

    pub(crate) fn index(&self) -> u32 {
        self.pos.index
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.pos.thread
    }

    pub(crate) fn stamped(&self) -> bool {
        self.stamp.is_some()
    }

    pub(crate) fn stamp(&self) -> usize {
        self.stamp.unwrap()
    }

    pub(crate) fn set_stamp(&mut self, s: usize) {
        self.stamp = Some(s)
    }

    pub(self) fn cached_porf(&self) -> &VectorClock {
        &self.cached_porf
    }

    pub(crate) fn set_porf_cache(&mut self, v: VectorClock) {
        self.cached_porf = v
    }

    pub(self) fn cached_hb(&self) -> &VectorClock {
        &self.cached_hb
    }

    pub(crate) fn set_hb_cache(&mut self, v: VectorClock) {
        self.cached_hb = v
    }

    pub(self) fn cached_rel(&self) -> &VectorClock {
        &self.cached_rel
    }

    pub(crate) fn set_rel_cache(&mut self, v: VectorClock) {
        self.cached_rel = v
    }

    pub(self) fn cached_acc(&self) -> &VectorClock {
        &self.cached_acc
    }

    pub(crate) fn set_acc_cache(&mut self, v: VectorClock) {
        self.cached_acc = v
    }
}

impl fmt::Display for EventLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if cfg!(feature = "print_stamps") {
            write!(f, "{} @ {}", self.stamp(), self.pos())
        } else {
            write!(f, "{}", self.pos())
        }
    }
}

pub(crate) trait AsEventLabel {
    fn as_event_label(&self) -> &EventLabel;
    fn as_event_label_mut(&mut self) -> &mut EventLabel;
    fn pos(&self) -> Event;
    fn stamp(&self) -> usize;
}

macro_rules! as_label {
    ($t:ty) => {
        impl AsEventLabel for $t {
            fn as_event_label(&self) -> &EventLabel {
                &self.label
            }
            fn as_event_label_mut(&mut self) -> &mut EventLabel {
                &mut self.label
            }
            fn pos(&self) -> Event {
                self.as_event_label().pos()
            }
            fn stamp(&self) -> usize {
                self.as_event_label().stamp()
            }
        }
    };
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Begin {
    label: EventLabel,
    parent: Option<Event>,
    sym_id: Option<ThreadId>,
}

impl Begin {
    pub(crate) fn new(pos: Event, parent: Option<Event>, sym_id: Option<ThreadId>) -> Self {
        Self {
            label: EventLabel::new(pos),
            parent,
            sym_id,
        }
    }

    pub(crate) fn main() -> Self {
        Self {
            label: EventLabel::main(),
            parent: None,
            sym_id: None,
        }
    }

    pub(crate) fn parent(&self) -> Option<Event> {
        self.parent
    }

    pub(crate) fn sym_id(&self) -> Option<ThreadId> {
        self.sym_id
    }
}

as_label!(Begin);

impl fmt::Display for Begin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: BEGIN", self.as_event_label())
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct End {
    label: EventLabel,
}

impl End {
    pub(crate) fn new(pos: Event) -> Self {
        Self {
            label: EventLabel::new(pos),
        }
    }
}

as_label!(End);

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: END", self.as_event_label())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TCreate {
    label: EventLabel,
    cid: ThreadId,
    name: Option<String>,
    sym_cid: Option<ThreadId>,
    origination_vec: Vec<u32>,
}

impl TCreate {
    pub(crate) fn new(
        pos: Event,
        cid: ThreadId,
        name: Option<String>,
        sym_cid: Option<ThreadId>,
        origination_vec: Vec<u32>,
    ) -> Self {
        Self {
            label: EventLabel::new(pos),
            cid,
            name,
            sym_cid,
            origination_vec,
        }
    }

    pub(crate) fn cid(&self) -> ThreadId {
        self.cid
    }

    pub(crate) fn sym_cid(&self) -> Option<ThreadId> {
        self.sym_cid
    }

    pub(crate) fn name(&self) -> &Option<String> {
        &self.name
    }

    pub(crate) fn origination_vec(&self) -> Vec<u32> {
        self.origination_vec.clone()
    }
}

as_label!(TCreate);

impl fmt::Display for TCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tname = match self.name() {
            None => "".to_owned(),
            Some(n) => format!(":\"{}\"", n),
        };
        write!(f, "{}: TCREATE({}{})", self.as_event_label(), self.cid, tname)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct TJoin {
    label: EventLabel,
    cid: ThreadId,
}

impl TJoin {
    pub(crate) fn new(pos: Event, cid: ThreadId) -> Self {
        Self {
            label: EventLabel::new(pos),
            cid,
        }
    }

    pub(crate) fn cid(&self) -> ThreadId {
        self.cid
    }
}

as_label!(TJoin);

impl fmt::Display for TJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: TJOIN({})", self.as_event_label(), self.cid)
    }
}

/// What a read does beyond observing a value. Exclusive kinds are the read
/// half of an RMW and are po-adjacent to their paired exclusive write when
/// the RMW takes effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ReadKind {
    Plain,
    Cas { expected: u64, new: u64 },
    Fai { op: FaiOp, operand: u64 },
    /// Lock acquisition: succeeds only on reading 0, writes 1.
    Lock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FaiOp {
    Add,
    Sub,
    Xchg,
}

impl FaiOp {
    pub(crate) fn apply(self, old: u64, operand: u64) -> u64 {
        match self {
            FaiOp::Add => old.wrapping_add(operand),
            FaiOp::Sub => old.wrapping_sub(operand),
            FaiOp::Xchg => operand,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Read {
    label: EventLabel,
    addr: MemAddr,
    ordering: MemOrdering,
    kind: ReadKind,
    rf: Option<Event>,
    revisitable: bool,
}

impl Read {
    pub(crate) fn new(pos: Event, addr: MemAddr, ordering: MemOrdering, kind: ReadKind) -> Self {
        Self {
            label: EventLabel::new(pos),
            addr,
            ordering,
            kind,
            rf: None,
            revisitable: true,
        }
    }

    pub(crate) fn addr(&self) -> MemAddr {
        self.addr
    }

    pub(crate) fn ordering(&self) -> MemOrdering {
        self.ordering
    }

    pub(crate) fn kind(&self) -> ReadKind {
        self.kind
    }

    /// Whether this is the read half of an RMW.
    pub(crate) fn is_exclusive(&self) -> bool {
        !matches!(self.kind, ReadKind::Plain)
    }

    pub(crate) fn rf(&self) -> Option<Event> {
        self.rf
    }

    pub(crate) fn set_rf(&mut self, rf: Option<Event>) {
        self.rf = rf
    }

    pub(crate) fn is_revisitable(&self) -> bool {
        self.revisitable
    }

    pub(crate) fn set_revisitable(&mut self, status: bool) {
        self.revisitable = status
    }
}

as_label!(Read);

impl fmt::Display for Read {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ReadKind::Plain => "R",
            ReadKind::Cas { .. } => "CASR",
            ReadKind::Fai { .. } => "FAIR",
            ReadKind::Lock => "LOCKR",
        };
        write!(
            f,
            "{}: {}{}({}) [{}]",
            self.label,
            kind,
            self.ordering,
            self.addr,
            match self.rf {
                None => "?".to_string(),
                Some(rf) => format!("{}", rf),
            },
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WriteKind {
    Plain,
    /// Write half of a successful CAS or lock acquisition.
    CasExcl,
    /// Write half of a fetch-and-increment family RMW.
    FaiExcl,
    /// Write half of a barrier-arrival FAI; exempt from revisits under BAM.
    BarrierFai,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Write {
    label: EventLabel,
    addr: MemAddr,
    ordering: MemOrdering,
    val: u64,
    kind: WriteKind,
    /// Reads currently reading from this write. Maintained by
    /// `ExecutionGraph::change_rf`; an optimization over rescanning.
    readers: SmallVec<[Event; 2]>,
    /// The view an acquire read of this write synchronizes with
    /// (the write's release sequence folded in).
    msg_view: VectorClock,
}

impl Write {
    pub(crate) fn new(
        pos: Event,
        addr: MemAddr,
        ordering: MemOrdering,
        val: u64,
        kind: WriteKind,
    ) -> Self {
        Self {
            label: EventLabel::new(pos),
            addr,
            ordering,
            val,
            kind,
            readers: SmallVec::new(),
            msg_view: VectorClock::new(),
        }
    }

    pub(crate) fn addr(&self) -> MemAddr {
        self.addr
    }

    pub(crate) fn ordering(&self) -> MemOrdering {
        self.ordering
    }

    pub(crate) fn val(&self) -> u64 {
        self.val
    }

    /// Whether this is the write half of an RMW.
    pub(crate) fn is_exclusive(&self) -> bool {
        !matches!(self.kind, WriteKind::Plain)
    }

    /// A write has no direct non-po dependency, so the cached view is its
    /// full porf.
    pub(crate) fn porf(&self) -> &VectorClock {
        &self.as_event_label().cached_porf
    }

    pub(crate) fn msg_view(&self) -> &VectorClock {
        &self.msg_view
    }

    pub(crate) fn set_msg_view(&mut self, v: VectorClock) {
        self.msg_view = v;
    }

    pub(crate) fn readers(&self) -> &SmallVec<[Event; 2]> {
        &self.readers
    }

    pub(crate) fn add_reader(&mut self, r: Event) {
        debug_assert!(!self.readers.contains(&r));
        self.readers.push(r);
    }

    pub(crate) fn remove_reader(&mut self, r: Event) {
        self.readers.retain(|&mut x| x != r);
    }
}

as_label!(Write);

impl fmt::Display for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            WriteKind::Plain => "W",
            WriteKind::CasExcl => "CASW",
            WriteKind::FaiExcl => "FAIW",
            WriteKind::BarrierFai => "BARW",
        };
        write!(
            f,
            "{}: {}{}({}, {})",
            self.label, kind, self.ordering, self.addr, self.val
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Fence {
    label: EventLabel,
    ordering: MemOrdering,
}

impl Fence {
    pub(crate) fn new(pos: Event, ordering: MemOrdering) -> Self {
        Self {
            label: EventLabel::new(pos),
            ordering,
        }
    }

    pub(crate) fn ordering(&self) -> MemOrdering {
        self.ordering
    }
}

as_label!(Fence);

impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: F{}", self.as_event_label(), self.ordering)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Malloc {
    label: EventLabel,
    addr: MemAddr,
    size: u64,
}

impl Malloc {
    pub(crate) fn new(pos: Event, addr: MemAddr, size: u64) -> Self {
        Self {
            label: EventLabel::new(pos),
            addr,
            size,
        }
    }

    pub(crate) fn addr(&self) -> MemAddr {
        self.addr
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

as_label!(Malloc);

impl fmt::Display for Malloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: MALLOC({}, {})",
            self.as_event_label(),
            self.addr,
            self.size
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Free {
    label: EventLabel,
    addr: MemAddr,
}

impl Free {
    pub(crate) fn new(pos: Event, addr: MemAddr) -> Self {
        Self {
            label: EventLabel::new(pos),
            addr,
        }
    }

    pub(crate) fn addr(&self) -> MemAddr {
        self.addr
    }
}

as_label!(Free);

impl fmt::Display for Free {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: FREE({})", self.as_event_label(), self.addr)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Toss {
    label: EventLabel,
    result: bool,
}

impl Toss {
    pub(crate) fn new(pos: Event) -> Self {
        Self {
            label: EventLabel::new(pos),
            result: Self::maximal(),
        }
    }

    pub(crate) fn result(&self) -> bool {
        self.result
    }

    pub(crate) fn set_result(&mut self, result: bool) {
        self.result = result
    }

    pub(crate) fn maximal() -> bool {
        false
    }
}

as_label!(Toss);

impl fmt::Display for Toss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: NONDET {}", self.as_event_label(), self.result())
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Choice {
    label: EventLabel,
    range: RangeInclusive<u64>,
    result: u64,
}

impl Choice {
    pub(crate) fn new(pos: Event, range: RangeInclusive<u64>) -> Self {
        let start = *range.start();
        Self {
            label: EventLabel::new(pos),
            range,
            result: start,
        }
    }

    pub(crate) fn range(&self) -> &RangeInclusive<u64> {
        &self.range
    }

    pub(crate) fn result(&self) -> u64 {
        self.result
    }

    pub(crate) fn set_result(&mut self, result: u64) {
        assert!(self.range.contains(&result));
        self.result = result
    }
}

as_label!(Choice);

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: CHOOSE {}[{}-{}]",
            self.as_event_label(),
            self.result(),
            self.range().start(),
            self.range().end()
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Optional {
    label: EventLabel,
    expanded: bool,
}

impl Optional {
    pub(crate) fn new(pos: Event) -> Self {
        Self {
            label: EventLabel::new(pos),
            expanded: false,
        }
    }

    pub(crate) fn is_expanded(&self) -> bool {
        self.expanded
    }

    pub(crate) fn set_expanded(&mut self, expanded: bool) {
        self.expanded = expanded
    }
}

as_label!(Optional);

impl fmt::Display for Optional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: OPTIONAL{}",
            self.as_event_label(),
            if self.expanded { " [expanded]" } else { "" }
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct MethodBegin {
    label: EventLabel,
    name: String,
}

impl MethodBegin {
    pub(crate) fn new(pos: Event, name: String) -> Self {
        Self {
            label: EventLabel::new(pos),
            name,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

as_label!(MethodBegin);

impl fmt::Display for MethodBegin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: MBEGIN({})", self.as_event_label(), self.name)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct MethodEnd {
    label: EventLabel,
    name: String,
}

impl MethodEnd {
    pub(crate) fn new(pos: Event, name: String) -> Self {
        Self {
            label: EventLabel::new(pos),
            name,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

as_label!(MethodEnd);

impl fmt::Display for MethodEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: MEND({})", self.as_event_label(), self.name)
    }
}

// Block events are terminal for a thread until the condition they wait for
// is met (Join/Lock/Barrier, removed by the scheduler) or the branch is
// abandoned (Assume/Assert/Spinloop). The blocked operation is re-issued
// by the runtime when the Block is removed, overwriting it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum BlockType {
    // User-level blocking
    Assume,
    Assert,
    Spinloop,
    // Internal blocking, removed when the dependency appears
    Join(ThreadId),
    Lock(MemAddr),
    Barrier(MemAddr),
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct Block {
    label: EventLabel,
    btype: BlockType,
}

impl Block {
    pub(crate) fn new(pos: Event, t: BlockType) -> Self {
        Self {
            label: EventLabel::new(pos),
            btype: t,
        }
    }

    pub(crate) fn btype(&self) -> &BlockType {
        &self.btype
    }
}

as_label!(Block);

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: BLK {:?}", self.as_event_label(), self.btype())
    }
}
