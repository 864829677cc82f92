//! Domain model and the narrow, mock-friendly traits the rest of the crate uses to
//! talk to the surrounding engine (spec §6 "Engine interfaces consumed"). None of
//! these types own the engine's real relation/record/format metadata, transaction
//! structures, or lock manager — they're the seam a real integration plugs into, and
//! what the test suite fakes.

use std::fmt;

use strum_macros::{Display, EnumString};
use utils::id::{LocalId, ProcessId};

/// Attachment/transaction/request/call run state (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum State {
    Idle,
    Active,
    Stalled,
}

impl State {
    /// Wire code for the `*_STATE` integer fields (spec §6 "idle=0, active=1,
    /// stalled=2").
    pub fn code(self) -> i64 {
        match self {
            State::Idle => 0,
            State::Active => 1,
            State::Stalled => 2,
        }
    }
}

/// Database shutdown mode (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ShutdownMode {
    Online,
    Multi,
    Single,
    Full,
}

impl ShutdownMode {
    pub fn code(self) -> i64 {
        match self {
            ShutdownMode::Online => 0,
            ShutdownMode::Multi => 1,
            ShutdownMode::Single => 2,
            ShutdownMode::Full => 3,
        }
    }
}

/// Transaction isolation mode (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum IsolationMode {
    Consistency,
    Concurrency,
    RcNoVersion,
    RcVersion,
}

impl IsolationMode {
    pub fn code(self) -> i64 {
        match self {
            IsolationMode::Consistency => 0,
            IsolationMode::Concurrency => 1,
            IsolationMode::RcNoVersion => 2,
            IsolationMode::RcVersion => 3,
        }
    }
}

/// Backup/nbackup state (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BackupState {
    Unknown,
    Normal,
    Stalled,
    Merge,
}

impl BackupState {
    pub fn code(self) -> i64 {
        match self {
            BackupState::Unknown => 0,
            BackupState::Normal => 1,
            BackupState::Stalled => 2,
            BackupState::Merge => 3,
        }
    }
}

/// Which kind of object a child statistics/memory-usage record is attached to (spec
/// §6 "Statistics group tag").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StatGroup {
    Database,
    Attachment,
    Transaction,
    Statement,
    Call,
}

impl StatGroup {
    pub fn code(self) -> i64 {
        match self {
            StatGroup::Database => 0,
            StatGroup::Attachment => 1,
            StatGroup::Transaction => 2,
            StatGroup::Statement => 3,
            StatGroup::Call => 4,
        }
    }
}

/// The nine virtual relations exposed upward, keyed by the numeric ids spec §6 lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RelationId {
    Database = 1,
    Attachments = 2,
    Transactions = 3,
    Statements = 4,
    Calls = 5,
    IoStats = 6,
    RecStats = 7,
    CtxVars = 8,
    MemUsage = 9,
}

impl RelationId {
    pub const ALL: [RelationId; 9] = [
        RelationId::Database,
        RelationId::Attachments,
        RelationId::Transactions,
        RelationId::Statements,
        RelationId::Calls,
        RelationId::IoStats,
        RelationId::RecStats,
        RelationId::CtxVars,
        RelationId::MemUsage,
    ];
}

impl TryFrom<u16> for RelationId {
    type Error = u16;

    fn try_from(v: u16) -> Result<Self, u16> {
        Ok(match v {
            1 => RelationId::Database,
            2 => RelationId::Attachments,
            3 => RelationId::Transactions,
            4 => RelationId::Statements,
            5 => RelationId::Calls,
            6 => RelationId::IoStats,
            7 => RelationId::RecStats,
            8 => RelationId::CtxVars,
            9 => RelationId::MemUsage,
            other => return Err(other),
        })
    }
}

impl From<RelationId> for u16 {
    fn from(r: RelationId) -> u16 {
        r as u16
    }
}

/// Field ids used by this crate's own records. The real engine's data dictionary owns
/// the authoritative catalog (spec §6); this is the slice of it Collector/Assembler
/// need to name explicitly because the row filter depends on field *order*
/// (`db_name`/`att_user` must come first).
pub mod field {
    pub const DB_NAME: u16 = 1;
    pub const DB_SHUTDOWN_MODE: u16 = 2;
    pub const DB_BACKUP_STATE: u16 = 3;

    pub const ATT_USER: u16 = 10;
    pub const ATT_ID: u16 = 11;
    pub const ATT_STATE: u16 = 12;
    pub const ATT_REMOTE_ADDR: u16 = 13;
    pub const ATT_CHARSET: u16 = 14;

    pub const TRA_ID: u16 = 20;
    pub const TRA_STATE: u16 = 21;
    pub const TRA_ISOLATION: u16 = 22;

    pub const STMT_ID: u16 = 30;
    pub const STMT_STATE: u16 = 31;
    pub const STMT_SQL_TEXT: u16 = 32;

    pub const CALL_ID: u16 = 40;
    pub const CALL_CALLER_ID: u16 = 41;

    pub const STAT_ID: u16 = 50;
    pub const STAT_GROUP: u16 = 51;

    pub const IO_READS: u16 = 60;
    pub const IO_WRITES: u16 = 61;

    pub const REC_FETCHES: u16 = 70;
    pub const REC_INSERTS: u16 = 71;

    pub const CTX_NAMESPACE: u16 = 80;
    pub const CTX_VAR_NAME: u16 = 81;
    pub const CTX_VAR_VALUE: u16 = 82;

    pub const MEM_USED: u16 = 90;
    pub const MEM_ALLOCATED: u16 = 91;
}

/// Identity of the attachment that asked for a snapshot (spec §4.6 "Row filtering
/// rules").
#[derive(Clone, Debug)]
pub struct AttachmentIdentity {
    pub database_name: String,
    pub user_name: String,
    pub locksmith: bool,
}

/// Charset a text column is stored as, for the purposes of the NONE→`?` substitution
/// rule (spec §4.6, scenario 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Charset {
    /// No charset conversion has happened; bytes may not be valid UTF-8/ASCII.
    None,
    /// The target column's declared charset is the engine's metadata charset
    /// (effectively ASCII-only for this subsystem's purposes).
    Metadata,
    Utf8,
}

impl Charset {
    /// Wire code stamped into the `ATT_CHARSET` field so a row filter running in a
    /// different process than the one that collected the attachment still knows its
    /// source charset (spec §4.6 "Type conversion" / scenario 5).
    pub fn code(self) -> i64 {
        match self {
            Charset::None => 0,
            Charset::Metadata => 1,
            Charset::Utf8 => 2,
        }
    }

    pub fn from_code(code: i64) -> Charset {
        match code {
            0 => Charset::None,
            1 => Charset::Metadata,
            _ => Charset::Utf8,
        }
    }
}

/// How a single value transfers from a decoded [`DumpField`](crate::codec::DumpField)
/// into a materialized row column (spec §4.6 "Type conversion").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Timestamp,
    /// `is_blob` marks a column whose value is blob-backed in the real engine (e.g. a
    /// long SQL text), triggering the reparent-to-owning-transaction step of spec
    /// §4.6/§9 on materialization.
    Text { charset: Charset, is_blob: bool },
    /// A [`crate::ids::GlobalId`] collapsed to a per-snapshot 32-bit local id.
    LocalId,
}

#[derive(Clone, Debug)]
pub struct ColumnFormat {
    pub field_id: u16,
    pub kind: ColumnKind,
}

/// The engine-owned column layout for one virtual relation (spec §6 "Format
/// registry").
#[derive(Clone, Debug, Default)]
pub struct Format {
    pub columns: Vec<ColumnFormat>,
}

impl Format {
    pub fn column(&self, field_id: u16) -> Option<&ColumnFormat> {
        self.columns.iter().find(|c| c.field_id == field_id)
    }
}

/// Looks up the engine's column layout for a relation (spec §6 "Format registry:
/// `format_for(relation_id) -> Format`").
pub trait FormatRegistry {
    fn format_for(&self, relation: RelationId) -> Format;
}

/// A single materialized value in a row (engine's "native record layout", spec §3
/// "VirtualRow buffer").
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Timestamp(i64),
    Text(String),
    LocalId(u32),
}

/// One materialized row, column values in [`Format`] order.
#[derive(Clone, Debug, Default)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn set(&mut self, index: usize, value: Value) {
        if self.values.len() <= index {
            self.values.resize(index + 1, Value::Null);
        }
        self.values[index] = value;
    }
}

/// Engine-provided destination for materialized rows (spec §6 "Row sink:
/// `RowBuffer::append(row)`"). One instance per monitoring relation, owned by the
/// assembler for the lifetime of the requesting transaction.
#[derive(Clone, Debug, Default)]
pub struct RowBuffer {
    pub relation: Option<RelationId>,
    pub rows: Vec<Row>,
}

impl RowBuffer {
    pub fn new(relation: RelationId) -> Self {
        RowBuffer {
            relation: Some(relation),
            rows: Vec::new(),
        }
    }

    pub fn append(&mut self, row: Row) {
        self.rows.push(row);
    }
}

/// Liveness oracle: is a process still alive (spec §6 `ISC_check_process_existence`).
pub trait LivenessOracle: Send + Sync {
    fn is_process_alive(&self, pid: ProcessId) -> bool;
}

/// Liveness oracle backed by `kill(pid, 0)`: the standard POSIX "does this pid exist
/// and am I allowed to signal it" probe, with no signal actually delivered.
pub struct SignalZeroLivenessOracle;

impl LivenessOracle for SignalZeroLivenessOracle {
    fn is_process_alive(&self, pid: ProcessId) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid.0 as i32), None).is_ok()
    }
}

/// Opaque handle to a blob value materialized during row transfer (spec §4.6, last
/// bullet; spec §9 "Row-buffer lifetime tying blobs to transactions").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlobHandle(pub u64);

/// Owning transaction a blob gets reparented into, so it outlives the request that
/// produced it for as long as the snapshot's row buffers are alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

/// Engine-provided blob lifetime management (spec §9). The implementation is free to
/// use refcounting, a handle table, or arena tagging; this crate only needs to know
/// that a blob produced while walking one request can be told to outlive it.
pub trait BlobArena: Send + Sync {
    fn reparent(&self, blob: BlobHandle, owner: TransactionId);
}

/// No-op arena for engines (or tests) that never produce blob-backed columns.
#[derive(Default)]
pub struct NullBlobArena;

impl BlobArena for NullBlobArena {
    fn reparent(&self, _blob: BlobHandle, _owner: TransactionId) {}
}

/// Per-object I/O, record, and memory counters (spec §4.5 "associated statistics and
/// memory-usage child records"). One instance accompanies every database, attachment,
/// transaction, statement, and call record Collector emits; the real engine's runtime
/// statistics counters (out of scope here per spec §1) are the source of these values.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatSnapshot {
    pub io_reads: i64,
    pub io_writes: i64,
    pub rec_fetches: i64,
    pub rec_inserts: i64,
    pub mem_used: i64,
    pub mem_allocated: i64,
}

/// A single user or system attachment's view of the collector's own process, as
/// handed to [`crate::collector::Collector`]. This is the read side of the engine's
/// attachment/transaction/request object graph, frozen for the duration of one
/// `dump_self` call by whatever per-attachment latch the engine uses (spec §4.5).
pub struct DatabaseSnapshot {
    pub db_name: String,
    pub shutdown_mode: ShutdownMode,
    pub backup_state: BackupState,
    pub stats: StatSnapshot,
    pub attachments: Vec<AttachmentSnapshot>,
}

pub struct AttachmentSnapshot {
    pub id: u32,
    pub user: String,
    pub is_system: bool,
    pub state: State,
    pub remote_addr: String,
    pub charset: Charset,
    pub stats: StatSnapshot,
    pub context_vars: Vec<ContextVar>,
    pub transactions: Vec<TransactionSnapshot>,
    pub requests: Vec<RequestSnapshot>,
}

pub struct TransactionSnapshot {
    pub id: u32,
    pub state: State,
    pub isolation: IsolationMode,
    pub stats: StatSnapshot,
    pub context_vars: Vec<ContextVar>,
}

/// A request (prepared statement) and, via `caller`, the call stack it's part of.
/// Non-top-level requests are only visible by walking `caller` chains off some other
/// request (spec §4.5 "Calls").
pub struct RequestSnapshot {
    pub id: u32,
    pub kind: RequestKind,
    pub state: State,
    pub sql_text: String,
    pub caller: Option<u32>,
    pub stats: StatSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Normal,
    Internal,
    SystemTrigger,
}

impl RequestKind {
    /// Spec §4.5: calls/requests whose owning statement is `INTERNAL` or
    /// `SYSTEM_TRIGGER` are excluded from both the "Calls" and "Requests" walks.
    pub fn is_visible(&self) -> bool {
        matches!(self, RequestKind::Normal)
    }
}

#[derive(Clone, Debug)]
pub struct ContextVar {
    pub namespace: String,
    pub name: String,
    pub value: String,
}

impl fmt::Debug for DatabaseSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSnapshot")
            .field("db_name", &self.db_name)
            .field("attachments", &self.attachments.len())
            .finish()
    }
}
