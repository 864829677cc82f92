//! Walks one process's own attachments/transactions/requests and emits them as
//! [`crate::codec::DumpRecord`]s (spec §4.5).
//!
//! Traversal order, fixed by the spec: the database record, every user attachment,
//! every system attachment, and per attachment — its context variables, every
//! transaction (with that transaction's own context variables), the call-stack frames
//! reachable through `request.caller` chains, and finally every top-level request.
//! Nothing here mutates engine state; `DatabaseSnapshot` is a read-only, already-frozen
//! view the caller is responsible for taking under whatever per-attachment latch the
//! real engine uses to hold the transaction/request lists still during the walk.

use crate::codec::Writer;
use crate::ids::{GlobalId, StatIdGenerator};
use crate::model::{
    AttachmentSnapshot, DatabaseSnapshot, RequestSnapshot, StatGroup, StatSnapshot,
    TransactionSnapshot, field,
};
use crate::model::RelationId;
use utils::id::ProcessId;

/// Stateless: every call to [`Collector::dump_self`] is a fresh walk of whatever
/// `DatabaseSnapshot` the caller hands it, stamping freshly generated `stat_id`s as it
/// goes. The `StatIdGenerator` is threaded through explicitly (rather than owned here)
/// so a process with several attached databases shares one counter, keeping global ids
/// unique across all of them.
pub struct Collector;

impl Collector {
    /// Emits `snapshot` as a DumpRecord stream into `writer`, in the fixed order spec
    /// §4.5 mandates. `process_id` is stamped into every `GLOBAL_ID` field; it is
    /// always this process's own id — Collector only ever dumps its own contribution.
    pub fn dump_self(
        writer: &mut Writer,
        snapshot: &DatabaseSnapshot,
        stat_ids: &StatIdGenerator,
        process_id: ProcessId,
    ) {
        // Strings arriving here are already Rust `String`s, which are valid UTF-8 by
        // construction; the "transliterate to UTF-8 before writing" duty spec §4.5
        // assigns to Collector is therefore discharged at the engine/model boundary
        // rather than needing an explicit conversion pass in this function.
        let db_stat_id = stat_ids.next_global_id(process_id);
        Self::emit_database(writer, snapshot, db_stat_id);

        let (system, user): (Vec<&AttachmentSnapshot>, Vec<&AttachmentSnapshot>) =
            snapshot.attachments.iter().partition(|a| a.is_system);
        for attachment in user.into_iter().chain(system) {
            Self::emit_attachment(writer, attachment, stat_ids, process_id);
        }
    }

    fn emit_database(writer: &mut Writer, snapshot: &DatabaseSnapshot, stat_id: GlobalId) {
        {
            let mut r = writer.begin_record(RelationId::Database.into());
            r.string(field::DB_NAME, &snapshot.db_name);
            r.integer(field::DB_SHUTDOWN_MODE, snapshot.shutdown_mode.code());
            r.integer(field::DB_BACKUP_STATE, snapshot.backup_state.code());
        }
        Self::emit_stats(writer, stat_id, StatGroup::Database, &snapshot.stats);
    }

    fn emit_attachment(
        writer: &mut Writer,
        attachment: &AttachmentSnapshot,
        stat_ids: &StatIdGenerator,
        process_id: ProcessId,
    ) {
        let stat_id = stat_ids.next_global_id(process_id);
        {
            let mut r = writer.begin_record(RelationId::Attachments.into());
            r.string(field::ATT_USER, &attachment.user);
            r.integer(field::ATT_ID, attachment.id as i64);
            r.integer(field::ATT_STATE, attachment.state.code());
            r.string(field::ATT_REMOTE_ADDR, &attachment.remote_addr);
            r.integer(field::ATT_CHARSET, attachment.charset.code());
        }
        Self::emit_stats(writer, stat_id, StatGroup::Attachment, &attachment.stats);

        for var in &attachment.context_vars {
            Self::emit_ctx_var(writer, var);
        }
        for tx in &attachment.transactions {
            Self::emit_transaction(writer, tx, stat_ids, process_id);
        }

        // Call-stack frames reachable through `request.caller` chains: only frames
        // whose owning statement is visible (neither INTERNAL nor SYSTEM_TRIGGER) and
        // whose caller is non-null (spec §4.5 "Calls").
        for request in &attachment.requests {
            if request.kind.is_visible() {
                if let Some(caller) = request.caller {
                    let call_stat_id = stat_ids.next_global_id(process_id);
                    {
                        let mut r = writer.begin_record(RelationId::Calls.into());
                        r.integer(field::CALL_ID, request.id as i64);
                        r.integer(field::CALL_CALLER_ID, caller as i64);
                    }
                    Self::emit_stats(writer, call_stat_id, StatGroup::Call, &request.stats);
                }
            }
        }

        // Top-level requests: statements neither INTERNAL nor SYSTEM_TRIGGER (spec
        // §4.5 "Requests"), emitted as the request's own `rel_statements` row.
        for request in &attachment.requests {
            if request.kind.is_visible() {
                Self::emit_statement(writer, request, stat_ids, process_id);
            }
        }
    }

    fn emit_transaction(
        writer: &mut Writer,
        tx: &TransactionSnapshot,
        stat_ids: &StatIdGenerator,
        process_id: ProcessId,
    ) {
        let stat_id = stat_ids.next_global_id(process_id);
        {
            let mut r = writer.begin_record(RelationId::Transactions.into());
            r.integer(field::TRA_ID, tx.id as i64);
            r.integer(field::TRA_STATE, tx.state.code());
            r.integer(field::TRA_ISOLATION, tx.isolation.code());
        }
        Self::emit_stats(writer, stat_id, StatGroup::Transaction, &tx.stats);

        for var in &tx.context_vars {
            Self::emit_ctx_var(writer, var);
        }
    }

    fn emit_statement(
        writer: &mut Writer,
        request: &RequestSnapshot,
        stat_ids: &StatIdGenerator,
        process_id: ProcessId,
    ) {
        let stat_id = stat_ids.next_global_id(process_id);
        {
            let mut r = writer.begin_record(RelationId::Statements.into());
            r.integer(field::STMT_ID, request.id as i64);
            r.integer(field::STMT_STATE, request.state.code());
            r.string(field::STMT_SQL_TEXT, &request.sql_text);
        }
        Self::emit_stats(writer, stat_id, StatGroup::Statement, &request.stats);
    }

    fn emit_ctx_var(writer: &mut Writer, var: &crate::model::ContextVar) {
        let mut r = writer.begin_record(RelationId::CtxVars.into());
        r.string(field::CTX_NAMESPACE, &var.namespace);
        r.string(field::CTX_VAR_NAME, &var.name);
        r.string(field::CTX_VAR_VALUE, &var.value);
    }

    /// Emits the `rel_io_stats`/`rel_rec_stats`/`rel_mem_usage` child records that
    /// accompany every primary object, all tagged with the same `stat_id` and a
    /// `StatGroup` naming which kind of object they belong to (spec §4.5 "Each object
    /// is emitted as one DumpRecord plus its associated statistics and memory-usage
    /// child records, all tagged with a monotonically generated stat_id").
    fn emit_stats(writer: &mut Writer, stat_id: GlobalId, group: StatGroup, stats: &StatSnapshot) {
        {
            let mut r = writer.begin_record(RelationId::IoStats.into());
            r.global_id(field::STAT_ID, stat_id);
            r.integer(field::STAT_GROUP, group.code());
            r.integer(field::IO_READS, stats.io_reads);
            r.integer(field::IO_WRITES, stats.io_writes);
        }
        {
            let mut r = writer.begin_record(RelationId::RecStats.into());
            r.global_id(field::STAT_ID, stat_id);
            r.integer(field::STAT_GROUP, group.code());
            r.integer(field::REC_FETCHES, stats.rec_fetches);
            r.integer(field::REC_INSERTS, stats.rec_inserts);
        }
        {
            let mut r = writer.begin_record(RelationId::MemUsage.into());
            r.global_id(field::STAT_ID, stat_id);
            r.integer(field::STAT_GROUP, group.code());
            r.integer(field::MEM_USED, stats.mem_used);
            r.integer(field::MEM_ALLOCATED, stats.mem_allocated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::model::{
        BackupState, Charset, ContextVar, IsolationMode, RequestKind, ShutdownMode, State,
    };

    fn sample() -> DatabaseSnapshot {
        DatabaseSnapshot {
            db_name: "db1".into(),
            shutdown_mode: ShutdownMode::Online,
            backup_state: BackupState::Normal,
            stats: StatSnapshot::default(),
            attachments: vec![
                AttachmentSnapshot {
                    id: 1,
                    user: "alice".into(),
                    is_system: false,
                    state: State::Active,
                    remote_addr: "127.0.0.1".into(),
                    charset: Charset::Utf8,
                    stats: StatSnapshot::default(),
                    context_vars: vec![ContextVar {
                        namespace: "USER_SESSION".into(),
                        name: "role".into(),
                        value: "admin".into(),
                    }],
                    transactions: vec![TransactionSnapshot {
                        id: 100,
                        state: State::Active,
                        isolation: IsolationMode::Concurrency,
                        stats: StatSnapshot::default(),
                        context_vars: vec![],
                    }],
                    requests: vec![
                        RequestSnapshot {
                            id: 200,
                            kind: RequestKind::Normal,
                            state: State::Idle,
                            sql_text: "select 1".into(),
                            caller: None,
                            stats: StatSnapshot::default(),
                        },
                        RequestSnapshot {
                            id: 201,
                            kind: RequestKind::Normal,
                            state: State::Active,
                            sql_text: "select 2".into(),
                            caller: Some(200),
                            stats: StatSnapshot::default(),
                        },
                        RequestSnapshot {
                            id: 202,
                            kind: RequestKind::Internal,
                            state: State::Active,
                            sql_text: "internal housekeeping".into(),
                            caller: Some(200),
                            stats: StatSnapshot::default(),
                        },
                    ],
                },
                AttachmentSnapshot {
                    id: 2,
                    user: "SYSDBA".into(),
                    is_system: true,
                    state: State::Idle,
                    remote_addr: "".into(),
                    charset: Charset::Utf8,
                    stats: StatSnapshot::default(),
                    context_vars: vec![],
                    transactions: vec![],
                    requests: vec![],
                },
            ],
        }
    }

    fn decode(snapshot: &DatabaseSnapshot) -> Vec<crate::codec::DumpRecord> {
        let mut writer = Writer::new();
        let gen = StatIdGenerator::default();
        Collector::dump_self(&mut writer, snapshot, &gen, ProcessId(1000));
        Decoder::new(&writer.finish()).decode_all().unwrap()
    }

    #[test]
    fn user_attachments_precede_system_attachments() {
        let records = decode(&sample());
        let attachment_users: Vec<&str> = records
            .iter()
            .filter(|r| r.relation_id == u16::from(RelationId::Attachments))
            .map(|r| r.field(field::ATT_USER).unwrap().as_str().unwrap())
            .collect();
        assert_eq!(attachment_users, vec!["alice", "SYSDBA"]);
    }

    #[test]
    fn internal_requests_are_excluded_from_statements_and_calls() {
        let records = decode(&sample());
        let statement_ids: Vec<i64> = records
            .iter()
            .filter(|r| r.relation_id == u16::from(RelationId::Statements))
            .map(|r| r.field(field::STMT_ID).unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(statement_ids, vec![200, 201]);

        let call_ids: Vec<i64> = records
            .iter()
            .filter(|r| r.relation_id == u16::from(RelationId::Calls))
            .map(|r| r.field(field::CALL_ID).unwrap().as_i64().unwrap())
            .collect();
        // request 200 has no caller (not a call frame); request 202 is internal.
        assert_eq!(call_ids, vec![201]);
    }

    #[test]
    fn every_primary_object_gets_three_stat_children_with_a_shared_stat_id() {
        let records = decode(&sample());
        let db_name_field = field::DB_NAME;
        let db_record = records
            .iter()
            .find(|r| r.relation_id == u16::from(RelationId::Database))
            .unwrap();
        assert_eq!(db_record.field(db_name_field).unwrap().as_str(), Some("db1"));

        let io = records
            .iter()
            .filter(|r| r.relation_id == u16::from(RelationId::IoStats))
            .count();
        let rec = records
            .iter()
            .filter(|r| r.relation_id == u16::from(RelationId::RecStats))
            .count();
        let mem = records
            .iter()
            .filter(|r| r.relation_id == u16::from(RelationId::MemUsage))
            .count();
        // 1 database + 2 attachments + 1 transaction + 2 statements + 1 call = 7
        // primary objects, each with exactly one IoStats/RecStats/MemUsage sibling.
        assert_eq!((io, rec, mem), (7, 7, 7));
    }

    #[test]
    fn db_name_and_att_user_are_always_the_first_field() {
        let records = decode(&sample());
        for record in &records {
            if record.relation_id == u16::from(RelationId::Database) {
                assert_eq!(record.fields[0].field_id, field::DB_NAME);
            }
            if record.relation_id == u16::from(RelationId::Attachments) {
                assert_eq!(record.fields[0].field_id, field::ATT_USER);
            }
        }
    }
}
