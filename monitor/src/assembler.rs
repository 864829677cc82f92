//! `SnapshotAssembler`: drives one round (spec §4.6) — publish-self, force-peers,
//! read the store, filter by the requesting attachment's identity, and materialize
//! virtual relation row buffers. Single-use: one instance is built per requesting
//! transaction and its row buffers live exactly as long as that transaction does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::{Decoder, DumpField, Writer};
use crate::error::{MonitorError, MonitorResult};
use crate::ids::{GlobalId, LocalIdMap, StatIdGenerator};
use crate::lock::CoordinationLock;
use crate::metrics::MonitorMetrics;
use crate::model::{
    AttachmentIdentity, BlobArena, BlobHandle, Charset, ColumnKind, DatabaseSnapshot,
    Format, FormatRegistry, LivenessOracle, RelationId, Row, RowBuffer, TransactionId, Value,
    field,
};
use crate::store::{ContributionKey, MonitoringStore};

/// Everything the assembler needs from the surrounding engine to run one round,
/// bundled so construction doesn't take a dozen positional arguments. Each field is
/// one of the narrow interfaces spec §6 names.
pub struct SnapshotInputs<'a> {
    pub store: &'a MonitoringStore,
    pub lock: &'a CoordinationLock,
    pub liveness: &'a dyn LivenessOracle,
    pub formats: &'a dyn FormatRegistry,
    pub blob_arena: &'a dyn BlobArena,
    pub stat_ids: &'a StatIdGenerator,
    pub metrics: Option<&'a MonitorMetrics>,
    /// Mirrors [`crate::MonitorConfig::tolerate_self_publish_errors`]: if true, a
    /// failure in the mandatory self-publish step (spec §4.6 step 3) is logged and
    /// treated as "this process contributes nothing this round" instead of aborting
    /// the whole snapshot.
    pub tolerate_self_publish_errors: bool,
}

/// Owns the materialized row buffers for one monitoring query, for the lifetime of
/// the requesting transaction (spec §3 "VirtualRow buffer lifecycle").
pub struct SnapshotAssembler {
    buffers: HashMap<RelationId, RowBuffer>,
    next_blob_handle: AtomicU64,
}

impl SnapshotAssembler {
    /// Runs one full round and returns the assembled, filtered row buffers. `own_key`
    /// identifies this attachment's own contribution in the store; `own_snapshot`
    /// lazily produces this process's current `DatabaseSnapshot` — it's only invoked
    /// during the self-publish step (spec §4.6 step 3), never called again.
    pub fn build(
        identity: &AttachmentIdentity,
        own_key: ContributionKey,
        process_id: utils::id::ProcessId,
        own_snapshot: impl Fn() -> DatabaseSnapshot,
        owner_tx: TransactionId,
        inputs: &SnapshotInputs<'_>,
    ) -> MonitorResult<SnapshotAssembler> {
        // Step 1: refresh/validate database header metadata. In this implementation
        // that validation already happened when `inputs.store`'s underlying region was
        // opened/attached (layout-version check, spec §4.1) — nothing further to do
        // here, since the store handle is a precondition of calling `build` at all.

        // Step 2: allocate one empty row buffer per monitoring relation, using the
        // engine-supplied column layout.
        let mut assembler = SnapshotAssembler {
            buffers: RelationId::ALL
                .iter()
                .map(|&relation| (relation, RowBuffer::new(relation)))
                .collect(),
            next_blob_handle: AtomicU64::new(1),
        };

        // Step 3: publish a fresh self-contribution directly through Collector (so the
        // reader sees itself at an up-to-date state), unconditionally — unlike the AST
        // path, this must happen every round regardless of `MONITOR_OFF` — then release
        // this attachment's own shared monitor lock so it receives the AST in its turn
        // on some future round.
        if let Err(e) =
            Self::publish_self(inputs.store, own_key, process_id, &own_snapshot, inputs.stat_ids)
        {
            if inputs.tolerate_self_publish_errors {
                tracing::warn!(error = %e, "self-publish failed, continuing round without a fresh own contribution");
            } else {
                return Err(e);
            }
        }
        inputs.lock.release_self();

        // Step 4: force every peer to publish by cycling the lock exclusive/release.
        inputs.lock.request_snapshot()?;
        if let Some(metrics) = inputs.metrics {
            metrics.snapshot_rounds_total.inc();
        }

        // Step 5: read the compacted dump.
        let bytes = inputs.store.read(own_key, inputs.liveness, inputs.metrics)?;

        // Step 6: decode and filter into row buffers.
        assembler.decode_and_filter(&bytes, identity, owner_tx, inputs)?;

        Ok(assembler)
    }

    fn publish_self(
        store: &MonitoringStore,
        own_key: ContributionKey,
        process_id: utils::id::ProcessId,
        own_snapshot: &impl Fn() -> DatabaseSnapshot,
        stat_ids: &StatIdGenerator,
    ) -> MonitorResult<()> {
        let snapshot = own_snapshot();
        let mut writer = Writer::new();
        crate::collector::Collector::dump_self(&mut writer, &snapshot, stat_ids, process_id);
        store.write(own_key, &writer.finish())
    }

    pub fn buffer(&self, relation: RelationId) -> &RowBuffer {
        &self.buffers[&relation]
    }

    pub fn into_buffers(self) -> HashMap<RelationId, RowBuffer> {
        self.buffers
    }

    /// The row filtering state machine (spec §4.6 "Row filtering rules"): a
    /// `rel_database` record is accepted iff its name matches and it hasn't already
    /// been accepted once; a `rel_attachments` record is accepted iff its parent
    /// database was accepted and the requester is either a locksmith or the
    /// attachment's own user; every other record type rides on the most recently
    /// accepted attachment window.
    fn decode_and_filter(
        &mut self,
        bytes: &[u8],
        identity: &AttachmentIdentity,
        owner_tx: TransactionId,
        inputs: &SnapshotInputs<'_>,
    ) -> MonitorResult<()> {
        let mut database_accepted = false;
        let mut db_already_emitted = false;
        let mut attachment_accepted = false;
        let mut attachment_charset = Charset::Utf8;
        let mut local_ids = LocalIdMap::new();

        let mut dec = Decoder::new(bytes);
        while let Some(relation_raw) = dec.next_record()? {
            let Ok(relation) = RelationId::try_from(relation_raw) else {
                // Unrecognized relation id: drain its fields (next_record will do this
                // automatically on the following call) and move on without
                // materializing anything. Nothing to do here explicitly.
                continue;
            };

            match relation {
                RelationId::Database => {
                    let fields = Self::drain_fields(&mut dec)?;
                    let db_name = fields.first().and_then(|f| f.as_str());
                    let accept = !db_already_emitted
                        && db_name == Some(identity.database_name.as_str());
                    if accept {
                        db_already_emitted = true;
                        database_accepted = true;
                        self.materialize(relation, &fields, &mut local_ids, owner_tx, inputs)?;
                    }
                }
                RelationId::Attachments => {
                    let fields = Self::drain_fields(&mut dec)?;
                    let att_user = fields.first().and_then(|f| f.as_str());
                    let accept = database_accepted
                        && (identity.locksmith || att_user == Some(identity.user_name.as_str()));
                    attachment_accepted = accept;
                    if accept {
                        attachment_charset = fields
                            .iter()
                            .find(|f| f.field_id == field::ATT_CHARSET)
                            .and_then(|f| f.as_i64())
                            .map(Charset::from_code)
                            .unwrap_or(Charset::Utf8);
                        self.materialize(relation, &fields, &mut local_ids, owner_tx, inputs)?;
                    }
                }
                other => {
                    if database_accepted && attachment_accepted {
                        let fields = Self::drain_fields(&mut dec)?;
                        self.materialize_with_charset(
                            other,
                            &fields,
                            &mut local_ids,
                            owner_tx,
                            inputs,
                            attachment_charset,
                        )?;
                    }
                    // Otherwise leave the fields undrained; the next `next_record()`
                    // call skips them for us.
                }
            }
        }

        Ok(())
    }

    fn drain_fields(dec: &mut Decoder<'_>) -> MonitorResult<Vec<DumpField>> {
        let mut fields = Vec::new();
        while let Some(field) = dec.next_field()? {
            fields.push(field);
        }
        Ok(fields)
    }

    fn materialize(
        &mut self,
        relation: RelationId,
        fields: &[DumpField],
        local_ids: &mut LocalIdMap,
        owner_tx: TransactionId,
        inputs: &SnapshotInputs<'_>,
    ) -> MonitorResult<()> {
        self.materialize_with_charset(relation, fields, local_ids, owner_tx, inputs, Charset::Utf8)
    }

    /// `source_charset` is the charset the *source* attachment wrote these field
    /// bytes under; it only matters for `Text` columns whose *target* declared
    /// charset is `Metadata` (spec §4.6 "Type conversion" / scenario 5).
    fn materialize_with_charset(
        &mut self,
        relation: RelationId,
        fields: &[DumpField],
        local_ids: &mut LocalIdMap,
        owner_tx: TransactionId,
        inputs: &SnapshotInputs<'_>,
        source_charset: Charset,
    ) -> MonitorResult<()> {
        let format: Format = inputs.formats.format_for(relation);
        let mut row = Row::default();

        for (index, column) in format.columns.iter().enumerate() {
            let Some(field) = fields.iter().find(|f| f.field_id == column.field_id) else {
                continue;
            };
            let value = match column.kind {
                ColumnKind::Integer => field
                    .as_i64()
                    .map(Value::Integer)
                    .ok_or_else(|| MonitorError::DecodeError("integer field malformed".into()))?,
                ColumnKind::Timestamp => field
                    .as_i64()
                    .map(Value::Timestamp)
                    .ok_or_else(|| MonitorError::DecodeError("timestamp field malformed".into()))?,
                ColumnKind::LocalId => {
                    let raw = field
                        .as_i64()
                        .ok_or_else(|| MonitorError::DecodeError("global id field malformed".into()))?;
                    let local = local_ids.local_id_for(GlobalId(raw));
                    Value::LocalId(local.0)
                }
                ColumnKind::Text { charset: target_charset, is_blob } => {
                    let text = if source_charset == Charset::None && target_charset == Charset::Metadata {
                        substitute_non_ascii(&field.payload)
                    } else {
                        String::from_utf8_lossy(&field.payload).into_owned()
                    };
                    if is_blob {
                        let handle = BlobHandle(self.next_blob_handle.fetch_add(1, Ordering::Relaxed));
                        inputs.blob_arena.reparent(handle, owner_tx);
                    }
                    Value::Text(text)
                }
            };
            row.set(index, value);
        }

        self.buffers.get_mut(&relation).expect("every relation has a pre-allocated buffer").append(row);
        Ok(())
    }
}

/// Replaces every non-ASCII byte with `?`, one-for-one, rather than decoding the
/// payload as text first (spec §4.6 scenario 5: `"café"` as raw NONE-charset bytes
/// `63 61 66 C3 A9` becomes `"caf??"`, one `?` per offending *byte*, not per
/// malformed character).
fn substitute_non_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}
